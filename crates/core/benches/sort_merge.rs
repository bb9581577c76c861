//! Benchmarks for the hot paths: external sorting and line merging.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use geo::{coord, Geometry, LineString};
use tilesmith_core::feature::{RenderedFeature, SortableFeature};
use tilesmith_core::merge::merge_line_strings;
use tilesmith_core::sort::{ExternalMergeSort, FeatureSort};
use tilesmith_core::vector_tile::{Attrs, Feature, VectorGeometry};
use tilesmith_core::{Config, TileCoord};

fn lcg(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    *state >> 16
}

fn bench_external_sort(c: &mut Criterion) {
    c.bench_function("external_sort_50k_spilled", |b| {
        b.iter(|| {
            let scratch = TempDir::new().unwrap();
            let config = Config::default()
                .with_chunk_memory_budget_bytes(256 * 1024)
                .with_sort_parallelism(1);
            let mut sorter = ExternalMergeSort::new(scratch.path(), &config, None).unwrap();
            let mut state = 1u64;
            for i in 0..50_000u64 {
                let key = lcg(&mut state);
                sorter
                    .add(SortableFeature::new(key, i.to_le_bytes().to_vec()))
                    .unwrap();
            }
            let count = sorter.iter().unwrap().count();
            black_box(count)
        })
    });
}

fn bench_feature_encode(c: &mut Criterion) {
    let ls = LineString::new(
        (0..32)
            .map(|i| coord! {x: i as f64 * 8.0, y: (i % 5) as f64})
            .collect(),
    );
    let mut attrs = Attrs::new();
    attrs.insert("class".to_string(), "primary".into());
    attrs.insert("oneway".to_string(), true.into());
    let feature = Arc::new(Feature::new(
        "roads",
        42,
        VectorGeometry::from_geometry(&Geometry::LineString(ls)).unwrap(),
        attrs,
    ));

    c.bench_function("encode_rendered_feature", |b| {
        let group = tilesmith_core::FeatureGroup::new_in_memory(
            Arc::new(tilesmith_core::profile::NullProfile),
            Arc::new(tilesmith_core::stats::InMemoryStats::new()),
        );
        let mut encoder = group.new_feature_encoder();
        let rendered = RenderedFeature::new(TileCoord::new(5, 6, 7), feature.clone(), 3, None);
        b.iter(|| black_box(encoder.encode(&rendered).unwrap()));
    });
}

fn bench_line_merge(c: &mut Criterion) {
    // a long chain of segments that all merge into one polyline
    let features: Vec<Feature> = (0..200)
        .map(|i| {
            let x = i as f64;
            let ls = LineString::new(vec![
                coord! {x: x, y: (i % 3) as f64},
                coord! {x: x + 1.0, y: ((i + 1) % 3) as f64},
            ]);
            Feature::new(
                "roads",
                i as i64,
                VectorGeometry::from_geometry(&Geometry::LineString(ls)).unwrap(),
                Attrs::new(),
            )
        })
        .collect();

    c.bench_function("merge_200_chained_segments", |b| {
        b.iter(|| black_box(merge_line_strings(&features, 0.0, 0.5, 4.0).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_external_sort,
    bench_feature_encode,
    bench_line_merge
);
criterion_main!(benches);
