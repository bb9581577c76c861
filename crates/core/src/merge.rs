//! Per-tile feature merging.
//!
//! Profiles call these from [`Profile::post_process_layer_features`]
//! (`crate::profile::Profile`) to combine the many small features a tile
//! accumulates into few large ones:
//!
//! - [`merge_line_strings`] joins connected road/river segments that share
//!   attributes, re-simplifies the joined polylines, and optionally strips
//!   detail outside the tile window.
//! - [`merge_polygons`] unions landcover polygons that sit within a given
//!   distance of each other through a morphological closing (buffer out,
//!   buffer back in with mitre joins).
//!
//! Both operate per attribute-equivalence group: features whose attribute
//! maps encode to identical bytes. Groups keep first-seen order so output
//! stays deterministic.

use std::collections::HashMap;

use geo::{BoundingRect, Coord, EuclideanLength, Geometry, LineString, Polygon};
use rstar::{RTree, RTreeObject, AABB};

use crate::geometry::{
    buffer_mitre, collection, combine_line_strings, combine_polygons, extract_polygons,
    is_within_distance, ring_area, snap_and_fix_polygon, GeomType, GeometryError, LineMerger,
};
use crate::simplify::simplify_line_string;
use crate::vector_tile::{AttrValue, Attrs, Feature, VectorGeometry};

/// Tile extent in pixels; the clip window is `[-clip, extent + clip]` squared.
pub const TILE_EXTENT_PIXELS: f64 = 256.0;

/// Merge connected line features that share attributes.
///
/// Merged polylines shorter than `min_length` are discarded, polylines with
/// more than two points are re-simplified at `tolerance` (merging makes
/// interior endpoints of the original segments redundant), and when
/// `clip > 0` detail outside `[-clip, 256 + clip]` squared is removed.
/// Non-line features pass through untouched.
pub fn merge_line_strings(
    features: &[Feature],
    min_length: f64,
    tolerance: f64,
    clip: f64,
) -> Result<Vec<Feature>, GeometryError> {
    merge_line_strings_with(features, &|_| min_length, tolerance, clip)
}

/// [`merge_line_strings`] with a per-attribute-group length limit, for layers
/// like transportation where the cutoff depends on the road class.
pub fn merge_line_strings_with(
    features: &[Feature],
    length_limit: &dyn Fn(&Attrs) -> f64,
    tolerance: f64,
    clip: f64,
) -> Result<Vec<Feature>, GeometryError> {
    let mut result = Vec::with_capacity(features.len());
    for group in group_by_attrs(features, &mut result, GeomType::Line) {
        let first = group[0];
        let limit = length_limit(&first.attrs);

        // a lone feature that cannot be clipped or length-filtered is
        // already in final form
        if group.len() == 1 && clip == 0.0 && limit == 0.0 {
            result.push(first.clone());
            continue;
        }

        let mut merger = LineMerger::default();
        for feature in &group {
            merger.add(&feature.geometry.decode()?);
        }

        let mut output: Vec<LineString<f64>> = Vec::new();
        for merged in merger.merged_line_strings() {
            if merged.euclidean_length() < limit {
                continue;
            }
            let line = if merged.0.len() > 2 {
                simplify_line_string(&merged, tolerance)
            } else {
                merged
            };
            if clip > 0.0 {
                remove_detail_outside_tile(&line, clip, &mut output);
            } else {
                output.push(line);
            }
        }

        if !output.is_empty() {
            let geometry = VectorGeometry::from_geometry(&combine_line_strings(output))?;
            result.push(first.copy_with_new_geometry(geometry));
        }
    }
    Ok(result)
}

/// Strip line detail outside the clip window, splitting where the line
/// leaves it.
///
/// A segment is kept when its envelope intersects the window or the previous
/// segment was kept; a pending piece is only flushed after two consecutive
/// outside segments. The one-segment hysteresis deliberately lets a short
/// tail poke past the window so adjacent tiles stay visually compatible.
fn remove_detail_outside_tile(input: &LineString<f64>, buffer: f64, output: &mut Vec<LineString<f64>>) {
    let seq = &input.0;
    if seq.len() < 2 {
        return;
    }
    let min = -buffer;
    let max = TILE_EXTENT_PIXELS + buffer;
    let mut current: Vec<Coord<f64>> = Vec::new();
    let mut was_in = false;
    let mut x = seq[0].x;
    let mut y = seq[0].y;

    for i in 0..seq.len() - 1 {
        let next_x = seq[i + 1].x;
        let next_y = seq[i + 1].y;
        let now_in = segment_env_intersects(x, next_x, y, next_y, min, max);
        if now_in || was_in {
            current.push(Coord { x, y });
        } else if !current.is_empty() {
            output.push(LineString::new(std::mem::take(&mut current)));
        }
        was_in = now_in;
        x = next_x;
        y = next_y;
    }

    let last_x = seq[seq.len() - 1].x;
    let last_y = seq[seq.len() - 1].y;
    if segment_env_intersects(x, last_x, y, last_y, min, max) || was_in {
        current.push(Coord { x: last_x, y: last_y });
    }

    if !current.is_empty() {
        output.push(LineString::new(current));
    }
}

fn segment_env_intersects(x1: f64, x2: f64, y1: f64, y2: f64, min: f64, max: f64) -> bool {
    x1.max(x2) >= min && x1.min(x2) <= max && y1.max(y2) >= min && y1.min(y2) <= max
}

/// Union polygon features that share attributes and sit within `min_dist` of
/// each other.
///
/// Proximity components are found through an R-tree over envelopes expanded
/// by `min_dist`. Each multi-member component is closed morphologically:
/// buffered out by `buffer` with mitre joins, then back in by the same amount
/// (only the positive half runs when `buffer` is zero). Results whose
/// exterior ring encloses less than `min_area` are dropped, as are
/// single-member components below the area cutoff. Non-polygon features pass
/// through untouched.
pub fn merge_polygons(
    features: &[Feature],
    min_area: f64,
    min_dist: f64,
    buffer: f64,
) -> Result<Vec<Feature>, GeometryError> {
    let mut result = Vec::with_capacity(features.len());
    for group in group_by_attrs(features, &mut result, GeomType::Polygon) {
        let first = group[0];
        let mut geometries = Vec::with_capacity(group.len());
        for feature in &group {
            geometries.push(feature.geometry.decode()?);
        }

        let mut out_polygons: Vec<Polygon<f64>> = Vec::new();
        for component in group_polygons_by_proximity(&geometries, min_dist) {
            if component.len() > 1 {
                let members = collection(
                    component.iter().map(|&i| geometries[i].clone()).collect(),
                );
                let mut merged = buffer_mitre(&members, buffer)?;
                if buffer > 0.0 {
                    merged = buffer_mitre(&merged, -buffer)?;
                }
                let Geometry::Polygon(poly) = merged else {
                    continue;
                };
                if ring_area(poly.exterior()) < min_area {
                    continue;
                }
                let fixed = snap_and_fix_polygon(&Geometry::Polygon(poly))?;
                extract_polygons(&fixed, &mut out_polygons);
            } else {
                let Geometry::Polygon(poly) = &geometries[component[0]] else {
                    continue;
                };
                if ring_area(poly.exterior()) < min_area {
                    continue;
                }
                out_polygons.push(poly.clone());
            }
        }

        if !out_polygons.is_empty() {
            let geometry = VectorGeometry::from_geometry(&combine_polygons(out_polygons))?;
            result.push(first.copy_with_new_geometry(geometry));
        }
    }
    Ok(result)
}

/// Bucket features by byte-identical attribute maps, preserving first-seen
/// group order. Features of other geometry kinds go straight to `result`.
fn group_by_attrs<'a>(
    features: &'a [Feature],
    result: &mut Vec<Feature>,
    geom_type: GeomType,
) -> Vec<Vec<&'a Feature>> {
    let mut groups: Vec<Vec<&'a Feature>> = Vec::new();
    let mut index: HashMap<Vec<u8>, usize> = HashMap::new();
    for feature in features {
        if feature.geometry.geom_type() != geom_type {
            result.push(feature.clone());
            continue;
        }
        let key = attr_group_key(&feature.attrs);
        match index.entry(key) {
            std::collections::hash_map::Entry::Occupied(e) => groups[*e.get()].push(feature),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(groups.len());
                groups.push(vec![feature]);
            }
        }
    }
    groups
}

/// Canonical byte encoding of an attribute map. `Attrs` iterates in key
/// order, so equal maps always produce equal bytes.
fn attr_group_key(attrs: &Attrs) -> Vec<u8> {
    let mut buf = Vec::with_capacity(attrs.len() * 16);
    for (key, value) in attrs {
        // infallible: writing msgpack into a Vec cannot fail
        let _ = rmp::encode::write_str(&mut buf, key);
        let _ = match value {
            AttrValue::Str(s) => rmp::encode::write_str(&mut buf, s),
            AttrValue::Int(i) => rmp::encode::write_sint(&mut buf, *i).map(|_| ()),
            AttrValue::Float(f) => rmp::encode::write_f64(&mut buf, *f).map(|_| ()),
            AttrValue::Bool(b) => {
                let _ = rmp::encode::write_bool(&mut buf, *b);
                Ok(())
            }
        };
    }
    buf
}

struct IndexedEnvelope {
    env: AABB<[f64; 2]>,
    index: usize,
}

impl RTreeObject for IndexedEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.env
    }
}

/// Partition geometry indices into connected components where edges join
/// geometries within `min_dist` of each other.
fn group_polygons_by_proximity(geometries: &[Geometry<f64>], min_dist: f64) -> Vec<Vec<usize>> {
    let adjacency = extract_adjacency_list(geometries, min_dist);
    extract_connected_components(&adjacency, geometries.len())
}

fn extract_adjacency_list(
    geometries: &[Geometry<f64>],
    min_dist: f64,
) -> HashMap<usize, Vec<usize>> {
    let mut items = Vec::with_capacity(geometries.len());
    for (i, geom) in geometries.iter().enumerate() {
        if let Some(rect) = geom.bounding_rect() {
            items.push(IndexedEnvelope {
                env: AABB::from_corners(
                    [rect.min().x - min_dist, rect.min().y - min_dist],
                    [rect.max().x + min_dist, rect.max().y + min_dist],
                ),
                index: i,
            });
        }
    }
    let tree = RTree::bulk_load(items);

    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
    for (i, geom) in geometries.iter().enumerate() {
        let Some(rect) = geom.bounding_rect() else {
            continue;
        };
        let query = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);
        for candidate in tree.locate_in_envelope_intersecting(&query) {
            let j = candidate.index;
            if j <= i {
                continue;
            }
            if is_within_distance(geom, &geometries[j], min_dist) {
                adjacency.entry(i).or_default().push(j);
                adjacency.entry(j).or_default().push(i);
            }
        }
    }
    adjacency
}

/// Iterative depth-first search; fully connected landcover can have
/// thousands of polygons in one component, too deep for recursion.
fn extract_connected_components(
    adjacency: &HashMap<usize, Vec<usize>>,
    num_items: usize,
) -> Vec<Vec<usize>> {
    let mut visited = vec![false; num_items];
    let mut components = Vec::new();
    let mut stack: Vec<usize> = Vec::new();

    for start in 0..num_items {
        if visited[start] {
            continue;
        }
        visited[start] = true;
        let mut component = vec![start];
        stack.push(start);
        while let Some(node) = stack.pop() {
            if let Some(neighbors) = adjacency.get(&node) {
                for &next in neighbors {
                    if !visited[next] {
                        visited[next] = true;
                        component.push(next);
                        stack.push(next);
                    }
                }
            }
        }
        components.push(component);
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{coord, polygon};

    fn line_feature(layer: &str, id: i64, coords: &[(f64, f64)], attrs: Attrs) -> Feature {
        let ls = LineString::new(
            coords.iter().map(|&(x, y)| coord! {x: x, y: y}).collect(),
        );
        Feature::new(
            layer,
            id,
            VectorGeometry::from_geometry(&Geometry::LineString(ls)).unwrap(),
            attrs,
        )
    }

    fn square_feature(layer: &str, id: i64, x0: f64, y0: f64, x1: f64, y1: f64) -> Feature {
        let poly = polygon![
            (x: x0, y: y0),
            (x: x1, y: y0),
            (x: x1, y: y1),
            (x: x0, y: y1),
            (x: x0, y: y0),
        ];
        Feature::new(
            layer,
            id,
            VectorGeometry::from_geometry(&Geometry::Polygon(poly)).unwrap(),
            Attrs::new(),
        )
    }

    fn attrs_with(key: &str, value: &str) -> Attrs {
        let mut attrs = Attrs::new();
        attrs.insert(key.to_string(), AttrValue::from(value));
        attrs
    }

    #[test]
    fn test_collinear_lines_merge_to_one() {
        let features = vec![
            line_feature("roads", 1, &[(0.0, 0.0), (1.0, 0.0)], Attrs::new()),
            line_feature("roads", 2, &[(1.0, 0.0), (2.0, 0.0)], Attrs::new()),
        ];
        let merged = merge_line_strings(&features, 0.0, 0.0, 0.0).unwrap();
        assert_eq!(merged.len(), 1);

        let Geometry::LineString(ls) = merged[0].geometry.decode().unwrap() else {
            panic!("expected line string");
        };
        assert_eq!(
            ls.0,
            vec![coord! {x: 0.0, y: 0.0}, coord! {x: 2.0, y: 0.0}],
            "interior endpoint simplified away"
        );
        assert_eq!(merged[0].id, 1, "merged feature reuses first input");
    }

    #[test]
    fn test_different_attrs_do_not_merge() {
        let features = vec![
            line_feature("roads", 1, &[(0.0, 0.0), (1.0, 0.0)], attrs_with("class", "a")),
            line_feature("roads", 2, &[(1.0, 0.0), (2.0, 0.0)], attrs_with("class", "b")),
        ];
        let merged = merge_line_strings(&features, 0.0, 1.0, 0.0).unwrap();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_single_feature_fast_path() {
        let features = vec![line_feature(
            "roads",
            9,
            &[(0.0, 0.0), (5.0, 5.0)],
            Attrs::new(),
        )];
        let merged = merge_line_strings(&features, 0.0, 0.5, 0.0).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0], features[0]);
    }

    #[test]
    fn test_short_lines_filtered_by_length() {
        let features = vec![
            line_feature("roads", 1, &[(0.0, 0.0), (0.5, 0.0)], Attrs::new()),
            line_feature("roads", 2, &[(10.0, 0.0), (30.0, 0.0)], attrs_with("class", "x")),
        ];
        let merged = merge_line_strings(&features, 5.0, 0.0, 0.0).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, 2);
    }

    #[test]
    fn test_length_limit_by_attrs() {
        let features = vec![
            line_feature("roads", 1, &[(0.0, 0.0), (3.0, 0.0)], attrs_with("class", "minor")),
            line_feature("roads", 2, &[(0.0, 5.0), (3.0, 5.0)], attrs_with("class", "major")),
        ];
        let merged = merge_line_strings_with(
            &features,
            &|attrs| match attrs.get("class") {
                Some(AttrValue::Str(s)) if s == "minor" => 10.0,
                _ => 0.0,
            },
            0.0,
            0.0,
        )
        .unwrap();
        // the minor road is below its 10px limit, the major one survives
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, 2);
    }

    #[test]
    fn test_clip_keeps_one_segment_hysteresis_tail() {
        let features = vec![line_feature(
            "roads",
            1,
            &[(-5.0, -5.0), (10.0, 10.0), (300.0, 300.0)],
            Attrs::new(),
        )];
        let merged = merge_line_strings(&features, 0.0, 0.0, 4.0).unwrap();
        assert_eq!(merged.len(), 1);

        let Geometry::LineString(ls) = merged[0].geometry.decode().unwrap() else {
            panic!("expected a single line string");
        };
        // the (300,300) tail survives because the previous segment was kept
        assert_eq!(
            ls.0,
            vec![
                coord! {x: -5.0, y: -5.0},
                coord! {x: 10.0, y: 10.0},
                coord! {x: 300.0, y: 300.0},
            ]
        );
    }

    #[test]
    fn test_clip_splits_line_leaving_and_reentering() {
        // in-window, far outside for 3 segments, back in-window; points are
        // non-collinear so the pre-clip simplification keeps them all
        let features = vec![line_feature(
            "roads",
            1,
            &[
                (10.0, 10.0),
                (20.0, 15.0),
                (600.0, 10.0),
                (700.0, 15.0),
                (800.0, 10.0),
                (900.0, 15.0),
                (30.0, 20.0),
                (40.0, 25.0),
            ],
            Attrs::new(),
        )];
        let merged = merge_line_strings(&features, 0.0, 0.0, 4.0).unwrap();
        assert_eq!(merged.len(), 1);
        let Geometry::MultiLineString(mls) = merged[0].geometry.decode().unwrap() else {
            panic!("expected the clip to split the line");
        };
        assert_eq!(mls.0.len(), 2);
    }

    #[test]
    fn test_non_line_features_pass_through() {
        let square = square_feature("landcover", 5, 0.0, 0.0, 10.0, 10.0);
        let features = vec![
            square.clone(),
            line_feature("roads", 1, &[(0.0, 0.0), (1.0, 0.0)], Attrs::new()),
            line_feature("roads", 2, &[(1.0, 0.0), (2.0, 0.0)], Attrs::new()),
        ];
        let merged = merge_line_strings(&features, 0.0, 0.0, 0.0).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], square);
    }

    #[test]
    fn test_nearby_squares_union_into_one() {
        let features = vec![
            square_feature("landcover", 1, 0.0, 0.0, 10.0, 10.0),
            square_feature("landcover", 2, 12.0, 0.0, 22.0, 10.0),
        ];
        let merged = merge_polygons(&features, 10.0, 3.0, 2.0).unwrap();
        assert_eq!(merged.len(), 1);

        let Geometry::Polygon(poly) = merged[0].geometry.decode().unwrap() else {
            panic!("expected one merged polygon");
        };
        let rect = poly.bounding_rect().unwrap();
        // the closing bridges the 2px gap and covers both squares
        assert!(rect.min().x <= 0.0 && rect.max().x >= 22.0);
        assert!(ring_area(poly.exterior()) >= 220.0 - 1e-6);
    }

    #[test]
    fn test_distant_squares_stay_separate() {
        let features = vec![
            square_feature("landcover", 1, 0.0, 0.0, 10.0, 10.0),
            square_feature("landcover", 2, 12.0, 0.0, 22.0, 10.0),
        ];
        let merged = merge_polygons(&features, 10.0, 1.0, 2.0).unwrap();
        assert_eq!(merged.len(), 1, "still one multi-polygon feature");

        let Geometry::MultiPolygon(mp) = merged[0].geometry.decode().unwrap() else {
            panic!("expected two separate polygons");
        };
        assert_eq!(mp.0.len(), 2);
    }

    #[test]
    fn test_small_polygons_filtered_by_area() {
        let features = vec![
            square_feature("landcover", 1, 0.0, 0.0, 2.0, 2.0),
            square_feature("landcover", 2, 100.0, 100.0, 150.0, 150.0),
        ];
        let merged = merge_polygons(&features, 10.0, 1.0, 0.0).unwrap();
        assert_eq!(merged.len(), 1);
        let Geometry::Polygon(poly) = merged[0].geometry.decode().unwrap() else {
            panic!("expected one polygon");
        };
        assert!(ring_area(poly.exterior()) > 2000.0);
    }

    #[test]
    fn test_zero_buffer_runs_positive_half_only() {
        // overlapping squares union even with buffer 0
        let features = vec![
            square_feature("landcover", 1, 0.0, 0.0, 10.0, 10.0),
            square_feature("landcover", 2, 8.0, 0.0, 18.0, 10.0),
        ];
        let merged = merge_polygons(&features, 10.0, 1.0, 0.0).unwrap();
        assert_eq!(merged.len(), 1);
        assert!(matches!(
            merged[0].geometry.decode().unwrap(),
            Geometry::Polygon(_)
        ));
    }

    #[test]
    fn test_connected_components_transitive() {
        // a-b close, b-c close, a-c far: all three still form one component
        let features = vec![
            square_feature("landcover", 1, 0.0, 0.0, 10.0, 10.0),
            square_feature("landcover", 2, 11.0, 0.0, 21.0, 10.0),
            square_feature("landcover", 3, 22.0, 0.0, 32.0, 10.0),
        ];
        let merged = merge_polygons(&features, 1.0, 2.0, 1.0).unwrap();
        assert_eq!(merged.len(), 1);
        assert!(matches!(
            merged[0].geometry.decode().unwrap(),
            Geometry::Polygon(_)
        ));
    }

    #[test]
    fn test_component_chain_does_not_recurse() {
        // long chain of adjacent squares; one component, iterative DFS
        let features: Vec<Feature> = (0..500)
            .map(|i| {
                let x = i as f64 * 11.0;
                square_feature("landcover", i as i64, x, 0.0, x + 10.0, 10.0)
            })
            .collect();
        let merged = merge_polygons(&features, 1.0, 2.0, 1.0).unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn test_attr_group_key_deterministic() {
        let mut a = Attrs::new();
        a.insert("b".to_string(), AttrValue::from(1i64));
        a.insert("a".to_string(), AttrValue::from("x"));
        let mut b = Attrs::new();
        b.insert("a".to_string(), AttrValue::from("x"));
        b.insert("b".to_string(), AttrValue::from(1i64));
        assert_eq!(attr_group_key(&a), attr_group_key(&b));

        let mut c = Attrs::new();
        c.insert("a".to_string(), AttrValue::from("y"));
        assert_ne!(attr_group_key(&a), attr_group_key(&c));
    }
}
