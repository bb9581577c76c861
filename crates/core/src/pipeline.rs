//! Pipeline driver - wires encoding, sorting, grouping, and tile assembly.
//!
//! The driver owns a [`FeatureGroup`] and moves features through three
//! phases:
//!
//! 1. **Ingest**: [`Pipeline::feed`] serializes rendered features and hands
//!    them to the sorter. Back-pressure is implicit: a full chunk spills to
//!    disk before `feed` returns, so producer memory stays bounded by the
//!    configured chunk budget.
//! 2. **Sort**: triggered once by the first call to [`Pipeline::run`].
//! 3. **Assemble**: tiles stream out in ascending tile-id order; each is
//!    post-processed per layer through the profile and handed to the sink.
//!
//! The cancellation token is polled between sort chunks and between tiles.
//! I/O failures abort the run; geometry failures were already demoted to
//! per-layer fallbacks by the tile assembly.

use std::sync::Arc;

use crate::feature::RenderedFeature;
use crate::group::FeatureGroup;
use crate::profile::Profile;
use crate::stats::Stats;
use crate::tile::TileCoord;
use crate::vector_tile::TileEncoder;
use crate::{CancelToken, Config, Error, Result};

/// One assembled tile ready for the downstream wire encoder.
#[derive(Debug)]
pub struct TileOutput {
    /// The tile position.
    pub coord: TileCoord,
    /// Post-processed layers in draw order.
    pub encoder: TileEncoder,
    /// Features read for this tile, including group-limit discards.
    pub num_features_processed: u64,
    /// Features that survived group limits.
    pub num_features_to_emit: u64,
}

/// Owns the feature group and drives features from ingest to emitted tiles.
pub struct Pipeline {
    config: Config,
    group: FeatureGroup,
    stats: Arc<dyn Stats>,
    cancel: CancelToken,
}

impl Pipeline {
    /// Disk-backed pipeline spilling under `config.temp_dir`.
    pub fn new(profile: Arc<dyn Profile>, stats: Arc<dyn Stats>, config: Config) -> Result<Self> {
        let cancel = CancelToken::new();
        let group = FeatureGroup::new_disk_backed(
            &config.temp_dir,
            profile,
            Arc::clone(&stats),
            &config,
            Some(cancel.clone()),
        )?;
        Ok(Self {
            config,
            group,
            stats,
            cancel,
        })
    }

    /// Fully in-memory pipeline for tests and small extracts.
    pub fn in_memory(profile: Arc<dyn Profile>, stats: Arc<dyn Stats>) -> Self {
        Self {
            config: Config::default(),
            group: FeatureGroup::new_in_memory(profile, Arc::clone(&stats)),
            stats,
            cancel: CancelToken::new(),
        }
    }

    /// Token to cancel this pipeline from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The clip window `[min, max]` implied by the configured tile extent
    /// and buffer, for profiles that clip in post-processing.
    pub fn clip_window(&self) -> (f64, f64) {
        let buffer = self.config.buffer_pixels as f64;
        (-buffer, self.config.tile_extent as f64 + buffer)
    }

    /// Underlying group, for callers that need encoder or stats access.
    pub fn group(&self) -> &FeatureGroup {
        &self.group
    }

    /// Serialize and ingest rendered features from a producer.
    pub fn feed<I>(&mut self, features: I) -> Result<()>
    where
        I: IntoIterator<Item = RenderedFeature>,
    {
        let mut encoder = self.group.new_feature_encoder();
        let mut accepted = 0u64;
        for rendered in features {
            let entry = encoder.encode(&rendered)?;
            self.group.accept(entry)?;
            accepted += 1;
        }
        self.stats.count("features_ingested", accepted);
        Ok(())
    }

    /// Sort, then stream every tile to `sink` in ascending tile-id order.
    pub fn run<F>(&mut self, mut sink: F) -> Result<()>
    where
        F: FnMut(TileOutput) -> Result<()>,
    {
        let stage = self.stats.start_stage("tile_assembly");
        let mut num_tiles = 0u64;
        for tile in self.group.iter()? {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let tile = tile?;
            let encoder = tile.to_tile_encoder()?;
            sink(TileOutput {
                coord: tile.tile_coord(),
                encoder,
                num_features_processed: tile.num_features_processed(),
                num_features_to_emit: tile.num_features_to_emit(),
            })?;
            num_tiles += 1;
        }
        self.stats.count("tiles_emitted", num_tiles);
        self.stats
            .gauge("sort_disk_bytes", self.group.disk_usage_bytes() as f64);
        stage.finish();
        Ok(())
    }

    pub fn num_features_written(&self) -> u64 {
        self.group.num_features_written()
    }

    pub fn disk_usage_bytes(&self) -> u64 {
        self.group.disk_usage_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::Group;
    use crate::geometry::GeometryError;
    use crate::merge::merge_line_strings;
    use crate::profile::NullProfile;
    use crate::stats::InMemoryStats;
    use crate::vector_tile::{Attrs, Feature, VectorGeometry};
    use geo::{coord, Geometry, LineString};

    fn line_feature(layer: &str, id: i64, coords: &[(f64, f64)]) -> Arc<Feature> {
        let ls = LineString::new(coords.iter().map(|&(x, y)| coord! {x: x, y: y}).collect());
        Arc::new(Feature::new(
            layer,
            id,
            VectorGeometry::from_geometry(&Geometry::LineString(ls)).unwrap(),
            Attrs::new(),
        ))
    }

    fn rendered(tile: TileCoord, f: &Arc<Feature>, z: i32) -> RenderedFeature {
        RenderedFeature::new(tile, f.clone(), z, None)
    }

    struct MergeProfile;

    impl Profile for MergeProfile {
        fn post_process_layer_features(
            &self,
            _layer: &str,
            _zoom: u8,
            features: &[Feature],
        ) -> std::result::Result<Option<Vec<Feature>>, GeometryError> {
            merge_line_strings(features, 0.0, 0.0, 0.0).map(Some)
        }
    }

    struct FailingProfile;

    impl Profile for FailingProfile {
        fn post_process_layer_features(
            &self,
            _layer: &str,
            _zoom: u8,
            _features: &[Feature],
        ) -> std::result::Result<Option<Vec<Feature>>, GeometryError> {
            Err(GeometryError::new("postprocess_test", "always fails"))
        }
    }

    #[test]
    fn test_pipeline_emits_tiles_in_order() {
        let stats = Arc::new(InMemoryStats::new());
        let mut pipeline = Pipeline::in_memory(Arc::new(NullProfile), stats.clone());

        let f = line_feature("roads", 1, &[(0.0, 0.0), (5.0, 5.0)]);
        pipeline
            .feed(vec![
                rendered(TileCoord::new(1, 1, 1), &f, 0),
                rendered(TileCoord::new(0, 0, 1), &f, 0),
                rendered(TileCoord::new(0, 0, 3), &f, 0),
            ])
            .unwrap();
        assert_eq!(pipeline.num_features_written(), 3);

        let mut coords = Vec::new();
        pipeline
            .run(|tile| {
                coords.push(tile.coord);
                Ok(())
            })
            .unwrap();
        assert_eq!(
            coords,
            vec![
                TileCoord::new(0, 0, 1),
                TileCoord::new(1, 1, 1),
                TileCoord::new(0, 0, 3),
            ]
        );
        assert_eq!(stats.counter_value("features_ingested"), 3);
        assert_eq!(stats.counter_value("tiles_emitted"), 3);
    }

    #[test]
    fn test_pipeline_post_processes_layers() {
        let mut pipeline =
            Pipeline::in_memory(Arc::new(MergeProfile), Arc::new(InMemoryStats::new()));
        let a = line_feature("roads", 1, &[(0.0, 0.0), (1.0, 0.0)]);
        let b = line_feature("roads", 2, &[(1.0, 0.0), (2.0, 0.0)]);
        let tile = TileCoord::new(0, 0, 0);
        pipeline
            .feed(vec![rendered(tile, &a, 0), rendered(tile, &b, 1)])
            .unwrap();

        let mut outputs = Vec::new();
        pipeline
            .run(|tile| {
                outputs.push(tile);
                Ok(())
            })
            .unwrap();
        assert_eq!(outputs.len(), 1);
        let layers = outputs[0].encoder.layers();
        assert_eq!(layers.len(), 1);
        assert_eq!(layers[0].features.len(), 1, "profile merged the segments");
    }

    #[test]
    fn test_post_process_failure_demotes_to_original() {
        let stats = Arc::new(InMemoryStats::new());
        let mut pipeline = Pipeline::in_memory(Arc::new(FailingProfile), stats.clone());
        let f = line_feature("roads", 1, &[(0.0, 0.0), (1.0, 0.0)]);
        pipeline
            .feed(vec![rendered(TileCoord::new(0, 0, 0), &f, 0)])
            .unwrap();

        let mut outputs = Vec::new();
        pipeline
            .run(|tile| {
                outputs.push(tile);
                Ok(())
            })
            .unwrap();
        // the unprocessed feature is still emitted, and the failure is counted
        assert_eq!(outputs[0].encoder.num_features(), 1);
        assert_eq!(stats.data_error_count("postprocess_test"), 1);
    }

    #[test]
    fn test_cancellation_stops_between_tiles() {
        let mut pipeline =
            Pipeline::in_memory(Arc::new(NullProfile), Arc::new(InMemoryStats::new()));
        let f = line_feature("roads", 1, &[(0.0, 0.0), (1.0, 0.0)]);
        for x in 0..4 {
            pipeline
                .feed(vec![rendered(TileCoord::new(x, 0, 2), &f, 0)])
                .unwrap();
        }
        let token = pipeline.cancel_token();
        token.cancel();
        let result = pipeline.run(|_| Ok(()));
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_sink_error_propagates() {
        let mut pipeline =
            Pipeline::in_memory(Arc::new(NullProfile), Arc::new(InMemoryStats::new()));
        let f = line_feature("roads", 1, &[(0.0, 0.0), (1.0, 0.0)]);
        pipeline
            .feed(vec![rendered(TileCoord::new(0, 0, 0), &f, 0)])
            .unwrap();
        let result = pipeline.run(|_| {
            Err(Error::Codec("sink rejected the tile".to_string()))
        });
        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn test_clip_window() {
        let pipeline =
            Pipeline::in_memory(Arc::new(NullProfile), Arc::new(InMemoryStats::new()));
        let (min, max) = pipeline.clip_window();
        assert_eq!(min, -4.0);
        assert_eq!(max, 260.0);
    }

    #[test]
    fn test_group_limits_counted_in_output() {
        let mut pipeline =
            Pipeline::in_memory(Arc::new(NullProfile), Arc::new(InMemoryStats::new()));
        let f = line_feature("poi", 1, &[(0.0, 0.0), (1.0, 0.0)]);
        let tile = TileCoord::new(0, 0, 0);
        let grouping = Some(Group { group: 7, limit: 2 });
        let features: Vec<RenderedFeature> = (0..4)
            .map(|_| RenderedFeature::new(tile, f.clone(), 5, grouping))
            .collect();
        pipeline.feed(features).unwrap();

        let mut outputs = Vec::new();
        pipeline
            .run(|tile| {
                outputs.push(tile);
                Ok(())
            })
            .unwrap();
        assert_eq!(outputs[0].num_features_processed, 4);
        assert_eq!(outputs[0].num_features_to_emit, 2);
    }
}
