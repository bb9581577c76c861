//! Streaming group-by-tile on top of the sorter.
//!
//! A `FeatureGroup` accepts serialized features in any order, sorts them once
//! ingestion finishes, and iterates them packaged per tile. Writes and reads
//! are both single-threaded; the only cross-thread hand-off is `prepare()`,
//! which is idempotent and first-caller-wins.
//!
//! Layer names and attribute keys are dictionary-compressed to one byte, so
//! a build supports at most 250 distinct values of each (see
//! [`crate::strings::CommonStringEncoder`]).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::feature::{
    decode_feature, extract_has_group, extract_layer, extract_tile, peek_group_info,
    FeatureEncoder, SortableFeature,
};
use crate::profile::Profile;
use crate::sort::{ExternalMergeSort, FeatureSort, InMemorySort};
use crate::stats::{LayerStats, Stats};
use crate::strings::CommonStringEncoder;
use crate::tile::TileCoord;
use crate::vector_tile::{Feature, TileEncoder};
use crate::{CancelToken, Config, Result};

/// Accepts rendered map features in any order and groups them by tile for a
/// reader to iterate through.
pub struct FeatureGroup {
    sorter: Box<dyn FeatureSort>,
    profile: Arc<dyn Profile>,
    stats: Arc<dyn Stats>,
    layer_strings: Arc<CommonStringEncoder>,
    key_strings: Arc<CommonStringEncoder>,
    layer_stats: Arc<LayerStats>,
    prepared: AtomicBool,
}

impl FeatureGroup {
    fn with_sorter(
        sorter: Box<dyn FeatureSort>,
        profile: Arc<dyn Profile>,
        stats: Arc<dyn Stats>,
    ) -> Self {
        Self {
            sorter,
            profile,
            stats,
            layer_strings: Arc::new(CommonStringEncoder::new("layer")),
            key_strings: Arc::new(CommonStringEncoder::new("attribute key")),
            layer_stats: Arc::new(LayerStats::new()),
            prepared: AtomicBool::new(false),
        }
    }

    /// Group that keeps everything in memory. Only suitable for toy
    /// use-cases like unit tests.
    pub fn new_in_memory(profile: Arc<dyn Profile>, stats: Arc<dyn Stats>) -> Self {
        Self::with_sorter(Box::new(InMemorySort::new()), profile, stats)
    }

    /// Group that spills sorted chunks under `temp_dir` and merges them back
    /// on iteration. Suitable for planet-scale builds.
    pub fn new_disk_backed(
        temp_dir: &Path,
        profile: Arc<dyn Profile>,
        stats: Arc<dyn Stats>,
        config: &Config,
        cancel: Option<CancelToken>,
    ) -> Result<Self> {
        let sorter = ExternalMergeSort::new(temp_dir, config, cancel)?;
        Ok(Self::with_sorter(Box::new(sorter), profile, stats))
    }

    /// Returns a serializer for a single producer thread to turn rendered
    /// features into sortable entries.
    pub fn new_feature_encoder(&self) -> FeatureEncoder {
        FeatureEncoder::new(
            Arc::clone(&self.layer_strings),
            Arc::clone(&self.key_strings),
            Arc::clone(&self.layer_stats),
        )
    }

    /// Write a serialized feature to intermediate storage.
    pub fn accept(&mut self, entry: SortableFeature) -> Result<()> {
        self.sorter.add(entry)
    }

    /// Sort features to prepare for grouping. Idempotent; iteration calls it
    /// implicitly.
    pub fn prepare(&mut self) -> Result<()> {
        if !self.prepared.swap(true, Ordering::SeqCst) {
            self.sorter.sort()?;
        }
        Ok(())
    }

    pub fn num_features_written(&self) -> u64 {
        self.sorter.num_features_written()
    }

    pub fn disk_usage_bytes(&self) -> u64 {
        self.sorter.disk_usage_bytes()
    }

    /// Per-layer zoom ranges and counts observed by the feature encoders.
    pub fn layer_stats(&self) -> Arc<LayerStats> {
        Arc::clone(&self.layer_stats)
    }

    /// Iterate through features grouped by tile id. One-shot.
    pub fn iter(&mut self) -> Result<TileFeaturesIter> {
        self.prepare()?;
        Ok(TileFeaturesIter {
            entries: self.sorter.iter()?,
            pending: None,
            context: TileContext {
                profile: Arc::clone(&self.profile),
                stats: Arc::clone(&self.stats),
                layer_strings: Arc::clone(&self.layer_strings),
                key_strings: Arc::clone(&self.key_strings),
            },
        })
    }
}

/// Shared handles a tile needs to decode and post-process itself after the
/// iterator has moved on.
#[derive(Clone)]
struct TileContext {
    profile: Arc<dyn Profile>,
    stats: Arc<dyn Stats>,
    layer_strings: Arc<CommonStringEncoder>,
    key_strings: Arc<CommonStringEncoder>,
}

/// Streams [`TileFeatures`] in ascending tile-id order.
pub struct TileFeaturesIter {
    entries: Box<dyn Iterator<Item = Result<SortableFeature>> + Send>,
    pending: Option<SortableFeature>,
    context: TileContext,
}

impl Iterator for TileFeaturesIter {
    type Item = Result<TileFeatures>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = match self.pending.take() {
            Some(entry) => entry,
            None => match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            },
        };

        let mut tile = TileFeatures::new(extract_tile(first.sort_key()), self.context.clone());
        if let Err(e) = tile.add(first) {
            return Some(Err(e));
        }

        // features arrive tile-contiguous: collect until the tile id changes
        loop {
            match self.entries.next() {
                None => return Some(Ok(tile)),
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(entry)) => {
                    if extract_tile(entry.sort_key()) != tile.tile_coord.encoded() {
                        self.pending = Some(entry);
                        return Some(Ok(tile));
                    }
                    if let Err(e) = tile.add(entry) {
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

/// Features contained in a single tile.
pub struct TileFeatures {
    tile_coord: TileCoord,
    entries: Vec<SortableFeature>,
    num_features_processed: u64,
    // per-group counters for the current layer, allocated on first use
    counts: Option<HashMap<i64, i64>>,
    layer: u8,
    context: TileContext,
}

impl TileFeatures {
    fn new(tile_id: u32, context: TileContext) -> Self {
        Self {
            tile_coord: TileCoord::decode(tile_id),
            entries: Vec::new(),
            num_features_processed: 0,
            counts: None,
            layer: u8::MAX,
            context,
        }
    }

    pub fn tile_coord(&self) -> TileCoord {
        self.tile_coord
    }

    /// Number of features read, including ones discarded for exceeding a
    /// group limit.
    pub fn num_features_processed(&self) -> u64 {
        self.num_features_processed
    }

    /// Number of features that will be emitted.
    pub fn num_features_to_emit(&self) -> u64 {
        self.entries.len() as u64
    }

    fn add(&mut self, entry: SortableFeature) -> Result<()> {
        self.num_features_processed += 1;
        let sort_key = entry.sort_key();
        if extract_has_group(sort_key) {
            let this_layer = extract_layer(sort_key);
            if self.counts.is_none() {
                self.counts = Some(HashMap::new());
                self.layer = this_layer;
            } else if this_layer != self.layer {
                self.layer = this_layer;
                if let Some(counts) = &mut self.counts {
                    counts.clear();
                }
            }
            let info = peek_group_info(entry.value())?;
            if let Some(counts) = &mut self.counts {
                let seen = *counts.get(&info.group).unwrap_or(&0);
                if info.limit > 0 && seen >= info.limit as i64 {
                    // too many features in this group already
                    return Ok(());
                }
                counts.insert(info.group, seen + 1);
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// True when `other` carries features with identical layers, geometries,
    /// and attributes, even though the tiles sit at different coordinates.
    /// Lets the downstream writer deduplicate repeated ocean tiles.
    pub fn has_same_contents(&self, other: &TileFeatures) -> bool {
        if other.entries.len() != self.entries.len() {
            return false;
        }
        for (a, b) in self.entries.iter().zip(&other.entries) {
            if extract_layer(a.sort_key()) != extract_layer(b.sort_key()) || a.value() != b.value()
            {
                return false;
            }
        }
        true
    }

    /// Decode, post-process per layer, and assemble this tile for the
    /// downstream encoder.
    ///
    /// Entries were sorted by descending z-order so the walk runs in reverse
    /// to produce draw order. Contiguous runs of one layer are handed to the
    /// profile; a recoverable post-process failure logs a data error and
    /// falls back to the unprocessed features for that layer.
    pub fn to_tile_encoder(&self) -> Result<TileEncoder> {
        let mut encoder = TileEncoder::new();
        let mut items: Vec<Feature> = Vec::with_capacity(self.entries.len());
        let mut current_layer: Option<String> = None;

        for entry in self.entries.iter().rev() {
            let feature = decode_feature(
                &self.context.layer_strings,
                &self.context.key_strings,
                entry,
            )?;
            match &current_layer {
                None => current_layer = Some(feature.layer.clone()),
                Some(layer) if *layer != feature.layer => {
                    let finished = std::mem::take(&mut items);
                    self.post_process_and_add(&mut encoder, layer.clone(), finished);
                    current_layer = Some(feature.layer.clone());
                }
                _ => {}
            }
            items.push(feature);
        }
        if let Some(layer) = current_layer {
            self.post_process_and_add(&mut encoder, layer, items);
        }
        Ok(encoder)
    }

    fn post_process_and_add(&self, encoder: &mut TileEncoder, layer: String, features: Vec<Feature>) {
        let zoom = self.tile_coord.z;
        let features = match self
            .context
            .profile
            .post_process_layer_features(&layer, zoom, &features)
        {
            Ok(Some(replaced)) => replaced,
            Ok(None) => features,
            Err(e) => {
                // post-processing happens very late in a build; log and emit
                // the unprocessed features instead of aborting
                e.log(
                    self.context.stats.as_ref(),
                    &format!("postprocessing {layer} layer on {}", self.tile_coord),
                );
                features
            }
        };
        self.context
            .stats
            .emitted_features(zoom, &layer, features.len());
        encoder.add_layer_features(&layer, features);
    }
}

impl std::fmt::Debug for TileFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileFeatures")
            .field("tile", &self.tile_coord)
            .field("num_entries", &self.entries.len())
            .finish()
    }
}
