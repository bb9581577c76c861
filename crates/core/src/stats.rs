//! Best-effort observability hooks.
//!
//! The pipeline reports counters, gauges, stage timings, and data errors
//! through the [`Stats`] trait. Implementations must never influence
//! semantics: every call site tolerates a no-op.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

/// Capability surface the core reports through.
pub trait Stats: Send + Sync {
    /// Increment the counter `name` by `amount`.
    fn count(&self, name: &str, amount: u64) {
        let _ = (name, amount);
    }

    /// Record the current value of gauge `name`.
    fn gauge(&self, name: &str, value: f64) {
        let _ = (name, value);
    }

    /// Record that `count` features were emitted into `layer` at `zoom`.
    fn emitted_features(&self, zoom: u8, layer: &str, count: usize) {
        let _ = (zoom, layer, count);
    }

    /// Record that an invalid feature or post-process result was discarded,
    /// keyed by a stable error code.
    fn data_error(&self, code: &str) {
        let _ = code;
    }

    /// Start a named stage timer; finishing it logs the elapsed time.
    fn start_stage(&self, name: &str) -> StageTimer {
        StageTimer::new(name)
    }
}

/// Handle returned by [`Stats::start_stage`].
#[derive(Debug)]
pub struct StageTimer {
    name: String,
    started: Instant,
}

impl StageTimer {
    fn new(name: &str) -> Self {
        log::debug!("starting stage {name}");
        Self {
            name: name.to_string(),
            started: Instant::now(),
        }
    }

    /// Stop the timer and log the stage duration.
    pub fn finish(self) {
        log::info!(
            "finished stage {} in {:.3}s",
            self.name,
            self.started.elapsed().as_secs_f64()
        );
    }
}

/// Stat collector that stores counters in memory, for tests and end-of-run
/// summaries.
#[derive(Debug, Default)]
pub struct InMemoryStats {
    counters: Mutex<BTreeMap<String, u64>>,
    gauges: Mutex<BTreeMap<String, f64>>,
    data_errors: Mutex<BTreeMap<String, u64>>,
}

impl InMemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of counter `name`, 0 when never incremented.
    pub fn counter_value(&self, name: &str) -> u64 {
        *self.counters.lock().expect("stats lock").get(name).unwrap_or(&0)
    }

    /// How often `code` was reported through [`Stats::data_error`].
    pub fn data_error_count(&self, code: &str) -> u64 {
        *self.data_errors.lock().expect("stats lock").get(code).unwrap_or(&0)
    }

    /// All data-error codes with their counts.
    pub fn data_errors(&self) -> BTreeMap<String, u64> {
        self.data_errors.lock().expect("stats lock").clone()
    }
}

impl Stats for InMemoryStats {
    fn count(&self, name: &str, amount: u64) {
        *self
            .counters
            .lock()
            .expect("stats lock")
            .entry(name.to_string())
            .or_insert(0) += amount;
    }

    fn gauge(&self, name: &str, value: f64) {
        self.gauges
            .lock()
            .expect("stats lock")
            .insert(name.to_string(), value);
    }

    fn emitted_features(&self, zoom: u8, layer: &str, count: usize) {
        self.count(&format!("emitted_z{zoom}_{layer}"), count as u64);
    }

    fn data_error(&self, code: &str) {
        *self
            .data_errors
            .lock()
            .expect("stats lock")
            .entry(code.to_string())
            .or_insert(0) += 1;
    }
}

/// Per-layer summary of what flowed through the feature encoder: zoom range
/// and feature count per layer name. Feeds downstream metadata writers.
#[derive(Debug, Default)]
pub struct LayerStats {
    layers: Mutex<BTreeMap<String, LayerSummary>>,
}

/// Observed zoom range and count for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSummary {
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub num_features: u64,
}

impl LayerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn accept(&self, layer: &str, zoom: u8) {
        let mut layers = self.layers.lock().expect("layer stats lock");
        layers
            .entry(layer.to_string())
            .and_modify(|s| {
                s.min_zoom = s.min_zoom.min(zoom);
                s.max_zoom = s.max_zoom.max(zoom);
                s.num_features += 1;
            })
            .or_insert(LayerSummary {
                min_zoom: zoom,
                max_zoom: zoom,
                num_features: 1,
            });
    }

    /// Snapshot of all layer summaries.
    pub fn summaries(&self) -> BTreeMap<String, LayerSummary> {
        self.layers.lock().expect("layer stats lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters() {
        let stats = InMemoryStats::new();
        assert_eq!(stats.counter_value("features"), 0);
        stats.count("features", 3);
        stats.count("features", 2);
        assert_eq!(stats.counter_value("features"), 5);
    }

    #[test]
    fn test_data_errors_keyed_by_code() {
        let stats = InMemoryStats::new();
        stats.data_error("merge_collapsed");
        stats.data_error("merge_collapsed");
        stats.data_error("snap_collapsed");
        assert_eq!(stats.data_error_count("merge_collapsed"), 2);
        assert_eq!(stats.data_error_count("snap_collapsed"), 1);
        assert_eq!(stats.data_error_count("unseen"), 0);
    }

    #[test]
    fn test_layer_stats_tracks_zoom_range() {
        let layer_stats = LayerStats::new();
        layer_stats.accept("water", 5);
        layer_stats.accept("water", 2);
        layer_stats.accept("water", 9);
        layer_stats.accept("roads", 7);

        let summaries = layer_stats.summaries();
        assert_eq!(
            summaries["water"],
            LayerSummary {
                min_zoom: 2,
                max_zoom: 9,
                num_features: 3
            }
        );
        assert_eq!(summaries["roads"].num_features, 1);
    }
}
