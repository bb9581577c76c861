//! Core library for the intermediate feature pipeline of a vector tile map
//! generator.
//!
//! Rendered map features arrive in arbitrary order from upstream readers and
//! renderers. This crate accepts them as compact binary records whose 64-bit
//! sort key encodes (tile, layer, z-order, grouping), spills them to disk
//! through an external merge sort when they do not fit in memory, streams them
//! back grouped by tile, and runs the per-tile geometric post-processing
//! (line merging, polygon proximity union, Douglas-Peucker simplification)
//! that turns millions of raw features into compact vector tiles.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tilesmith_core::{Config, Pipeline};
//! use tilesmith_core::profile::NullProfile;
//! use tilesmith_core::stats::InMemoryStats;
//!
//! let config = Config::default().with_chunk_memory_budget_bytes(64 * 1024 * 1024);
//! let mut pipeline = Pipeline::new(
//!     Arc::new(NullProfile),
//!     Arc::new(InMemoryStats::new()),
//!     config,
//! ).unwrap();
//!
//! // pipeline.feed(rendered_features)?;
//! pipeline.run(|tile| {
//!     println!("tile {} has {} layers", tile.coord, tile.encoder.layers().len());
//!     Ok(())
//! }).unwrap();
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

pub mod feature;
pub mod geometry;
pub mod group;
pub mod merge;
pub mod pipeline;
pub mod profile;
pub mod simplify;
pub mod sort;
pub mod stats;
pub mod strings;
pub mod tile;
pub mod vector_tile;

pub use feature::{RenderedFeature, SortableFeature};
pub use geometry::{GeomType, GeometryError};
pub use group::{FeatureGroup, TileFeatures};
pub use pipeline::{Pipeline, TileOutput};
pub use profile::Profile;
pub use stats::Stats;
pub use tile::TileCoord;
pub use vector_tile::{AttrValue, Feature, TileEncoder};

/// Errors that can abort the pipeline.
///
/// Geometry failures are recoverable and travel as [`GeometryError`]; they
/// only appear here when a caller chooses to escalate one.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("string table for {namespace} exhausted: more than {max} distinct values", max = strings::MAX_STRINGS)]
    StringsExhausted { namespace: &'static str },

    #[error("z-order {z_order} outside [{min}, {max}]", min = feature::Z_ORDER_MIN, max = feature::Z_ORDER_MAX)]
    ZOrderOutOfRange { z_order: i32 },

    #[error("corrupt sort run: {0}")]
    CorruptRun(String),

    #[error("feature codec error: {0}")]
    Codec(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration recognized by the pipeline core.
///
/// No other runtime knobs affect core semantics.
#[derive(Debug, Clone)]
pub struct Config {
    /// In-memory budget for one external-sort chunk before it is spilled.
    pub chunk_memory_budget_bytes: usize,
    /// Scratch directory for sort run files. Owned by the sorter until close.
    pub temp_dir: PathBuf,
    /// Worker threads used to sort a chunk before it is written out.
    pub sort_parallelism: usize,
    /// Clip radius in pixels around the tile used by rendering and clipping.
    pub buffer_pixels: u32,
    /// Tile extent in pixels.
    pub tile_extent: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_memory_budget_bytes: 128 * 1024 * 1024,
            temp_dir: std::env::temp_dir().join("tilesmith"),
            sort_parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            buffer_pixels: 4,
            tile_extent: merge::TILE_EXTENT_PIXELS as u32,
        }
    }
}

impl Config {
    /// Set the in-memory chunk budget.
    pub fn with_chunk_memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.chunk_memory_budget_bytes = bytes;
        self
    }

    /// Set the scratch directory for sort run files.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Set the number of threads used for chunk sorting.
    pub fn with_sort_parallelism(mut self, threads: usize) -> Self {
        self.sort_parallelism = threads.max(1);
        self
    }

    /// Set the clip radius in pixels.
    pub fn with_buffer_pixels(mut self, pixels: u32) -> Self {
        self.buffer_pixels = pixels;
        self
    }
}

/// Cooperative cancellation token polled between sort chunks and between
/// tiles. In-flight geometric operations are not interruptible.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The pipeline stops at its next checkpoint.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
