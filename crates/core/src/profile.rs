//! The capability boundary between the core pipeline and map schemas.
//!
//! Layer-specific rules (which attributes to merge on, which zoom gets which
//! detail) live outside the core; a [`Profile`] plugs them in at the one
//! point where the core hands over decoded features.

use crate::geometry::GeometryError;
use crate::vector_tile::Feature;

/// Schema-specific hooks invoked by the tile assembly.
pub trait Profile: Send + Sync {
    /// Post-process the features of one layer in one tile before encoding.
    ///
    /// `features` arrive in draw order (bottom-most first). Return
    /// `Ok(Some(replacement))` to substitute the list, `Ok(None)` to keep it
    /// unchanged, or a [`GeometryError`] to have the caller log the failure
    /// and fall back to the unprocessed features.
    fn post_process_layer_features(
        &self,
        layer: &str,
        zoom: u8,
        features: &[Feature],
    ) -> Result<Option<Vec<Feature>>, GeometryError> {
        let _ = (layer, zoom, features);
        Ok(None)
    }
}

/// Profile that leaves every layer unchanged.
pub struct NullProfile;

impl Profile for NullProfile {}
