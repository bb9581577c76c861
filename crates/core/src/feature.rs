//! Binary feature records and the 64-bit sort key.
//!
//! Every rendered feature becomes a `(sort key, value bytes)` pair. The key
//! alone carries the total ordering the pipeline needs, so the external merge
//! sort never has to look inside the value:
//!
//! ```text
//! [ 32 bits: tile id ][ 8 bits: layer id ][ 23 bits: inverted z-order ][ 1 bit: has group ]
//! ```
//!
//! Z-order is stored inverted so ascending numeric sort yields descending
//! z-order within a tile and layer. The group bit sits in the least
//! significant position so grouped features sort directly after ungrouped
//! ones with the same z-order, and consumers know whether the value bytes
//! start with a grouping preamble.
//!
//! Value bytes are self-describing MessagePack: optional `(group, limit)`
//! preamble, feature id, geometry type, attribute map keyed by dictionary
//! byte, then the geometry command array.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::geometry::GeomType;
use crate::stats::LayerStats;
use crate::strings::CommonStringEncoder;
use crate::tile::TileCoord;
use crate::vector_tile::{AttrValue, Attrs, Feature, VectorGeometry};
use crate::{Error, Result};

pub const Z_ORDER_BITS: u32 = 23;
/// Highest allowed z-order.
pub const Z_ORDER_MAX: i32 = (1 << (Z_ORDER_BITS - 1)) - 1;
/// Lowest allowed z-order.
pub const Z_ORDER_MIN: i32 = -(1 << (Z_ORDER_BITS - 1));
const Z_ORDER_MASK: i64 = (1 << Z_ORDER_BITS) - 1;

/// Encode the sort key for (tile asc, layer asc, z-order desc, has-group).
pub fn encode_sort_key(tile: u32, layer: u8, z_order: i32, has_group: bool) -> u64 {
    let inverted = -(z_order as i64) - 1;
    ((tile as u64) << 32)
        | ((layer as u64) << 24)
        | ((((inverted - Z_ORDER_MIN as i64) & Z_ORDER_MASK) as u64) << 1)
        | u64::from(has_group)
}

pub fn extract_tile(sort_key: u64) -> u32 {
    (sort_key >> 32) as u32
}

pub fn extract_layer(sort_key: u64) -> u8 {
    (sort_key >> 24) as u8
}

pub fn extract_z_order(sort_key: u64) -> i32 {
    Z_ORDER_MAX - ((sort_key >> 1) & Z_ORDER_MASK as u64) as i32
}

pub fn extract_has_group(sort_key: u64) -> bool {
    (sort_key & 1) == 1
}

/// A serialized feature ready for external sorting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortableFeature {
    sort_key: u64,
    value: Vec<u8>,
}

impl SortableFeature {
    pub fn new(sort_key: u64, value: Vec<u8>) -> Self {
        Self { sort_key, value }
    }

    pub fn sort_key(&self) -> u64 {
        self.sort_key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Approximate in-memory footprint, used for chunk budgeting.
    pub(crate) fn estimated_bytes(&self) -> usize {
        8 + self.value.len() + 40
    }
}

impl PartialOrd for SortableFeature {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortableFeature {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key
            .cmp(&other.sort_key)
            .then_with(|| self.value.cmp(&other.value))
    }
}

/// Grouping carried by a rendered feature: a stable id plus the maximum
/// number of features the group may contribute to one tile layer (0 means
/// unlimited).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Group {
    pub group: i64,
    pub limit: i32,
}

/// A feature as produced by the renderer for one tile, before serialization.
#[derive(Debug, Clone)]
pub struct RenderedFeature {
    tile: TileCoord,
    feature: Arc<Feature>,
    z_order: i32,
    group: Option<Group>,
}

impl RenderedFeature {
    pub fn new(tile: TileCoord, feature: Arc<Feature>, z_order: i32, group: Option<Group>) -> Self {
        Self {
            tile,
            feature,
            z_order,
            group,
        }
    }

    pub fn tile(&self) -> TileCoord {
        self.tile
    }

    pub fn feature(&self) -> &Arc<Feature> {
        &self.feature
    }

    pub fn z_order(&self) -> i32 {
        self.z_order
    }

    pub fn group(&self) -> Option<Group> {
        self.group
    }
}

fn codec_err(e: impl std::fmt::Display) -> Error {
    Error::Codec(e.to_string())
}

/// Serializes rendered features for a single producer thread.
///
/// This sits on the hottest path of a build, so it re-uses one pack buffer
/// across records and memoizes the encoded value bytes while successive
/// features share the same underlying [`Feature`] (the renderer reuses one
/// object per zoom for filled ocean polygons). Memoization is skipped when
/// grouping is present because the preamble varies per record.
pub struct FeatureEncoder {
    layer_strings: Arc<CommonStringEncoder>,
    key_strings: Arc<CommonStringEncoder>,
    layer_stats: Arc<LayerStats>,
    buf: Vec<u8>,
    last: Option<(Arc<Feature>, Vec<u8>)>,
}

impl FeatureEncoder {
    pub(crate) fn new(
        layer_strings: Arc<CommonStringEncoder>,
        key_strings: Arc<CommonStringEncoder>,
        layer_stats: Arc<LayerStats>,
    ) -> Self {
        Self {
            layer_strings,
            key_strings,
            layer_stats,
            buf: Vec::with_capacity(1024),
            last: None,
        }
    }

    /// Serialize one rendered feature into a sortable record.
    pub fn encode(&mut self, rendered: &RenderedFeature) -> Result<SortableFeature> {
        let feature = rendered.feature();
        if rendered.z_order < Z_ORDER_MIN || rendered.z_order > Z_ORDER_MAX {
            return Err(Error::ZOrderOutOfRange {
                z_order: rendered.z_order,
            });
        }
        self.layer_stats.accept(&feature.layer, rendered.tile.z);

        let layer_id = self.layer_strings.encode(&feature.layer)?;
        let sort_key = encode_sort_key(
            rendered.tile.encoded(),
            layer_id,
            rendered.z_order,
            rendered.group.is_some(),
        );

        let value = if let Some(group) = rendered.group {
            self.encode_value(feature, Some(group))?
        } else {
            let memoized = self
                .last
                .as_ref()
                .filter(|(f, _)| Arc::ptr_eq(f, feature))
                .map(|(_, v)| v.clone());
            match memoized {
                Some(v) => v,
                None => {
                    let v = self.encode_value(feature, None)?;
                    self.last = Some((Arc::clone(feature), v.clone()));
                    v
                }
            }
        };

        Ok(SortableFeature::new(sort_key, value))
    }

    fn encode_value(&mut self, feature: &Feature, group: Option<Group>) -> Result<Vec<u8>> {
        let key_strings = Arc::clone(&self.key_strings);
        let buf = &mut self.buf;
        buf.clear();

        // the has-group bit in the sort key tells consumers whether this
        // preamble is present
        if let Some(group) = group {
            rmp::encode::write_sint(buf, group.group).map_err(codec_err)?;
            rmp::encode::write_sint(buf, group.limit as i64).map_err(codec_err)?;
        }
        rmp::encode::write_sint(buf, feature.id).map_err(codec_err)?;
        rmp::encode::write_uint(buf, feature.geometry.geom_type().as_byte() as u64)
            .map_err(codec_err)?;

        rmp::encode::write_map_len(buf, feature.attrs.len() as u32).map_err(codec_err)?;
        for (key, value) in &feature.attrs {
            let key_id = key_strings.encode(key)?;
            rmp::encode::write_uint(buf, key_id as u64).map_err(codec_err)?;
            match value {
                AttrValue::Str(s) => rmp::encode::write_str(buf, s).map_err(codec_err)?,
                AttrValue::Int(i) => {
                    rmp::encode::write_sint(buf, *i).map_err(codec_err)?;
                }
                AttrValue::Float(f) => {
                    rmp::encode::write_f64(buf, *f).map_err(codec_err)?;
                }
                AttrValue::Bool(b) => rmp::encode::write_bool(buf, *b).map_err(codec_err)?,
            }
        }

        let commands = feature.geometry.commands();
        rmp::encode::write_array_len(buf, commands.len() as u32).map_err(codec_err)?;
        for &command in commands {
            rmp::encode::write_sint(buf, command as i64).map_err(codec_err)?;
        }

        Ok(buf.clone())
    }
}

/// Read just the grouping preamble from value bytes whose sort key has the
/// group bit set.
pub fn peek_group_info(value: &[u8]) -> Result<Group> {
    let mut rd = value;
    let group: i64 = rmp::decode::read_int(&mut rd).map_err(codec_err)?;
    let limit: i32 = rmp::decode::read_int(&mut rd).map_err(codec_err)?;
    Ok(Group { group, limit })
}

/// Decode a sortable record back into a typed feature.
///
/// The layer name is recovered from the layer-id byte in the sort key; it is
/// not stored in the value body.
pub fn decode_feature(
    layer_strings: &CommonStringEncoder,
    key_strings: &CommonStringEncoder,
    entry: &SortableFeature,
) -> Result<Feature> {
    let mut rd: &[u8] = entry.value();

    let group = if extract_has_group(entry.sort_key()) {
        let group: i64 = rmp::decode::read_int(&mut rd).map_err(codec_err)?;
        // the limit already did its job: over-limit features never got here
        let _limit: i32 = rmp::decode::read_int(&mut rd).map_err(codec_err)?;
        group
    } else {
        Feature::NO_GROUP
    };

    let id: i64 = rmp::decode::read_int(&mut rd).map_err(codec_err)?;
    let geom_type_byte: u8 = rmp::decode::read_int(&mut rd).map_err(codec_err)?;
    let geom_type = GeomType::from_byte(geom_type_byte);

    let map_len = rmp::decode::read_map_len(&mut rd).map_err(codec_err)?;
    let mut attrs = Attrs::new();
    for _ in 0..map_len {
        let key_id: u8 = rmp::decode::read_int(&mut rd).map_err(codec_err)?;
        let key = key_strings.decode(key_id)?;
        let value = rmpv::decode::read_value(&mut rd).map_err(codec_err)?;
        match value {
            rmpv::Value::String(s) => {
                if let Some(s) = s.into_str() {
                    attrs.insert(key, AttrValue::Str(s));
                }
            }
            rmpv::Value::Integer(i) => {
                if let Some(i) = i.as_i64() {
                    attrs.insert(key, AttrValue::Int(i));
                }
            }
            rmpv::Value::F32(f) => {
                attrs.insert(key, AttrValue::Float(f as f64));
            }
            rmpv::Value::F64(f) => {
                attrs.insert(key, AttrValue::Float(f));
            }
            rmpv::Value::Boolean(b) => {
                attrs.insert(key, AttrValue::Bool(b));
            }
            _ => {}
        }
    }

    let num_commands = rmp::decode::read_array_len(&mut rd).map_err(codec_err)? as usize;
    let mut commands = Vec::with_capacity(num_commands);
    for _ in 0..num_commands {
        let command: i32 = rmp::decode::read_int(&mut rd).map_err(codec_err)?;
        commands.push(command);
    }

    let layer = layer_strings.decode(extract_layer(entry.sort_key()))?;
    let mut feature = Feature::new(layer, id, VectorGeometry::new(geom_type, commands), attrs);
    feature.group = group;
    Ok(feature)
}
