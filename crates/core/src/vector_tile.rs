//! Geometry command encoding and tile assembly.
//!
//! Intermediate features store their geometry in the same command format the
//! downstream vector tile encoding uses: MoveTo/LineTo/ClosePath commands with
//! zigzag-encoded coordinate deltas. Benchmarking in the ancestry of this
//! format showed it both smaller and faster to round-trip than WKB for
//! intermediate geometries, and it lets the final encoder reuse the commands
//! directly.
//!
//! Coordinates are tile pixels scaled by 16, so the intermediate precision is
//! 1/16th of a pixel and matches the snapping grid of the geometry backend.

use std::collections::BTreeMap;

use geo::{Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};

use crate::geometry::{GeomType, GeometryError};

/// MVT command ids.
const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

/// Fixed-point scale: geometry commands store 1/16ths of a pixel.
pub const SCALE: f64 = 16.0;

/// Encode a signed integer using zigzag encoding so small magnitudes stay
/// small: 0, -1, 1, -2, 2 map to 0, 1, 2, 3, 4.
#[inline]
pub fn zigzag_encode(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// Inverse of [`zigzag_encode`].
#[inline]
pub fn zigzag_decode(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// Pack a command id with a repeat count: `(command_id | (count << 3))`.
#[inline]
pub fn command_encode(command_id: u32, count: u32) -> u32 {
    (command_id & 0x7) | (count << 3)
}

/// Unpack a command into (command_id, count).
#[inline]
pub fn command_decode(command: u32) -> (u32, u32) {
    (command & 0x7, command >> 3)
}

#[inline]
fn to_fixed(v: f64) -> i32 {
    (v * SCALE).round() as i32
}

#[inline]
fn from_fixed(v: i32) -> f64 {
    v as f64 / SCALE
}

/// A geometry as a tagged command array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorGeometry {
    geom_type: GeomType,
    commands: Vec<i32>,
}

impl VectorGeometry {
    pub fn new(geom_type: GeomType, commands: Vec<i32>) -> Self {
        Self {
            geom_type,
            commands,
        }
    }

    pub fn geom_type(&self) -> GeomType {
        self.geom_type
    }

    pub fn commands(&self) -> &[i32] {
        &self.commands
    }

    /// Encode a geometry in tile pixel coordinates into commands.
    pub fn from_geometry(geom: &Geometry<f64>) -> Result<Self, GeometryError> {
        let mut enc = CommandEncoder::default();
        let geom_type = match geom {
            Geometry::Point(p) => {
                enc.move_to(&[p.0]);
                GeomType::Point
            }
            Geometry::MultiPoint(mp) => {
                let coords: Vec<Coord<f64>> = mp.0.iter().map(|p| p.0).collect();
                enc.move_to(&coords);
                GeomType::Point
            }
            Geometry::LineString(ls) => {
                enc.line_string(&ls.0)?;
                GeomType::Line
            }
            Geometry::MultiLineString(mls) => {
                for ls in &mls.0 {
                    enc.line_string(&ls.0)?;
                }
                GeomType::Line
            }
            Geometry::Polygon(poly) => {
                enc.polygon(poly)?;
                GeomType::Polygon
            }
            Geometry::MultiPolygon(mp) => {
                for poly in &mp.0 {
                    enc.polygon(poly)?;
                }
                GeomType::Polygon
            }
            other => {
                return Err(GeometryError::new(
                    "geom_encode",
                    format!("cannot encode {other:?} as commands"),
                ))
            }
        };
        Ok(Self {
            geom_type,
            commands: enc.commands,
        })
    }

    /// Decode the commands back into a geometry in tile pixel coordinates.
    pub fn decode(&self) -> Result<Geometry<f64>, GeometryError> {
        let paths = parse_paths(&self.commands)?;
        match self.geom_type {
            GeomType::Point => {
                let mut points: Vec<Point<f64>> = Vec::new();
                for (coords, _) in &paths {
                    points.extend(coords.iter().map(|&c| Point(c)));
                }
                match points.len() {
                    0 => Err(GeometryError::new("geom_decode", "empty point geometry")),
                    1 => Ok(Geometry::Point(points[0])),
                    _ => Ok(Geometry::MultiPoint(MultiPoint::new(points))),
                }
            }
            GeomType::Line => {
                let mut lines = Vec::with_capacity(paths.len());
                for (coords, _) in paths {
                    if coords.len() < 2 {
                        return Err(GeometryError::new(
                            "geom_decode",
                            "line path with fewer than 2 points",
                        ));
                    }
                    lines.push(LineString::new(coords));
                }
                if lines.is_empty() {
                    Err(GeometryError::new("geom_decode", "empty line geometry"))
                } else if lines.len() == 1 {
                    Ok(Geometry::LineString(lines.remove(0)))
                } else {
                    Ok(Geometry::MultiLineString(MultiLineString::new(lines)))
                }
            }
            GeomType::Polygon => decode_polygons(paths),
            GeomType::Unknown => Err(GeometryError::new(
                "geom_decode",
                "cannot decode unknown geometry type",
            )),
        }
    }
}

#[derive(Default)]
struct CommandEncoder {
    commands: Vec<i32>,
    cursor_x: i32,
    cursor_y: i32,
}

impl CommandEncoder {
    fn push_delta(&mut self, x: i32, y: i32) {
        self.commands.push(zigzag_encode(x - self.cursor_x) as i32);
        self.commands.push(zigzag_encode(y - self.cursor_y) as i32);
        self.cursor_x = x;
        self.cursor_y = y;
    }

    fn move_to(&mut self, coords: &[Coord<f64>]) {
        if coords.is_empty() {
            return;
        }
        self.commands
            .push(command_encode(CMD_MOVE_TO, coords.len() as u32) as i32);
        for c in coords {
            self.push_delta(to_fixed(c.x), to_fixed(c.y));
        }
    }

    fn line_string(&mut self, coords: &[Coord<f64>]) -> Result<(), GeometryError> {
        if coords.len() < 2 {
            return Err(GeometryError::new(
                "geom_encode",
                "line string with fewer than 2 points",
            ));
        }
        self.move_to(&coords[..1]);
        self.commands
            .push(command_encode(CMD_LINE_TO, (coords.len() - 1) as u32) as i32);
        for c in &coords[1..] {
            self.push_delta(to_fixed(c.x), to_fixed(c.y));
        }
        Ok(())
    }

    fn polygon(&mut self, poly: &Polygon<f64>) -> Result<(), GeometryError> {
        self.ring(poly.exterior(), true)?;
        for hole in poly.interiors() {
            self.ring(hole, false)?;
        }
        Ok(())
    }

    fn ring(&mut self, ring: &LineString<f64>, shell: bool) -> Result<(), GeometryError> {
        let mut pts: Vec<(i32, i32)> = ring.0.iter().map(|c| (to_fixed(c.x), to_fixed(c.y))).collect();
        if pts.len() >= 2 && pts[0] == pts[pts.len() - 1] {
            pts.pop();
        }
        if pts.len() < 3 {
            return Err(GeometryError::new(
                "geom_encode",
                "ring with fewer than 3 distinct points",
            ));
        }
        // shells carry positive shoelace area, holes negative
        if (fixed_ring_area(&pts) > 0) != shell {
            pts.reverse();
        }
        self.commands
            .push(command_encode(CMD_MOVE_TO, 1) as i32);
        self.push_delta(pts[0].0, pts[0].1);
        self.commands
            .push(command_encode(CMD_LINE_TO, (pts.len() - 1) as u32) as i32);
        for &(x, y) in &pts[1..] {
            self.push_delta(x, y);
        }
        self.commands.push(command_encode(CMD_CLOSE_PATH, 1) as i32);
        Ok(())
    }
}

fn fixed_ring_area(pts: &[(i32, i32)]) -> i64 {
    let mut sum = 0i64;
    for i in 0..pts.len() {
        let (x1, y1) = pts[i];
        let (x2, y2) = pts[(i + 1) % pts.len()];
        sum += x1 as i64 * y2 as i64 - x2 as i64 * y1 as i64;
    }
    sum
}

/// Walk the command array into (coordinates, closed) paths.
fn parse_paths(commands: &[i32]) -> Result<Vec<(Vec<Coord<f64>>, bool)>, GeometryError> {
    let mut paths: Vec<(Vec<Coord<f64>>, bool)> = Vec::new();
    let mut cursor_x = 0i32;
    let mut cursor_y = 0i32;
    let mut i = 0;
    while i < commands.len() {
        let (cmd, count) = command_decode(commands[i] as u32);
        i += 1;
        match cmd {
            CMD_MOVE_TO => {
                for _ in 0..count {
                    let (x, y) = read_pair(commands, &mut i, &mut cursor_x, &mut cursor_y)?;
                    paths.push((vec![Coord { x, y }], false));
                }
            }
            CMD_LINE_TO => {
                let path = paths.last_mut().ok_or_else(|| {
                    GeometryError::new("geom_decode", "LineTo before any MoveTo")
                })?;
                for _ in 0..count {
                    let (x, y) = read_pair(commands, &mut i, &mut cursor_x, &mut cursor_y)?;
                    path.0.push(Coord { x, y });
                }
            }
            CMD_CLOSE_PATH => {
                let path = paths.last_mut().ok_or_else(|| {
                    GeometryError::new("geom_decode", "ClosePath before any MoveTo")
                })?;
                path.1 = true;
            }
            other => {
                return Err(GeometryError::new(
                    "geom_decode",
                    format!("unknown geometry command {other}"),
                ))
            }
        }
    }
    Ok(paths)
}

fn read_pair(
    commands: &[i32],
    i: &mut usize,
    cursor_x: &mut i32,
    cursor_y: &mut i32,
) -> Result<(f64, f64), GeometryError> {
    if *i + 2 > commands.len() {
        return Err(GeometryError::new(
            "geom_decode",
            "truncated geometry command stream",
        ));
    }
    *cursor_x += zigzag_decode(commands[*i] as u32);
    *cursor_y += zigzag_decode(commands[*i + 1] as u32);
    *i += 2;
    Ok((from_fixed(*cursor_x), from_fixed(*cursor_y)))
}

fn decode_polygons(
    paths: Vec<(Vec<Coord<f64>>, bool)>,
) -> Result<Geometry<f64>, GeometryError> {
    let mut polygons: Vec<Polygon<f64>> = Vec::new();
    let mut shell: Option<(LineString<f64>, Vec<LineString<f64>>)> = None;
    for (mut coords, closed) in paths {
        if !closed || coords.len() < 3 {
            return Err(GeometryError::new(
                "geom_decode",
                "polygon ring not closed or too short",
            ));
        }
        let first = coords[0];
        coords.push(first);
        let ring = LineString::new(coords);
        if crate::geometry::ring_signed_area(&ring) >= 0.0 {
            if let Some((ext, holes)) = shell.take() {
                polygons.push(Polygon::new(ext, holes));
            }
            shell = Some((ring, Vec::new()));
        } else {
            match &mut shell {
                Some((_, holes)) => holes.push(ring),
                None => {
                    return Err(GeometryError::new(
                        "geom_decode",
                        "polygon hole before any shell",
                    ))
                }
            }
        }
    }
    if let Some((ext, holes)) = shell.take() {
        polygons.push(Polygon::new(ext, holes));
    }
    if polygons.is_empty() {
        Err(GeometryError::new("geom_decode", "empty polygon geometry"))
    } else if polygons.len() == 1 {
        Ok(Geometry::Polygon(polygons.remove(0)))
    } else {
        Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons)))
    }
}

// ============================================================================
// Features and attribute values
// ============================================================================

/// An attribute value. Absent keys stand in for nulls, which are omitted at
/// encode time.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// Attribute map. Ordered so identical maps produce identical encodings.
pub type Attrs = BTreeMap<String, AttrValue>;

/// One feature inside a tile layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub layer: String,
    pub id: i64,
    pub geometry: VectorGeometry,
    pub attrs: Attrs,
    /// Group id carried through from rendering, or [`Feature::NO_GROUP`].
    pub group: i64,
}

impl Feature {
    pub const NO_GROUP: i64 = -1;

    pub fn new(
        layer: impl Into<String>,
        id: i64,
        geometry: VectorGeometry,
        attrs: Attrs,
    ) -> Self {
        Self {
            layer: layer.into(),
            id,
            geometry,
            attrs,
            group: Self::NO_GROUP,
        }
    }

    /// The same feature with `geometry` swapped in; used by the merge
    /// operations to attach combined geometry to the first input's identity.
    pub fn copy_with_new_geometry(&self, geometry: VectorGeometry) -> Self {
        Self {
            geometry,
            ..self.clone()
        }
    }
}

/// Assembles post-processed layers of a single tile for the downstream wire
/// encoder.
#[derive(Debug, Default)]
pub struct TileEncoder {
    layers: Vec<TileLayer>,
}

/// One named layer of features in draw order (bottom-most first).
#[derive(Debug)]
pub struct TileLayer {
    pub name: String,
    pub features: Vec<Feature>,
}

impl TileEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer. Empty layers are dropped.
    pub fn add_layer_features(&mut self, name: &str, features: Vec<Feature>) {
        if !features.is_empty() {
            self.layers.push(TileLayer {
                name: name.to_string(),
                features,
            });
        }
    }

    pub fn layers(&self) -> &[TileLayer] {
        &self.layers
    }

    /// Total features across all layers.
    pub fn num_features(&self) -> usize {
        self.layers.iter().map(|l| l.features.len()).sum()
    }
}
