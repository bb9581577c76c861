//! Geometry backend for the per-tile post-processors.
//!
//! The merge operations need a small set of engine-level primitives:
//! distance between geometries, mitre-joined buffering, ring areas, linework
//! chaining, and grid snapping. They are collected here so the rest of the
//! crate talks to one surface instead of scattering `geo` calls.

use geo::orient::{Direction, Orient};
use geo::{
    Area, BooleanOps, Coord, EuclideanDistance, Geometry, GeometryCollection, LineString,
    MultiLineString, MultiPolygon, Polygon,
};
use thiserror::Error;

use crate::stats::Stats;

/// Coordinates snap to this grid (1/16th of a pixel), matching the precision
/// of the intermediate geometry command encoding.
pub const GRID_CELLS_PER_PIXEL: f64 = 16.0;

/// Geometry kind carried in encoded feature values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GeomType {
    Unknown = 0,
    Point = 1,
    Line = 2,
    Polygon = 3,
}

impl GeomType {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            1 => GeomType::Point,
            2 => GeomType::Line,
            3 => GeomType::Polygon,
            _ => GeomType::Unknown,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A recoverable geometry failure.
///
/// Carries a stable error code for [`Stats::data_error`] so operators can
/// count failure kinds across a run without scraping logs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct GeometryError {
    code: &'static str,
    message: String,
}

impl GeometryError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Record this error against `stats` and the log, with `context`
    /// describing where it happened.
    pub fn log(&self, stats: &dyn Stats, context: &str) {
        stats.data_error(self.code);
        log::warn!("{context}: {self}");
    }
}

// ============================================================================
// Linework merging
// ============================================================================

/// Joins line segments that share endpoints into maximal polylines.
///
/// Segments are chained only through nodes of degree two; junctions of three
/// or more segment ends stay split, so road forks survive merging.
#[derive(Debug, Default)]
pub struct LineMerger {
    lines: Vec<LineString<f64>>,
}

/// Endpoint key: exact coordinate bits, so only identical endpoints chain.
type NodeKey = (u64, u64);

fn node_key(c: Coord<f64>) -> NodeKey {
    (c.x.to_bits(), c.y.to_bits())
}

impl LineMerger {
    /// Add the linework of `geom`. Non-line geometries contribute nothing.
    pub fn add(&mut self, geom: &Geometry<f64>) {
        match geom {
            Geometry::Line(line) => self.add_line_string(LineString::from(*line)),
            Geometry::LineString(ls) => self.add_line_string(ls.clone()),
            Geometry::MultiLineString(mls) => {
                for ls in &mls.0 {
                    self.add_line_string(ls.clone());
                }
            }
            Geometry::GeometryCollection(gc) => {
                for g in &gc.0 {
                    self.add(g);
                }
            }
            _ => {}
        }
    }

    fn add_line_string(&mut self, ls: LineString<f64>) {
        if ls.0.len() >= 2 {
            self.lines.push(ls);
        }
    }

    /// Consume the merger and return the maximal chained polylines.
    pub fn merged_line_strings(self) -> Vec<LineString<f64>> {
        let n = self.lines.len();
        // ends[key] lists (line index, is_start) for every segment end at key
        let mut ends: std::collections::HashMap<NodeKey, Vec<(usize, bool)>> =
            std::collections::HashMap::new();
        for (i, line) in self.lines.iter().enumerate() {
            let first = line.0[0];
            let last = line.0[line.0.len() - 1];
            ends.entry(node_key(first)).or_default().push((i, true));
            ends.entry(node_key(last)).or_default().push((i, false));
        }

        let mut used = vec![false; n];
        let mut merged = Vec::new();
        for start in 0..n {
            if used[start] {
                continue;
            }
            used[start] = true;
            let mut chain: Vec<Coord<f64>> = self.lines[start].0.clone();

            // grow at the tail, then at the head, through degree-2 nodes only
            for forward in [true, false] {
                loop {
                    let node = if forward {
                        chain[chain.len() - 1]
                    } else {
                        chain[0]
                    };
                    if chain.len() > 1 && node_key(chain[0]) == node_key(chain[chain.len() - 1]) {
                        break; // chain closed into a ring
                    }
                    let Some(candidates) = ends.get(&node_key(node)) else {
                        break;
                    };
                    if candidates.len() != 2 {
                        break;
                    }
                    let Some(&(next, next_starts_here)) =
                        candidates.iter().find(|(i, _)| !used[*i])
                    else {
                        break;
                    };
                    used[next] = true;
                    let mut coords = self.lines[next].0.clone();
                    if next_starts_here != forward {
                        coords.reverse();
                    }
                    if forward {
                        chain.extend_from_slice(&coords[1..]);
                    } else {
                        coords.pop();
                        coords.extend_from_slice(&chain);
                        chain = coords;
                    }
                }
            }
            merged.push(LineString::new(chain));
        }
        merged
    }
}

// ============================================================================
// Distance and area
// ============================================================================

/// Minimum euclidean distance between the polygonal parts of two geometries.
///
/// Returns infinity when either side has no polygons.
pub fn polygon_distance(a: &Geometry<f64>, b: &Geometry<f64>) -> f64 {
    let mut left = Vec::new();
    let mut right = Vec::new();
    extract_polygons(a, &mut left);
    extract_polygons(b, &mut right);
    let mut min = f64::INFINITY;
    for pa in &left {
        for pb in &right {
            min = min.min(pa.euclidean_distance(pb));
        }
    }
    min
}

/// True when the polygonal parts of `a` and `b` come within `distance`.
pub fn is_within_distance(a: &Geometry<f64>, b: &Geometry<f64>, distance: f64) -> bool {
    polygon_distance(a, b) <= distance
}

/// Signed shoelace area of a ring; positive for counter-clockwise rings in
/// standard math axes.
pub fn ring_signed_area(ring: &LineString<f64>) -> f64 {
    let pts = &ring.0;
    if pts.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..pts.len() - 1 {
        sum += pts[i].x * pts[i + 1].y - pts[i + 1].x * pts[i].y;
    }
    // close implicitly when the ring is not closed
    let (first, last) = (pts[0], pts[pts.len() - 1]);
    if first != last {
        sum += last.x * first.y - first.x * last.y;
    }
    sum / 2.0
}

/// Absolute area enclosed by a ring.
pub fn ring_area(ring: &LineString<f64>) -> f64 {
    ring_signed_area(ring).abs()
}

// ============================================================================
// Mitre-joined buffering (morphological closing support)
// ============================================================================

/// Buffer the polygonal parts of `geom` by `distance` with mitre joins, then
/// union the results.
///
/// The mitre join extends each corner to the intersection of its offset
/// edges, which keeps rectangular landcover corners square where round joins
/// would erode them. Collapsed rings drop out; when everything collapses the
/// result is an empty multipolygon for the caller to discard.
pub fn buffer_mitre(geom: &Geometry<f64>, distance: f64) -> Result<Geometry<f64>, GeometryError> {
    let mut polygons = Vec::new();
    extract_polygons(geom, &mut polygons);
    if polygons.is_empty() {
        return Err(GeometryError::new(
            "buffer_input",
            "buffer requires polygonal input",
        ));
    }

    let mut buffered: Vec<Polygon<f64>> = Vec::new();
    for poly in &polygons {
        if let Some(p) = offset_polygon(poly, distance) {
            buffered.push(p);
        }
    }

    if buffered.is_empty() {
        return Ok(Geometry::MultiPolygon(MultiPolygon::new(Vec::new())));
    }
    if buffered.len() == 1 {
        return Ok(Geometry::Polygon(buffered.remove(0)));
    }

    let mut acc = MultiPolygon::new(vec![buffered.remove(0)]);
    for p in buffered {
        acc = acc.union(&MultiPolygon::new(vec![p]));
    }
    let mut polys = acc.0;
    if polys.len() == 1 {
        Ok(Geometry::Polygon(polys.remove(0)))
    } else {
        Ok(Geometry::MultiPolygon(MultiPolygon::new(polys)))
    }
}

/// Offset every ring of `poly` outward by `distance` (inward when negative).
/// Returns `None` when the exterior collapses.
fn offset_polygon(poly: &Polygon<f64>, distance: f64) -> Option<Polygon<f64>> {
    // exterior CCW, holes CW: offsetting along the right-hand normal then
    // moves every boundary away from the interior by `distance`
    let oriented = poly.orient(Direction::Default);
    let shell = offset_ring(oriented.exterior(), distance)?;
    if ring_signed_area(&shell) <= 0.0 {
        return None;
    }
    let mut holes = Vec::new();
    for hole in oriented.interiors() {
        if let Some(h) = offset_ring(hole, distance) {
            if ring_signed_area(&h) < 0.0 {
                holes.push(h);
            }
        }
    }
    Some(Polygon::new(shell, holes))
}

fn offset_ring(ring: &LineString<f64>, distance: f64) -> Option<LineString<f64>> {
    let mut pts: Vec<Coord<f64>> = ring.0.clone();
    if pts.len() >= 2 && pts[0] == pts[pts.len() - 1] {
        pts.pop();
    }
    pts.dedup();
    if pts.len() >= 2 && pts[0] == pts[pts.len() - 1] {
        pts.pop();
    }
    let n = pts.len();
    if n < 3 {
        return None;
    }

    let mut out = Vec::with_capacity(n + 1);
    for i in 0..n {
        let prev = pts[(i + n - 1) % n];
        let cur = pts[i];
        let next = pts[(i + 1) % n];

        let v1 = (cur.x - prev.x, cur.y - prev.y);
        let v2 = (next.x - cur.x, next.y - cur.y);
        let l1 = (v1.0 * v1.0 + v1.1 * v1.1).sqrt();
        let l2 = (v2.0 * v2.0 + v2.1 * v2.1).sqrt();
        if l1 == 0.0 || l2 == 0.0 {
            continue;
        }
        // right-hand normals point away from the interior for CCW rings
        let n1 = (v1.1 / l1, -v1.0 / l1);
        let n2 = (v2.1 / l2, -v2.0 / l2);

        let denom = v1.0 * v2.1 - v1.1 * v2.0;
        if denom.abs() < 1e-12 * l1 * l2 {
            // collinear edges: plain parallel offset
            out.push(Coord {
                x: cur.x + n1.0 * distance,
                y: cur.y + n1.1 * distance,
            });
        } else {
            // mitre: intersect the two offset edge lines
            let p1 = (prev.x + n1.0 * distance, prev.y + n1.1 * distance);
            let p2 = (cur.x + n2.0 * distance, cur.y + n2.1 * distance);
            let dx = p2.0 - p1.0;
            let dy = p2.1 - p1.1;
            let t = (dx * v2.1 - dy * v2.0) / denom;
            out.push(Coord {
                x: p1.0 + v1.0 * t,
                y: p1.1 + v1.1 * t,
            });
        }
    }
    if out.len() < 3 {
        return None;
    }
    let first = out[0];
    out.push(first);
    Some(LineString::new(out))
}

// ============================================================================
// Snapping and combining
// ============================================================================

/// Snap polygon coordinates to the 1/16-pixel grid and restore canonical ring
/// orientation. Fails when the exterior collapses below a valid ring.
pub fn snap_and_fix_polygon(geom: &Geometry<f64>) -> Result<Geometry<f64>, GeometryError> {
    match geom {
        Geometry::Polygon(poly) => snap_polygon(poly).map(Geometry::Polygon),
        Geometry::MultiPolygon(mp) => {
            let mut out = Vec::with_capacity(mp.0.len());
            for poly in &mp.0 {
                out.push(snap_polygon(poly)?);
            }
            Ok(Geometry::MultiPolygon(MultiPolygon::new(out)))
        }
        other => Err(GeometryError::new(
            "snap_input",
            format!("cannot snap {} as polygon", geometry_kind(other)),
        )),
    }
}

fn snap_polygon(poly: &Polygon<f64>) -> Result<Polygon<f64>, GeometryError> {
    let shell = snap_ring(poly.exterior()).ok_or_else(|| {
        GeometryError::new("snap_collapsed", "polygon exterior collapsed during snapping")
    })?;
    let holes = poly.interiors().iter().filter_map(snap_ring).collect();
    Ok(Polygon::new(shell, holes).orient(Direction::Default))
}

fn snap_ring(ring: &LineString<f64>) -> Option<LineString<f64>> {
    let mut pts: Vec<Coord<f64>> = ring
        .0
        .iter()
        .map(|c| Coord {
            x: (c.x * GRID_CELLS_PER_PIXEL).round() / GRID_CELLS_PER_PIXEL,
            y: (c.y * GRID_CELLS_PER_PIXEL).round() / GRID_CELLS_PER_PIXEL,
        })
        .collect();
    pts.dedup();
    if pts.is_empty() || pts[0] != pts[pts.len() - 1] {
        if let Some(&first) = pts.first() {
            pts.push(first);
        }
    }
    if pts.len() < 4 {
        return None;
    }
    Some(LineString::new(pts))
}

/// Combine polylines into one line geometry.
pub fn combine_line_strings(mut lines: Vec<LineString<f64>>) -> Geometry<f64> {
    if lines.len() == 1 {
        Geometry::LineString(lines.remove(0))
    } else {
        Geometry::MultiLineString(MultiLineString::new(lines))
    }
}

/// Combine polygons into one polygon geometry.
pub fn combine_polygons(mut polygons: Vec<Polygon<f64>>) -> Geometry<f64> {
    if polygons.len() == 1 {
        Geometry::Polygon(polygons.remove(0))
    } else {
        Geometry::MultiPolygon(MultiPolygon::new(polygons))
    }
}

/// Collect every polygon nested anywhere inside `geom`.
pub fn extract_polygons(geom: &Geometry<f64>, out: &mut Vec<Polygon<f64>>) {
    match geom {
        Geometry::Polygon(p) => out.push(p.clone()),
        Geometry::MultiPolygon(mp) => out.extend(mp.0.iter().cloned()),
        Geometry::GeometryCollection(gc) => {
            for g in &gc.0 {
                extract_polygons(g, out);
            }
        }
        _ => {}
    }
}

/// Build a collection from owned geometries.
pub fn collection(geoms: Vec<Geometry<f64>>) -> Geometry<f64> {
    Geometry::GeometryCollection(GeometryCollection(geoms))
}

fn geometry_kind(geom: &Geometry<f64>) -> &'static str {
    match geom {
        Geometry::Point(_) => "point",
        Geometry::Line(_) | Geometry::LineString(_) => "line",
        Geometry::MultiPoint(_) => "multipoint",
        Geometry::MultiLineString(_) => "multiline",
        Geometry::Polygon(_) => "polygon",
        Geometry::MultiPolygon(_) => "multipolygon",
        Geometry::GeometryCollection(_) => "collection",
        Geometry::Rect(_) => "rect",
        Geometry::Triangle(_) => "triangle",
    }
}

/// Total area of the polygonal parts of `geom`.
pub fn polygonal_area(geom: &Geometry<f64>) -> f64 {
    let mut polys = Vec::new();
    extract_polygons(geom, &mut polys);
    polys.iter().map(|p| p.unsigned_area()).sum()
}
