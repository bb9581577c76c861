//! Douglas-Peucker simplification without geometry repair.
//!
//! Standard anchored Douglas-Peucker with two twists the merge pipeline
//! relies on:
//!
//! - Endpoints of every sequence are kept unconditionally.
//! - A `num_forced_points` parameter keeps at least that many interior points
//!   even when all of them sit below the tolerance. Forced splits pick the
//!   farthest interior point and recurse with the remaining quota split as
//!   k-1 / k-2 across the halves. Rings pass 2 so they cannot collapse; the
//!   later area filter removes small polygons more accurately than the
//!   simplifier could.
//!
//! The recursion runs on an explicit work stack: fully connected landcover
//! and pathological traces can nest deeply enough to overflow the call stack.

use geo::{Coord, Geometry, LineString, MultiLineString, MultiPolygon, Polygon};

/// Squared distance from `p` to the segment between `a` and `b`. Falls back
/// to point distance when the segment is degenerate.
fn sq_segment_distance(p: Coord<f64>, a: Coord<f64>, b: Coord<f64>) -> f64 {
    let mut x = a.x;
    let mut y = a.y;
    let mut dx = b.x - x;
    let mut dy = b.y - y;

    if dx != 0.0 || dy != 0.0 {
        let t = ((p.x - x) * dx + (p.y - y) * dy) / (dx * dx + dy * dy);
        if t > 1.0 {
            x = b.x;
            y = b.y;
        } else if t > 0.0 {
            x += dx * t;
            y += dy * t;
        }
    }

    dx = p.x - x;
    dy = p.y - y;
    dx * dx + dy * dy
}

enum Frame {
    Visit { first: usize, last: usize, forced: i32 },
    Emit(usize),
}

/// Simplify a coordinate sequence, keeping the endpoints and at least
/// `num_forced_points` interior points.
pub fn simplify_coords(
    coords: &[Coord<f64>],
    tolerance: f64,
    num_forced_points: i32,
) -> Vec<Coord<f64>> {
    if coords.is_empty() {
        return Vec::new();
    }
    let sq_tolerance = tolerance * tolerance;
    let last = coords.len() - 1;
    let mut out = Vec::with_capacity(coords.len().min(8));
    out.push(coords[0]);

    if last > 0 {
        let mut stack = vec![Frame::Visit {
            first: 0,
            last,
            forced: num_forced_points,
        }];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Emit(index) => out.push(coords[index]),
                Frame::Visit { first, last, forced } => {
                    if last - first < 2 {
                        continue;
                    }
                    let force = forced > 0;
                    let mut max_sq_dist = if force { -1.0 } else { sq_tolerance };
                    let mut index = None;
                    for i in first + 1..last {
                        let sq = sq_segment_distance(coords[i], coords[first], coords[last]);
                        if sq > max_sq_dist {
                            index = Some(i);
                            max_sq_dist = sq;
                        }
                    }
                    let Some(index) = index else { continue };
                    if force || max_sq_dist > sq_tolerance {
                        // emit in order: left half, split point, right half
                        if last - index > 1 {
                            stack.push(Frame::Visit {
                                first: index,
                                last,
                                forced: forced - 2,
                            });
                        }
                        stack.push(Frame::Emit(index));
                        if index - first > 1 {
                            stack.push(Frame::Visit {
                                first,
                                last: index,
                                forced: forced - 1,
                            });
                        }
                    }
                }
            }
        }
        out.push(coords[last]);
    }
    out
}

/// Simplify an open line string. Endpoints are preserved byte-exact.
pub fn simplify_line_string(line: &LineString<f64>, tolerance: f64) -> LineString<f64> {
    LineString::new(simplify_coords(&line.0, tolerance, 0))
}

fn simplify_ring(ring: &LineString<f64>, tolerance: f64) -> LineString<f64> {
    LineString::new(simplify_coords(&ring.0, tolerance, 2))
}

/// Simplify a polygon. Returns `None` when the exterior collapses below a
/// valid ring; collapsed holes are dropped silently.
pub fn simplify_polygon(poly: &Polygon<f64>, tolerance: f64) -> Option<Polygon<f64>> {
    let shell = simplify_ring(poly.exterior(), tolerance);
    if shell.0.len() < 4 {
        return None;
    }
    let holes = poly
        .interiors()
        .iter()
        .map(|h| simplify_ring(h, tolerance))
        .filter(|h| h.0.len() >= 4)
        .collect();
    Some(Polygon::new(shell, holes))
}

/// Simplify any geometry. Points pass through; polygons that collapse return
/// `None` for the caller to drop.
pub fn simplify_geometry(geom: &Geometry<f64>, tolerance: f64) -> Option<Geometry<f64>> {
    match geom {
        Geometry::LineString(ls) => Some(Geometry::LineString(simplify_line_string(ls, tolerance))),
        Geometry::MultiLineString(mls) => Some(Geometry::MultiLineString(MultiLineString::new(
            mls.0.iter().map(|ls| simplify_line_string(ls, tolerance)).collect(),
        ))),
        Geometry::Polygon(poly) => simplify_polygon(poly, tolerance).map(Geometry::Polygon),
        Geometry::MultiPolygon(mp) => {
            let polys: Vec<Polygon<f64>> =
                mp.0.iter().filter_map(|p| simplify_polygon(p, tolerance)).collect();
            if polys.is_empty() {
                None
            } else {
                Some(Geometry::MultiPolygon(MultiPolygon::new(polys)))
            }
        }
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::coord;

    fn line(coords: &[(f64, f64)]) -> Vec<Coord<f64>> {
        coords.iter().map(|&(x, y)| coord! {x: x, y: y}).collect()
    }

    #[test]
    fn test_collinear_interior_point_removed() {
        let coords = line(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]);
        let out = simplify_coords(&coords, 0.0, 0);
        assert_eq!(out, line(&[(0.0, 0.0), (2.0, 0.0)]));
    }

    #[test]
    fn test_endpoints_always_preserved() {
        let coords = line(&[(0.25, 0.75), (1.0, 0.0001), (2.5, -0.125)]);
        let out = simplify_coords(&coords, 10.0, 0);
        assert_eq!(out.first(), coords.first());
        assert_eq!(out.last(), coords.last());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_point_above_tolerance_kept() {
        let coords = line(&[(0.0, 0.0), (5.0, 3.0), (10.0, 0.0)]);
        let out = simplify_coords(&coords, 1.0, 0);
        assert_eq!(out, coords);
    }

    #[test]
    fn test_output_never_longer_than_input() {
        let coords: Vec<Coord<f64>> = (0..200)
            .map(|i| coord! {x: i as f64, y: ((i * 13) % 7) as f64 * 0.01})
            .collect();
        let out = simplify_coords(&coords, 0.5, 0);
        assert!(out.len() <= coords.len());
        assert!(out.len() >= 2);
    }

    #[test]
    fn test_no_vertex_farther_than_tolerance() {
        // every dropped vertex must lie within tolerance of the kept polyline
        let coords: Vec<Coord<f64>> = (0..100)
            .map(|i| coord! {x: i as f64 * 0.5, y: (i as f64 * 0.7).sin()})
            .collect();
        let tolerance = 0.25;
        let out = simplify_coords(&coords, tolerance, 0);

        for &p in &coords {
            let mut min_sq = f64::INFINITY;
            for pair in out.windows(2) {
                min_sq = min_sq.min(sq_segment_distance(p, pair[0], pair[1]));
            }
            assert!(
                min_sq <= tolerance * tolerance + 1e-12,
                "vertex {p:?} ended up {min_sq} from the result"
            );
        }
    }

    #[test]
    fn test_forced_points_keep_ring_from_collapsing() {
        // a small diamond entirely below tolerance still keeps 2 interior
        // points, leaving a 4-point closed ring
        let ring = LineString::new(line(&[
            (0.0, 0.0),
            (0.1, 0.1),
            (0.2, 0.0),
            (0.1, -0.1),
            (0.0, 0.0),
        ]));
        let out = simplify_ring(&ring, 100.0);
        assert_eq!(out.0.len(), 4);
        assert_eq!(out.0.first(), out.0.last());
    }

    #[test]
    fn test_polygon_collapse_returns_none() {
        // degenerate sliver: 3-point "ring" cannot survive as a polygon
        let poly = Polygon::new(
            LineString::new(line(&[(0.0, 0.0), (1.0, 0.0), (0.0, 0.0)])),
            vec![],
        );
        assert!(simplify_polygon(&poly, 1.0).is_none());
    }

    #[test]
    fn test_polygon_holes_dropped_when_collapsed() {
        let poly = Polygon::new(
            LineString::new(line(&[
                (0.0, 0.0),
                (100.0, 0.0),
                (100.0, 100.0),
                (0.0, 100.0),
                (0.0, 0.0),
            ])),
            vec![LineString::new(line(&[
                (50.0, 50.0),
                (50.01, 50.0),
                (50.01, 50.01),
                (50.0, 50.0),
            ]))],
        );
        let out = simplify_polygon(&poly, 1.0).unwrap();
        assert_eq!(out.exterior().0.len(), 5);
        // the forced points keep the hole a ring, but a 3-point input ring
        // cannot force more points than it has
        assert!(out.interiors().len() <= 1);
    }

    #[test]
    fn test_line_string_endpoints_byte_exact() {
        let ls = LineString::new(line(&[(0.125, 0.375), (7.0, 7.0), (13.625, -2.25)]));
        let out = simplify_line_string(&ls, 50.0);
        assert_eq!(out.0[0], ls.0[0]);
        assert_eq!(out.0[out.0.len() - 1], ls.0[ls.0.len() - 1]);
    }

    #[test]
    fn test_deep_zigzag_does_not_overflow() {
        // adversarial zigzag that forces a split at every vertex
        let coords: Vec<Coord<f64>> = (0..100_000)
            .map(|i| coord! {x: i as f64, y: if i % 2 == 0 { 0.0 } else { 10.0 }})
            .collect();
        let out = simplify_coords(&coords, 0.5, 0);
        assert_eq!(out.len(), coords.len());
    }
}
