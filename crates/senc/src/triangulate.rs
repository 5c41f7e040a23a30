//! Fill triangulation for area outlines (ear clipping via earcutr).

use crate::error::TriangulationFailure;

/// Twice the signed shoelace area of an open ring.
fn signed_area2(ring: &[[f64; 2]]) -> f64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let a = ring[i];
            let b = ring[(i + 1) % n];
            a[0] * b[1] - b[0] * a[1]
        })
        .sum()
}

/// Absolute shoelace area of a ring; a repeated closing point is harmless.
pub fn ring_area(ring: &[[f64; 2]]) -> f64 {
    signed_area2(ring).abs() * 0.5
}

fn triangle_area(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    ((b[0] - a[0]) * (c[1] - a[1]) - (c[0] - a[0]) * (b[1] - a[1])).abs() * 0.5
}

/// Triangulate one closed outer ring (last point equal to the first).
///
/// Returns a flat triangle list, three vertices per triangle. Self-intersecting
/// rings are caught by comparing the covered area with the ring's own area.
pub fn triangulate(ring: &[[f64; 2]]) -> Result<Vec<[f64; 2]>, TriangulationFailure> {
    let open = match ring {
        [first, .., last] if first == last => &ring[..ring.len() - 1],
        _ => ring,
    };

    if open.iter().any(|p| !(p[0].is_finite() && p[1].is_finite())) {
        return Err(TriangulationFailure::NonFinite);
    }

    let mut distinct: Vec<[f64; 2]> = open.to_vec();
    distinct.dedup();
    if distinct.len() > 1 && distinct.first() == distinct.last() {
        distinct.pop();
    }
    if distinct.len() < 3 {
        return Err(TriangulationFailure::TooFewVertices(distinct.len()));
    }

    let expected = ring_area(&distinct);
    if expected <= 0.0 {
        return Err(TriangulationFailure::ZeroArea);
    }

    let flat: Vec<f64> = distinct.iter().flat_map(|p| [p[0], p[1]]).collect();
    let indices =
        earcutr::earcut(&flat, &[], 2).map_err(|_| TriangulationFailure::Earcut)?;

    if indices.is_empty() || indices.len() % 3 != 0 {
        return Err(TriangulationFailure::Earcut);
    }

    let triangles: Vec<[f64; 2]> = indices.iter().map(|&i| distinct[i]).collect();
    let covered: f64 = triangles
        .chunks_exact(3)
        .map(|t| triangle_area(t[0], t[1], t[2]))
        .sum();

    if (covered - expected).abs() > 1e-6 * expected {
        return Err(TriangulationFailure::AreaMismatch { covered, expected });
    }

    Ok(triangles)
}
