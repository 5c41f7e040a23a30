//! Spherical Web-Mercator grid used for every stored vertex.
//!
//! Node, edge, triangle and sounding coordinates are metres on this grid,
//! relative to a centre (the cell centre, or a sounding cluster's own centre).

use std::f64::consts::FRAC_PI_4;

/// Sphere radius in metres (WGS-84 semi-major axis; no flattening).
pub const R: f64 = 6_378_137.0;

/// Geographic `(lon, lat)` in degrees to grid `(x, y)` in metres.
#[inline]
pub fn to_grid(lon: f64, lat: f64) -> [f64; 2] {
    let x = R * lon.to_radians();
    let y = R * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();

    [x, y]
}

/// Inverse of [`to_grid`]: grid `(x, y)` in metres to `(lon, lat)` in degrees.
#[inline]
pub fn to_geo(x: f64, y: f64) -> [f64; 2] {
    let lon = (x / R).to_degrees();
    let lat = (2.0 * (y / R).exp().atan() - 2.0 * FRAC_PI_4).to_degrees();

    [lon, lat]
}

/// A local frame: grid coordinates relative to a geographic centre,
/// optionally multiplied by a per-record `scale` (extended records).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridFrame {
    origin: [f64; 2],
}

impl GridFrame {
    /// Frame centred on `(lon, lat)` degrees.
    pub fn centered_at(lon: f64, lat: f64) -> Self {
        Self {
            origin: to_grid(lon, lat),
        }
    }

    pub fn origin(&self) -> [f64; 2] {
        self.origin
    }

    /// `(lon, lat)` to local grid metres.
    #[inline]
    pub fn to_local(&self, lonlat: [f64; 2]) -> [f64; 2] {
        let [x, y] = to_grid(lonlat[0], lonlat[1]);
        [x - self.origin[0], y - self.origin[1]]
    }

    /// Local grid metres to `(lon, lat)`.
    #[inline]
    pub fn to_geo(&self, xy: [f64; 2]) -> [f64; 2] {
        to_geo(xy[0] + self.origin[0], xy[1] + self.origin[1])
    }

    /// Stored (possibly scaled) coordinates to `(lon, lat)`.
    /// The scale is removed before the centre is added back.
    #[inline]
    pub fn scaled_to_geo(&self, xy: [f64; 2], scale: f64) -> [f64; 2] {
        self.to_geo([xy[0] / scale, xy[1] / scale])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn origin_maps_to_zero() {
        let [x, y] = to_grid(0.0, 0.0);
        assert_abs_diff_eq!(x, 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn one_degree_of_longitude_at_equator() {
        let [x, _] = to_grid(1.0, 0.0);
        assert_abs_diff_eq!(x, R * std::f64::consts::PI / 180.0, epsilon = 1e-6);
    }

    #[test]
    fn frame_round_trip() {
        let frame = GridFrame::centered_at(8.5, 54.1);
        let local = frame.to_local([8.6, 54.2]);
        let back = frame.to_geo(local);
        assert_abs_diff_eq!(back[0], 8.6, epsilon = 1e-9);
        assert_abs_diff_eq!(back[1], 54.2, epsilon = 1e-9);
    }

    #[test]
    fn scaled_coordinates_are_unscaled_before_recentering() {
        let frame = GridFrame::centered_at(10.0, 53.0);
        let local = frame.to_local([10.01, 53.02]);
        let stored = [local[0] * 10.0, local[1] * 10.0];
        let back = frame.scaled_to_geo(stored, 10.0);
        assert_abs_diff_eq!(back[0], 10.01, epsilon = 1e-9);
        assert_abs_diff_eq!(back[1], 53.02, epsilon = 1e-9);
    }

    proptest! {
        #[test]
        fn geo_grid_round_trip(lon in -180.0f64..180.0, lat in -84.999f64..84.999) {
            let [x, y] = to_grid(lon, lat);
            let [lon2, lat2] = to_geo(x, y);
            prop_assert!((lon - lon2).abs() < 1e-9);
            prop_assert!((lat - lat2).abs() < 1e-9);
        }
    }
}
