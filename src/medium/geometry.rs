//! Geographic distance and projection helpers.
//!
//! Contains helper functions for:
//! - Great-circle distance on a spherical Earth (haversine)
//! - Line-of-sight distance including altitude difference
//! - Web-Mercator projection from lat/lng to global pixel coordinates
//! - Sampling points along a straight pixel line

use std::f64::consts::PI;

use crate::common::types::Location;

/// Mean Earth radius in metres.
pub const EARTH_RADIUS: f64 = 6_371e3;

/// Great-circle distance in metres between two locations, ignoring altitude.
///
/// # Formula
///
/// ```text
/// a = sin²(Δφ/2) + cos φ1 · cos φ2 · sin²(Δλ/2)
/// d = 2R · atan2(√a, √(1−a))
/// ```
pub fn great_circle_distance(a: &Location, b: &Location) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lng - a.lng).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS * c
}

/// Straight-line distance in metres including the altitude difference.
///
/// Unset altitudes count as 0 m.
pub fn line_of_sight_distance(a: &Location, b: &Location) -> f64 {
    let ground = great_circle_distance(a, b);
    let d_alt = b.alt.unwrap_or(0.0) - a.alt.unwrap_or(0.0);
    (ground * ground + d_alt * d_alt).sqrt()
}

/// Project a location onto the global Web-Mercator pixel grid at `level`.
///
/// # Returns
///
/// `(x, y)` in pixels where the whole world spans `tile_size · 2^level` pixels.
pub fn web_mercator_pixel(location: &Location, level: u32, tile_size: u32) -> (f64, f64) {
    let world = tile_size as f64 * 2f64.powi(level as i32);
    let lat = location.lat.clamp(-85.051_128_78, 85.051_128_78).to_radians();
    let x = (location.lng + 180.0) / 360.0 * world;
    let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * world;
    (x, y)
}

/// Evenly spaced points on the segment between two pixel positions, one per
/// pixel of the longer axis, endpoints included.
pub fn pixel_line(start: (f64, f64), end: (f64, f64)) -> Vec<(f64, f64)> {
    let dx = end.0 - start.0;
    let dy = end.1 - start.1;
    let steps = dx.abs().max(dy.abs()).ceil() as usize;
    if steps == 0 {
        return vec![start];
    }
    (0..=steps)
        .map(|i| {
            let t = i as f64 / steps as f64;
            (start.0 + dx * t, start.1 + dy * t)
        })
        .collect()
}
