//! Radio signal and timing calculations.
//!
//! Contains helpers for:
//! - Free-space path loss
//! - Fresnel-Kirchhoff diffraction and the single knife-edge loss approximation
//! - Bullington's equivalent knife-edge construction over a terrain profile
//! - Weissberger foliage loss
//! - Power conversions and packet airtime
//!
//! Units:
//! - Power: dBm, mW (conversion provided)
//! - Frequency: Hz
//! - Distance and heights: metres
//! - Time: seconds (f64) for mathematical expressions, embassy `Duration` for API

use embassy_time::Duration;

/// Speed of light used throughout the propagation model (m/s).
pub const SPEED_OF_LIGHT: f64 = 2.998e8;

/// Calculate the free-space path loss in dB.
///
/// # Formula
///
/// ```text
/// FSPL(dB) = 20 × log₁₀(4π × d × f / c)
/// ```
///
/// # Parameters
///
/// - `frequency`: Carrier frequency in Hz
/// - `distance`: Line-of-sight distance in metres
///
/// # Returns
///
/// Attenuation in dB. Returns 0 for co-located endpoints (`distance <= 0`).
///
/// # Examples
///
/// ```text
/// 433 kHz, 1 km → 25.18 dB
/// 433 MHz, 1 km → 85.18 dB
/// ```
pub fn free_space_attenuation_db(frequency: f64, distance: f64) -> f64 {
    if distance <= 0.0 {
        return 0.0;
    }
    20.0 * (4.0 * std::f64::consts::PI * distance * frequency / SPEED_OF_LIGHT).log10()
}

/// Wavelength in metres for a frequency in Hz.
pub fn wavelength(frequency: f64) -> f64 {
    SPEED_OF_LIGHT / frequency
}

/// Fresnel-Kirchhoff diffraction parameter `v` for an obstruction of height
/// `h` above the direct path, `d1`/`d2` metres from the two ends.
///
/// ```text
/// v = h × √(2 (d1 + d2) / (λ × d1 × d2))
/// ```
///
/// Callers must ensure `d1 > 0` and `d2 > 0`.
pub fn fresnel_kirchhoff_parameter(h: f64, d1: f64, d2: f64, wavelength: f64) -> f64 {
    h * (2.0 * (d1 + d2) / (wavelength * d1 * d2)).sqrt()
}

/// Single knife-edge diffraction loss approximation (ITU-R P.526) in dB.
///
/// ```text
/// J(v) = 6.9 + 20 log₁₀(√((v − 0.1)² + 1) + v − 0.1)   for v > −0.78
/// J(v) = 0                                              otherwise
/// ```
pub fn knife_edge_loss_db(v: f64) -> f64 {
    if v <= -0.78 {
        return 0.0;
    }
    let t = v - 0.1;
    6.9 + 20.0 * ((t * t + 1.0).sqrt() + t).log10()
}

/// Equivalent knife-edge of a terrain profile (Bullington, ITU-R P.526 fig. 12).
///
/// The profile holds `n` terrain heights evenly spaced over `distance`, with
/// the transmitter above the first sample and the receiver above the last.
/// The steepest line from each antenna over the interior terrain is found and
/// the two lines are intersected; the intersection is the dominant edge.
///
/// # Parameters
///
/// - `profile`: Terrain heights in metres
/// - `h1`, `h2`: Absolute antenna heights of transmitter and receiver
/// - `distance`: Path length in metres
///
/// # Returns
///
/// `Some((d1, d2, h))` with `h` the edge height above the direct line (negative
/// when the path is clear), or `None` when the profile has no interior samples.
pub fn bullington_figure_12(profile: &[f64], h1: f64, h2: f64, distance: f64) -> Option<(f64, f64, f64)> {
    let n = profile.len();
    if n < 3 || distance <= 0.0 {
        return None;
    }
    let step = distance / (n - 1) as f64;

    let mut slope_tx = f64::NEG_INFINITY;
    let mut slope_rx = f64::NEG_INFINITY;
    for (i, &height) in profile.iter().enumerate().take(n - 1).skip(1) {
        let x = i as f64 * step;
        slope_tx = slope_tx.max((height - h1) / x);
        slope_rx = slope_rx.max((height - h2) / (distance - x));
    }

    let direct = |x: f64| h1 + (h2 - h1) * x / distance;

    let denom = slope_tx + slope_rx;
    let (d1, edge) = if denom > 1e-12 {
        let x = ((h2 - h1 + slope_rx * distance) / denom).clamp(step, distance - step);
        (x, h1 + slope_tx * x)
    } else {
        // Lines diverge: fall back to the sample closest to the direct path.
        let (i, height) = profile
            .iter()
            .enumerate()
            .take(n - 1)
            .skip(1)
            .map(|(i, &h)| (i, h))
            .max_by(|a, b| {
                let ca = a.1 - direct(a.0 as f64 * step);
                let cb = b.1 - direct(b.0 as f64 * step);
                ca.total_cmp(&cb)
            })?;
        (i as f64 * step, height)
    };

    Some((d1, distance - d1, edge - direct(d1)))
}

/// Centred moving average with half-width `n`; windows are clipped at the
/// profile edges.
pub fn smooth_n(profile: &[f64], n: usize) -> Vec<f64> {
    (0..profile.len())
        .map(|i| {
            let lo = i.saturating_sub(n);
            let hi = (i + n + 1).min(profile.len());
            let window = &profile[lo..hi];
            window.iter().sum::<f64>() / window.len() as f64
        })
        .collect()
}

/// Maximum foliage depth the Weissberger model is defined for (m).
pub const WEISSBERGER_MAX_DEPTH: f64 = 400.0;

/// Weissberger modified exponential decay model for foliage loss in dB.
///
/// ```text
/// L = 0.45 × f^0.284 × d            for 0 < d ≤ 14 m
/// L = 1.33 × f^0.284 × d^0.588      for 14 < d ≤ 400 m
/// ```
///
/// with `f` in GHz. Depths beyond 400 m are evaluated at 400 m.
pub fn weissberger_foliage_loss_db(frequency: f64, depth: f64) -> f64 {
    if depth <= 0.0 {
        return 0.0;
    }
    let f_ghz = frequency / 1e9;
    let d = depth.min(WEISSBERGER_MAX_DEPTH);
    if d <= 14.0 {
        0.45 * f_ghz.powf(0.284) * d
    } else {
        1.33 * f_ghz.powf(0.284) * d.powf(0.588)
    }
}

/// Convert power from dBm to milliwatts.
///
/// ```text
/// 0 dBm   → 1 mW
/// -10 dBm → 0.1 mW
/// ```
pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

/// Convert power from milliwatts to dBm. The inverse of `dbm_to_mw()`.
pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// On-air time of a packet: `(len + overhead) × 8 / baud` seconds.
pub fn transmission_duration(payload_len: usize, overhead: usize, baud: f64) -> Duration {
    let seconds = ((payload_len + overhead) * 8) as f64 / baud;
    Duration::from_micros((seconds * 1_000_000.0).round() as u64)
}
