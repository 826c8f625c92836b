//! # Geographic Utilities
//!
//! Core geographic and angular computation utilities for GPS telemetry analysis.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two GPS fixes |
//! | [`bearing_deg`] | Compass bearing between consecutive fixes |
//! | [`wrap_deg`] | Normalize an angle into `[0, 360)` |
//! | [`signed_angle_diff_deg`] | Shortest signed angular distance |
//! | [`unwrap_deg`] | Remove 360° discontinuities from a heading series |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//!
//! ## Angular conventions
//!
//! Headings are compass bearings: 0° = north, 90° = east, increasing
//! clockwise. A left (counterclockwise) turn therefore *decreases* the
//! bearing. All angular arithmetic on headings must go through
//! [`signed_angle_diff_deg`] or [`unwrap_deg`]; naive subtraction produces
//! spurious ±360° jumps when the path crosses north.
//!
//! ## Coordinate system
//!
//! All functions expect WGS84 coordinates (latitude/longitude in degrees),
//! the standard produced by GPS receivers and karting data loggers.

use geo::{Distance, Haversine, Point};

/// Calculate the great-circle distance in meters between two GPS fixes
/// using the Haversine formula (spherical Earth, radius 6,371 km).
///
/// # Example
///
/// ```rust
/// use apex_telemetry::geo_utils::haversine_distance;
///
/// let london_to_paris = haversine_distance(51.5074, -0.1278, 48.8566, 2.3522);
/// assert!((london_to_paris - 343_560.0).abs() < 5000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let p1 = Point::new(lon1, lat1);
    let p2 = Point::new(lon2, lat2);
    Haversine::distance(p1, p2)
}

/// Compass bearing in degrees `[0, 360)` from fix 1 to fix 2.
///
/// Uses a local equirectangular approximation: latitude/longitude deltas are
/// projected to meters at the mean latitude, then converted to a bearing.
/// Accurate for the short (sub-100 m) segments between consecutive telemetry
/// samples; do not use for long baselines.
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat_mean = ((lat1 + lat2) / 2.0).to_radians();
    let dnorth = (lat2 - lat1).to_radians();
    let deast = (lon2 - lon1).to_radians() * lat_mean.cos();
    // atan2(east, north) gives the clockwise-from-north compass convention.
    wrap_deg(deast.atan2(dnorth).to_degrees())
}

/// Normalize an angle in degrees into `[0, 360)`.
#[inline]
pub fn wrap_deg(angle: f64) -> f64 {
    let wrapped = angle % 360.0;
    if wrapped < 0.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}

/// Shortest signed angular distance from `from` to `to`, in degrees,
/// in `[-180, 180)`. Positive means `to` lies clockwise of `from`.
///
/// This is the wrap-aware difference required for headings: the result for
/// `359° → 1°` is `+2°`, never `-358°`.
#[inline]
pub fn signed_angle_diff_deg(from: f64, to: f64) -> f64 {
    let mut diff = (to - from) % 360.0;
    if diff >= 180.0 {
        diff -= 360.0;
    } else if diff < -180.0 {
        diff += 360.0;
    }
    diff
}

/// Remove 360° discontinuities from a heading series.
///
/// Returns a continuous series (no longer confined to `[0, 360)`) where each
/// consecutive difference is the shortest signed angular distance. Smoothing
/// filters operate on this continuous form and re-wrap afterwards with
/// [`wrap_deg`].
pub fn unwrap_deg(headings: &[f64]) -> Vec<f64> {
    if headings.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(headings.len());
    out.push(headings[0]);
    for w in headings.windows(2) {
        let prev = *out.last().unwrap();
        out.push(prev + signed_angle_diff_deg(w[0], w[1]));
    }
    out
}

/// Convert meters to approximate degrees at a given latitude.
///
/// At the equator 1 degree ≈ 111,320 m; the factor shrinks with
/// `cos(latitude)` for longitude. Suitable for building square R-tree search
/// envelopes, not for precise distance work.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let meters_per_degree = 111_320.0 * latitude.to_radians().cos().max(0.1);
    meters / meters_per_degree
}
