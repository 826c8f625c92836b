//! # Trajectory Geometry
//!
//! Derives per-sample path geometry from the smoothed GPS trace:
//!
//! - segment and cumulative distance (haversine arc length)
//! - compass heading, smoothed with unwrap-aware rolling median
//! - signed path curvature (three-point method, + = left turn)
//! - lateral acceleration in g, clamped to the karting grip envelope
//! - throttle/brake estimates inferred from speed deltas when the logger
//!   recorded neither pedal
//!
//! All angular work goes through [`crate::geo_utils`] so the 0°/360°
//! boundary never produces phantom direction changes.

use log::warn;

use crate::filtering::savgol_smooth;
use crate::geo_utils::{bearing_deg, haversine_distance, signed_angle_diff_deg, unwrap_deg, wrap_deg};
use crate::{InputError, PipelineConfig, TelemetrySample};

/// Minimum number of samples required for geometry derivation.
pub const MIN_GEOMETRY_SAMPLES: usize = 3;

/// Curvature magnitudes below this (radius > 10 km) are straight-line noise.
const CURVATURE_NOISE_FLOOR: f64 = 1e-4;

/// Lateral acceleration clamp in g, the physical bound for karting-class grip.
const MAX_LATERAL_G: f64 = 3.0;

/// Segments shorter than this (m) carry no usable bearing information.
const MIN_BEARING_SEGMENT_M: f64 = 0.1;

/// Compute distance, heading, curvature, lateral-g and (when absent)
/// throttle/brake columns from the smoothed GPS path.
///
/// Requires [`crate::filtering::smooth_gps`] to have run first; fails with
/// [`InputError::MissingChannel`] otherwise, and with
/// [`InputError::TooFewSamples`] below [`MIN_GEOMETRY_SAMPLES`] rows.
pub fn compute_geometry(
    samples: &mut [TelemetrySample],
    config: &PipelineConfig,
) -> Result<(), InputError> {
    let n = samples.len();
    if n < MIN_GEOMETRY_SAMPLES {
        return Err(InputError::TooFewSamples {
            found: n,
            required: MIN_GEOMETRY_SAMPLES,
        });
    }
    if samples.iter().all(|s| !s.latitude_smooth.is_finite()) {
        return Err(InputError::MissingChannel("latitude_smooth"));
    }

    let mut lat: Vec<f64> = samples.iter().map(|s| s.latitude_smooth).collect();
    let mut lon: Vec<f64> = samples.iter().map(|s| s.longitude_smooth).collect();
    let mut speed: Vec<f64> = samples.iter().map(|s| s.speed).collect();

    let nan_count = lat
        .iter()
        .zip(&lon)
        .zip(&speed)
        .filter(|((la, lo), sp)| !la.is_finite() || !lo.is_finite() || !sp.is_finite())
        .count();
    if nan_count as f64 / n as f64 > 0.1 {
        warn!(
            "[Geometry] high NaN ratio: {:.1}% of {} samples",
            100.0 * nan_count as f64 / n as f64,
            n
        );
    }

    let backwards = samples
        .windows(2)
        .filter(|w| w[1].time < w[0].time)
        .count();
    if backwards > 0 {
        warn!("[Geometry] time goes backwards at {backwards} sample boundaries");
    }

    fill_gaps(&mut lat, 3);
    fill_gaps(&mut lon, 3);
    fill_gaps(&mut speed, 3);

    // 1. Segment + cumulative distance
    let mut segment = vec![0.0; n];
    for i in 1..n {
        let d = haversine_distance(lat[i - 1], lon[i - 1], lat[i], lon[i]);
        segment[i] = if d.is_finite() { d } else { 0.0 };
    }
    let mut cumulative = vec![0.0; n];
    for i in 1..n {
        cumulative[i] = cumulative[i - 1] + segment[i];
    }

    // 2. Heading: compass bearing, carried forward across stationary segments
    let mut heading = vec![0.0; n];
    for i in 1..n {
        heading[i] = if segment[i] > MIN_BEARING_SEGMENT_M {
            bearing_deg(lat[i - 1], lon[i - 1], lat[i], lon[i])
        } else {
            heading[i - 1]
        };
    }
    heading[0] = heading[1];
    let heading = smooth_heading(&heading, config.heading_median_window);

    // 3. Curvature: three-point method on the smoothed heading
    let mut curvature = vec![0.0; n];
    for i in 1..n - 1 {
        if speed[i] < config.speed_floor_kmh {
            continue;
        }
        let dist_total = segment[i] + segment[i + 1];
        if dist_total < MIN_BEARING_SEGMENT_M {
            continue;
        }

        let delta_deg = signed_angle_diff_deg(heading[i - 1], heading[i])
            + signed_angle_diff_deg(heading[i], heading[i + 1]);
        let delta_rad = delta_deg.to_radians();
        if delta_rad.abs() <= 0.001 {
            continue;
        }

        let magnitude = delta_rad.abs() / dist_total;
        // Compass bearings decrease through a left turn
        let sign = if delta_deg < 0.0 { 1.0 } else { -1.0 };
        curvature[i] = sign * magnitude;
    }
    for c in curvature.iter_mut() {
        if c.abs() < CURVATURE_NOISE_FLOOR {
            *c = 0.0;
        }
    }

    // Second smoothing pass to remove point-to-point noise while keeping
    // corner shape; window grows with the dataset, stays odd, min 5
    let mut smooth_window = (n / 50).clamp(5, 11);
    if smooth_window % 2 == 0 {
        smooth_window += 1;
    }
    if n >= smooth_window {
        if let Some(smoothed) = savgol_smooth(&curvature, smooth_window, 2) {
            curvature = smoothed;
        }
    }
    for c in curvature.iter_mut() {
        if !c.is_finite() {
            *c = 0.0;
        }
    }

    // 4. Lateral acceleration in g, signed by curvature, clamped
    let mut lateral_g = vec![0.0; n];
    for i in 0..n {
        if speed[i] > config.speed_floor_kmh && curvature[i].abs() > CURVATURE_NOISE_FLOOR {
            let v_ms = speed[i] / 3.6;
            let magnitude = (v_ms * v_ms * curvature[i].abs() / crate::GRAVITY_MS2)
                .clamp(0.0, MAX_LATERAL_G);
            lateral_g[i] = curvature[i].signum() * magnitude;
        }
    }

    // 5. Pedal inference, only when the logger recorded neither channel
    let infer_pedals = samples.iter().all(|s| s.throttle.is_nan() && s.brake.is_nan());
    let mut throttle = vec![0.0; n];
    let mut brake = vec![0.0; n];
    if infer_pedals {
        for i in 1..n {
            let delta_v = speed[i] - speed[i - 1];
            if delta_v > 0.5 {
                throttle[i] = (delta_v * 20.0).min(100.0);
            } else if delta_v < -0.5 {
                brake[i] = (-delta_v * 20.0).min(100.0);
            }
        }
    }

    for (i, s) in samples.iter_mut().enumerate() {
        s.segment_distance = segment[i];
        s.cumulative_distance = cumulative[i];
        s.heading = heading[i];
        s.curvature = curvature[i];
        s.lateral_g = lateral_g[i];
        if infer_pedals {
            s.throttle = throttle[i];
            s.brake = brake[i];
        }
    }

    Ok(())
}

/// Smooth a heading series with a centered rolling median over the unwrapped
/// (continuous) form, then re-wrap into `[0, 360)`. The median suppresses
/// single-sample GPS jitter without flattening real direction changes.
fn smooth_heading(heading: &[f64], window: usize) -> Vec<f64> {
    if heading.len() < window || window < 2 {
        return heading.to_vec();
    }
    let window = if window % 2 == 0 { window - 1 } else { window };
    let half = window / 2;

    let unwrapped = unwrap_deg(heading);
    let mut out = Vec::with_capacity(heading.len());
    let mut buf = Vec::with_capacity(window);
    for i in 0..unwrapped.len() {
        let start = i.saturating_sub(half);
        let end = (i + half + 1).min(unwrapped.len());
        buf.clear();
        buf.extend_from_slice(&unwrapped[start..end]);
        buf.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        out.push(wrap_deg(buf[buf.len() / 2]));
    }
    out
}

/// Forward- then back-fill non-finite values, at most `limit` positions deep;
/// anything still unfilled becomes 0.0.
fn fill_gaps(values: &mut [f64], limit: usize) {
    let mut last = None;
    let mut gap = 0usize;
    for v in values.iter_mut() {
        if v.is_finite() {
            last = Some(*v);
            gap = 0;
        } else if let Some(fill) = last {
            gap += 1;
            if gap <= limit {
                *v = fill;
            }
        }
    }
    let mut next = None;
    let mut gap = 0usize;
    for v in values.iter_mut().rev() {
        if v.is_finite() {
            next = Some(*v);
            gap = 0;
        } else if let Some(fill) = next {
            gap += 1;
            if gap <= limit {
                *v = fill;
            }
        }
    }
    for v in values.iter_mut() {
        if !v.is_finite() {
            *v = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAT0: f64 = 45.0;
    const LON0: f64 = 7.0;
    const M_PER_DEG: f64 = 111_320.0;

    fn sample_at(north_m: f64, east_m: f64, speed: f64, time: f64) -> TelemetrySample {
        let lat = LAT0 + north_m / M_PER_DEG;
        let lon = LON0 + east_m / (M_PER_DEG * LAT0.to_radians().cos());
        let mut s = TelemetrySample::new(lat, lon, speed, time);
        // Bypass the conditioner for geometry-only tests
        s.latitude_smooth = lat;
        s.longitude_smooth = lon;
        s
    }

    /// Circular arc of radius `r` m. `ccw = true` turns left (bearing
    /// decreasing), `false` turns right.
    fn arc(r: f64, speed_kmh: f64, dt: f64, steps: usize, ccw: bool) -> Vec<TelemetrySample> {
        let v_ms = speed_kmh / 3.6;
        let dtheta = v_ms * dt / r;
        (0..steps)
            .map(|k| {
                let theta = if ccw {
                    k as f64 * dtheta
                } else {
                    -(k as f64) * dtheta
                };
                sample_at(r * theta.sin(), r * theta.cos(), speed_kmh, k as f64 * dt)
            })
            .collect()
    }

    #[test]
    fn test_too_few_samples() {
        let mut samples = vec![sample_at(0.0, 0.0, 60.0, 0.0), sample_at(1.0, 0.0, 60.0, 0.1)];
        assert!(matches!(
            compute_geometry(&mut samples, &PipelineConfig::default()),
            Err(InputError::TooFewSamples { found: 2, required: 3 })
        ));
    }

    #[test]
    fn test_missing_smoothed_channel() {
        let mut samples: Vec<TelemetrySample> = (0..20)
            .map(|i| TelemetrySample::new(LAT0, LON0 + i as f64 * 1e-5, 60.0, i as f64 * 0.1))
            .collect();
        assert!(matches!(
            compute_geometry(&mut samples, &PipelineConfig::default()),
            Err(InputError::MissingChannel("latitude_smooth"))
        ));
    }

    #[test]
    fn test_cumulative_distance_monotonic() {
        // Wiggly path with a NaN hole: cumulative distance must never decrease
        let mut samples: Vec<TelemetrySample> = (0..100)
            .map(|i| {
                let wiggle = (i as f64 * 0.7).sin() * 0.5;
                sample_at(i as f64 * 1.5, wiggle, 50.0, i as f64 * 0.1)
            })
            .collect();
        samples[40].latitude_smooth = f64::NAN;
        samples[41].latitude_smooth = f64::NAN;

        compute_geometry(&mut samples, &PipelineConfig::default()).unwrap();

        for w in samples.windows(2) {
            assert!(
                w[1].cumulative_distance >= w[0].cumulative_distance,
                "distance decreased: {} -> {}",
                w[0].cumulative_distance,
                w[1].cumulative_distance
            );
        }
    }

    #[test]
    fn test_left_arc_has_positive_curvature_and_g() {
        let mut samples = arc(20.0, 40.0, 0.1, 120, true);
        compute_geometry(&mut samples, &PipelineConfig::default()).unwrap();

        // Mid-arc: expect curvature near 1/20 and positive, lateral-g positive
        let mid = &samples[60];
        assert!(mid.curvature > 0.02, "curvature = {}", mid.curvature);
        assert!(mid.curvature < 0.1);
        // v²/(gR) = (11.1²)/(9.81·20) ≈ 0.63 g
        assert!(mid.lateral_g > 0.3 && mid.lateral_g < 1.0, "lateral_g = {}", mid.lateral_g);
    }

    #[test]
    fn test_right_arc_mirrors_sign() {
        let mut left = arc(20.0, 40.0, 0.1, 120, true);
        let mut right = arc(20.0, 40.0, 0.1, 120, false);
        compute_geometry(&mut left, &PipelineConfig::default()).unwrap();
        compute_geometry(&mut right, &PipelineConfig::default()).unwrap();

        assert!(left[60].curvature > 0.0);
        assert!(right[60].curvature < 0.0);
        assert!(left[60].lateral_g > 0.0);
        assert!(right[60].lateral_g < 0.0);
        assert!((left[60].curvature + right[60].curvature).abs() < 0.01);
    }

    #[test]
    fn test_straight_path_across_north_stays_straight() {
        // Heading jitters around 0°/360°; curvature must stay zeroed and the
        // smoothed heading must sit near north at every sample.
        let mut samples: Vec<TelemetrySample> = (0..80)
            .map(|i| {
                let east = (i as f64 * 1.3).sin() * 0.02; // 2 cm jitter
                sample_at(i as f64 * 1.5, east, 55.0, i as f64 * 0.1)
            })
            .collect();
        compute_geometry(&mut samples, &PipelineConfig::default()).unwrap();

        for s in &samples[2..78] {
            let from_north = s.heading.min(360.0 - s.heading);
            assert!(from_north < 5.0, "heading {} strayed from north", s.heading);
            assert!(s.curvature.abs() < 0.01);
        }
    }

    #[test]
    fn test_stationary_samples_have_zero_curvature() {
        let mut samples = arc(15.0, 3.0, 0.1, 60, true); // below the 5 km/h floor
        compute_geometry(&mut samples, &PipelineConfig::default()).unwrap();
        for s in &samples {
            assert_eq!(s.lateral_g, 0.0);
        }
    }

    #[test]
    fn test_pedal_inference_from_speed_deltas() {
        let mut samples: Vec<TelemetrySample> = (0..30)
            .map(|i| {
                let speed = if i < 10 {
                    40.0 + i as f64 * 2.0 // accelerating
                } else if i < 20 {
                    60.0 - (i - 10) as f64 * 3.0 // braking
                } else {
                    30.0 // coasting
                };
                sample_at(i as f64 * 1.5, 0.0, speed, i as f64 * 0.1)
            })
            .collect();
        compute_geometry(&mut samples, &PipelineConfig::default()).unwrap();

        assert!(samples[5].throttle > 0.0);
        assert_eq!(samples[5].brake, 0.0);
        assert!(samples[15].brake > 0.0);
        assert_eq!(samples[15].throttle, 0.0);
        assert_eq!(samples[25].throttle, 0.0);
        assert_eq!(samples[25].brake, 0.0);
    }

    #[test]
    fn test_measured_pedals_left_untouched() {
        let mut samples: Vec<TelemetrySample> = (0..30)
            .map(|i| {
                let mut s = sample_at(i as f64 * 1.5, 0.0, 50.0 + i as f64, i as f64 * 0.1);
                s.throttle = 42.0;
                s.brake = 0.0;
                s
            })
            .collect();
        compute_geometry(&mut samples, &PipelineConfig::default()).unwrap();
        assert_eq!(samples[10].throttle, 42.0);
    }
}
