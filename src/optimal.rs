//! # Optimal Trajectory Estimation
//!
//! Single-axle friction-circle model: the fastest sustainable cornering speed
//! for a turn of radius R is `v = sqrt(mu * g * R)`. Radius comes from the
//! mean curvature over all of a corner's member samples across laps, which
//! averages out per-lap GPS noise.
//!
//! Estimates outside the plausible karting band are left as NaN rather than
//! clamped, so consumers can tell "not estimable at this GPS resolution"
//! apart from a real number.

use log::info;

use crate::{Corner, PipelineConfig, TelemetrySample, GRAVITY_MS2};

/// Fill `apex_speed_optimal` and `speed_efficiency` on each confirmed corner.
pub fn estimate_optimal_speeds(
    samples: &[TelemetrySample],
    corners: &mut [Corner],
    config: &PipelineConfig,
) {
    let mut estimated = 0usize;
    for corner in corners.iter_mut() {
        let mut sum = 0.0;
        let mut count = 0usize;
        for lap_data in &corner.per_lap_data {
            for s in &samples[lap_data.entry_index..=lap_data.exit_index] {
                if s.curvature.abs() > 0.0 {
                    sum += s.curvature.abs();
                    count += 1;
                }
            }
        }
        if count == 0 {
            continue;
        }
        let mean_curvature = sum / count as f64;
        let radius_m = 1.0 / mean_curvature;

        let v_optimal_kmh =
            (config.friction_coeff * GRAVITY_MS2 * radius_m).sqrt() * 3.6;
        if v_optimal_kmh <= config.optimal_speed_min_kmh
            || v_optimal_kmh >= config.optimal_speed_max_kmh
        {
            info!(
                "[Optimal] corner {}: {:.0} km/h outside plausible band, left unset",
                corner.id, v_optimal_kmh
            );
            continue;
        }

        let apex_mean = corner
            .per_lap_data
            .iter()
            .map(|d| d.apex_speed)
            .sum::<f64>()
            / corner.per_lap_data.len() as f64;

        corner.apex_speed_optimal = v_optimal_kmh;
        corner.speed_efficiency = apex_mean / v_optimal_kmh;
        estimated += 1;
    }
    info!("[Optimal] estimated {estimated} of {} corners", corners.len());
}
