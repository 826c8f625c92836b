//! # Per-Corner Performance Metrics
//!
//! Driver-facing numbers derived from a confirmed corner: weighted entry and
//! exit speeds around the apex, real versus ideal braking point, and an
//! estimate of time lost against the driver's own best traversal.
//!
//! "Optimal" here means the best the driver actually achieved across laps,
//! not the physics estimate from [`crate::optimal`]; a driver cannot be
//! coached toward a speed the GPS never saw them reach.

use log::warn;

use crate::{Corner, TelemetrySample};

/// Samples averaged on each side of the apex for entry/exit speed.
const ENTRY_EXIT_POINTS: usize = 15;
/// Fewest samples on a side before the weighted average is meaningful.
const ENTRY_EXIT_MIN_POINTS: usize = 5;
/// Maximum braking deceleration for a kart, in g.
const MAX_BRAKING_DECEL_G: f64 = 1.5;
/// Speed drop between consecutive samples that marks the braking point (km/h).
const BRAKING_DELTA_KMH: f64 = 2.0;

/// Performance metrics for one corner.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CornerMetrics {
    pub corner_id: usize,
    /// Mean apex speed across laps (km/h).
    pub apex_speed_real: f64,
    /// Best apex speed across laps (km/h).
    pub apex_speed_best: f64,
    /// Distance-weighted mean speed approaching the apex, when enough
    /// samples exist on that side.
    pub entry_speed: Option<f64>,
    pub exit_speed: Option<f64>,
    /// Distance before the apex where braking actually started (m).
    pub braking_point_real_m: f64,
    /// Braking distance the friction model says is needed (m).
    pub braking_point_optimal_m: f64,
    /// Positive means braking earlier than needed.
    pub braking_delta_m: f64,
    pub time_in_corner_s: f64,
    /// Time lost versus the best traversal, clamped to [0, 5] s.
    pub time_lost_s: f64,
}

/// Compute performance metrics for one confirmed corner.
///
/// Degradable: a corner whose per-lap data is unusable yields `None` with a
/// warning rather than failing the session.
pub fn analyze_corner(samples: &[TelemetrySample], corner: &Corner) -> Option<CornerMetrics> {
    if corner.per_lap_data.is_empty() {
        warn!("[Metrics] corner {} has no per-lap data, skipping", corner.id);
        return None;
    }
    let n = samples.len();
    if corner.apex_index >= n || corner.entry_index >= n || corner.exit_index >= n {
        warn!("[Metrics] corner {} indices out of range, skipping", corner.id);
        return None;
    }

    let apex_speeds: Vec<f64> = corner.per_lap_data.iter().map(|d| d.apex_speed).collect();
    let apex_speed_real = apex_speeds.iter().sum::<f64>() / apex_speeds.len() as f64;
    // The driver's own record is the speed target
    let apex_speed_best = apex_speeds.iter().copied().fold(apex_speed_real, f64::max);

    let (entry_speed, exit_speed) = entry_exit_speeds(samples, corner.apex_index);

    let entry_for_braking = entry_speed.unwrap_or(corner.per_lap_data[0].entry_speed);
    let (braking_point_real_m, braking_point_optimal_m) = braking_point(
        samples,
        corner.entry_index,
        corner.apex_index,
        entry_for_braking,
        apex_speed_real,
    );

    let time_in_corner_s = samples[corner.exit_index].time - samples[corner.entry_index].time;

    let segment_length = (samples[corner.exit_index].cumulative_distance
        - samples[corner.entry_index].cumulative_distance)
        .clamp(5.0, 200.0);
    let v_real_ms = apex_speed_real / 3.6;
    let v_best_ms = apex_speed_best / 3.6;
    let time_lost_s = if v_real_ms > 0.0 && v_best_ms > v_real_ms {
        (segment_length / v_real_ms - segment_length / v_best_ms).clamp(0.0, 5.0)
    } else {
        0.0
    };

    Some(CornerMetrics {
        corner_id: corner.id,
        apex_speed_real,
        apex_speed_best,
        entry_speed,
        exit_speed,
        braking_point_real_m,
        braking_point_optimal_m,
        braking_delta_m: braking_point_real_m - braking_point_optimal_m,
        time_in_corner_s,
        time_lost_s,
    })
}

/// Weighted mean speed over up to [`ENTRY_EXIT_POINTS`] samples on each side
/// of the apex, weights increasing toward the apex. Either side with fewer
/// than [`ENTRY_EXIT_MIN_POINTS`] samples yields `None`.
fn entry_exit_speeds(samples: &[TelemetrySample], apex: usize) -> (Option<f64>, Option<f64>) {
    let start = apex.saturating_sub(ENTRY_EXIT_POINTS);
    let end = (apex + ENTRY_EXIT_POINTS + 1).min(samples.len());

    let entry = &samples[start..apex];
    let exit = if apex + 1 < end { &samples[apex + 1..end] } else { &[][..] };
    if entry.len() < ENTRY_EXIT_MIN_POINTS || exit.len() < ENTRY_EXIT_MIN_POINTS {
        return (None, None);
    }

    let entry_speed = weighted_speed(entry.iter().map(|s| s.speed), false);
    let exit_speed = weighted_speed(exit.iter().map(|s| s.speed), true);
    (entry_speed, exit_speed)
}

/// `reverse = false` weights later samples more (approach to apex);
/// `reverse = true` weights earlier samples more (departure from apex).
fn weighted_speed(speeds: impl ExactSizeIterator<Item = f64>, reverse: bool) -> Option<f64> {
    let len = speeds.len();
    let mut num = 0.0;
    let mut den = 0.0;
    let mut any_positive = false;
    for (k, raw) in speeds.enumerate() {
        let v = if raw.is_finite() { raw } else { 0.0 };
        if v > 0.0 {
            any_positive = true;
        }
        let weight = if reverse { (len - k) as f64 } else { (k + 1) as f64 };
        num += v * weight;
        den += weight;
    }
    if any_positive && den > 0.0 {
        Some(num / den)
    } else {
        None
    }
}

/// Real braking distance = arc length from the first significant deceleration
/// between entry and apex to the apex; without one, assume braking over 60%
/// of the entry segment. Optimal = `(v_e^2 - v_a^2) / (2 * a_max)`.
fn braking_point(
    samples: &[TelemetrySample],
    entry: usize,
    apex: usize,
    entry_speed_kmh: f64,
    apex_speed_kmh: f64,
) -> (f64, f64) {
    let apex_dist = samples[apex].cumulative_distance;
    let entry_dist = samples[entry].cumulative_distance;

    let braking_idx = (entry..apex)
        .find(|&i| i + 1 < samples.len() && samples[i + 1].speed - samples[i].speed < -BRAKING_DELTA_KMH);
    let real = match braking_idx {
        Some(i) => apex_dist - samples[i].cumulative_distance,
        None => (apex_dist - entry_dist) * 0.6,
    };

    let v_entry_ms = entry_speed_kmh / 3.6;
    let v_apex_ms = apex_speed_kmh / 3.6;
    let decel = MAX_BRAKING_DECEL_G * crate::GRAVITY_MS2;
    let optimal = ((v_entry_ms * v_entry_ms - v_apex_ms * v_apex_ms) / (2.0 * decel)).max(0.0);

    (real, optimal)
}
