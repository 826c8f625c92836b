//! # Lap Segmentation
//!
//! Labels every sample with a lap number. Timing-loop beacon timestamps are
//! authoritative when supplied; without them the segmenter falls back to a
//! GPS start/finish heuristic: find the end of the pit exit, anchor a virtual
//! finish line one minimum-lap-distance further along, and count re-entries
//! into a small radius around that anchor.
//!
//! Lap numbering is advisory to the corner detector. Every failure mode here
//! degrades to a single lap with a warning rather than aborting the session.

use log::{info, warn};
use serde::Serialize;

use crate::geo_utils::haversine_distance;
use crate::{PipelineConfig, TelemetrySample};

/// How the lap boundaries were determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LapSource {
    /// External timing-loop crossing timestamps.
    Beacons,
    /// GPS start/finish-line heuristic.
    GpsFallback,
    /// Degraded: whole session labeled lap 1.
    SingleLap,
}

/// Result of lap segmentation.
#[derive(Debug, Clone, Serialize)]
pub struct LapSummary {
    /// Number of racing laps (lap numbers >= 1).
    pub lap_count: usize,
    pub source: LapSource,
    /// First sample index of each racing lap, in lap order.
    pub lap_start_indices: Vec<usize>,
}

/// Assign `lap_number` to every sample.
///
/// Samples before the first beacon (or before the detected pit exit) get
/// `lap_number = 0` and are excluded from corner confirmation downstream.
pub fn assign_laps(
    samples: &mut [TelemetrySample],
    beacons: &[f64],
    config: &PipelineConfig,
) -> LapSummary {
    if samples.is_empty() {
        return LapSummary {
            lap_count: 0,
            source: LapSource::SingleLap,
            lap_start_indices: Vec::new(),
        };
    }

    if !beacons.is_empty() {
        match assign_from_beacons(samples, beacons) {
            Some(summary) => return summary,
            None => warn!("[Laps] unusable beacon markers, falling back to GPS segmentation"),
        }
    }

    assign_from_gps(samples, config)
}

/// Beacon path: lap k covers `beacon[k-1] <= t < beacon[k]`; samples before
/// the first crossing are the out-lap (lap 0), samples after the last are
/// lap `beacons.len()`. Returns `None` when the markers are not a finite
/// ascending sequence.
fn assign_from_beacons(samples: &mut [TelemetrySample], beacons: &[f64]) -> Option<LapSummary> {
    if beacons.iter().any(|b| !b.is_finite()) {
        return None;
    }
    if beacons.windows(2).any(|w| w[1] <= w[0]) {
        return None;
    }

    for s in samples.iter_mut() {
        s.lap_number = beacons.iter().take_while(|&&b| s.time >= b).count();
    }

    let lap_start_indices = lap_starts(samples);
    let lap_count = lap_start_indices.len();
    info!("[Laps] {lap_count} laps from {} beacon markers", beacons.len());
    Some(LapSummary {
        lap_count,
        source: LapSource::Beacons,
        lap_start_indices,
    })
}

fn assign_from_gps(samples: &mut [TelemetrySample], config: &PipelineConfig) -> LapSummary {
    let n = samples.len();

    // 1. Pit exit: first sustained run above the exit-speed threshold
    let pit_exit = find_pit_exit(samples, config);
    let pit_exit = match pit_exit {
        Some(i) => i,
        None => {
            warn!("[Laps] no pit exit found, treating session as a single lap");
            return single_lap(samples);
        }
    };

    // 2. Finish anchor: the position reached min_lap_distance past pit exit
    let base_distance = samples[pit_exit].cumulative_distance;
    let anchor = samples[pit_exit..]
        .iter()
        .position(|s| s.cumulative_distance - base_distance >= config.min_lap_distance_m)
        .map(|off| pit_exit + off);
    let anchor = match anchor {
        Some(i) => i,
        None => {
            warn!(
                "[Laps] session shorter than {:.0} m past pit exit, single lap",
                config.min_lap_distance_m
            );
            return single_lap(samples);
        }
    };
    let finish_lat = samples[anchor].latitude_smooth;
    let finish_lon = samples[anchor].longitude_smooth;

    // 3. Count re-entries into the finish radius at racing speed, debounced
    // and guarded by a minimum distance since the previous crossing
    let mut lap = 1usize;
    let mut near_line = false;
    let mut last_crossing_distance = samples[anchor].cumulative_distance;
    for i in 0..n {
        if i < pit_exit {
            samples[i].lap_number = 0;
            continue;
        }
        if i > anchor {
            let d = haversine_distance(
                samples[i].latitude_smooth,
                samples[i].longitude_smooth,
                finish_lat,
                finish_lon,
            );
            if d < config.near_line_radius_m {
                let travelled = samples[i].cumulative_distance - last_crossing_distance;
                if !near_line
                    && samples[i].speed > config.pit_exit_speed_kmh
                    && travelled >= config.min_lap_distance_m
                {
                    lap += 1;
                    last_crossing_distance = samples[i].cumulative_distance;
                }
                near_line = true;
            } else {
                near_line = false;
            }
        }
        samples[i].lap_number = lap;
    }

    let lap_start_indices = lap_starts(samples);
    let lap_count = lap_start_indices.len();
    info!("[Laps] {lap_count} laps from GPS start/finish heuristic");
    LapSummary {
        lap_count,
        source: LapSource::GpsFallback,
        lap_start_indices,
    }
}

fn find_pit_exit(samples: &[TelemetrySample], config: &PipelineConfig) -> Option<usize> {
    let run = config.pit_exit_run_samples;
    if samples.len() < run {
        return None;
    }
    samples
        .windows(run)
        .position(|w| w.iter().all(|s| s.speed > config.pit_exit_speed_kmh))
}

fn single_lap(samples: &mut [TelemetrySample]) -> LapSummary {
    for s in samples.iter_mut() {
        s.lap_number = 1;
    }
    LapSummary {
        lap_count: 1,
        source: LapSource::SingleLap,
        lap_start_indices: vec![0],
    }
}

/// First sample index of each lap number >= 1, in ascending lap order.
fn lap_starts(samples: &[TelemetrySample]) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut current = 0usize;
    for (i, s) in samples.iter().enumerate() {
        if s.lap_number >= 1 && s.lap_number != current {
            starts.push(i);
            current = s.lap_number;
        }
    }
    starts
}
