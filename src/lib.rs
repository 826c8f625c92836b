//! # Apex Telemetry
//!
//! Batch analysis pipeline for karting GPS telemetry.
//!
//! This library provides:
//! - Savitzky-Golay GPS conditioning with signal-quality diagnostics
//! - Path geometry: distance, heading, curvature, lateral acceleration
//! - Lap segmentation from timing beacons or a GPS start/finish heuristic
//! - Corner detection with cross-lap confirmation and stable numbering
//! - Friction-circle optimal speed estimates and per-corner driver metrics
//!
//! The pipeline is single-threaded and CPU-bound: it owns one sample table,
//! enriches it stage by stage, and performs no I/O. Hosts serving multiple
//! sessions run one pipeline invocation per session, off the request path.
//!
//! ## Quick Start
//!
//! ```rust
//! use apex_telemetry::{analyze_session, PipelineConfig, TelemetrySample};
//!
//! // A straight 10 Hz GPS trace at 60 km/h
//! let mut samples: Vec<TelemetrySample> = (0..200)
//!     .map(|i| TelemetrySample::new(45.0 + i as f64 * 1.5e-5, 7.0, 60.0, i as f64 * 0.1))
//!     .collect();
//!
//! let context = analyze_session(&mut samples, &[], &PipelineConfig::default()).unwrap();
//! assert_eq!(context.corners.total_corners, 0); // no turns on a straight
//! assert!(samples[100].cumulative_distance > 0.0);
//! ```

use std::fmt;
use std::time::Instant;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod geo_utils;

// GPS conditioning (Savitzky-Golay smoothing + quality diagnostics)
pub mod filtering;
pub use filtering::{smooth_gps, FilterReport, SignalQuality};

// Path geometry derived from the smoothed trace
pub mod geometry;
pub use geometry::compute_geometry;

// Lap segmentation from beacons or GPS fallback
pub mod laps;
pub use laps::{assign_laps, LapSource, LapSummary};

// Corner detection and cross-lap confirmation
pub mod corners;
pub use corners::{detect_corners, CornerConfig};

// Friction-circle optimal speed estimation
pub mod optimal;
pub use optimal::estimate_optimal_speeds;

// Per-corner driver performance metrics
pub mod metrics;
pub use metrics::{analyze_corner, CornerMetrics};

/// Standard gravity in m/s².
pub const GRAVITY_MS2: f64 = 9.81;

// ============================================================================
// Core Types
// ============================================================================

/// One telemetry sample, raw columns plus everything the pipeline derives.
///
/// Raw `latitude`/`longitude`/`speed`/`time` come from the loader; the rest
/// starts empty (`NaN` for smoothed coordinates and pedals, zero elsewhere)
/// and is filled in stage by stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub latitude: f64,
    pub longitude: f64,
    /// Speed over ground in km/h.
    pub speed: f64,
    /// Session time in seconds.
    pub time: f64,

    pub latitude_smooth: f64,
    pub longitude_smooth: f64,
    /// Distance from the previous sample (m).
    pub segment_distance: f64,
    /// Arc-length position from session start (m).
    pub cumulative_distance: f64,
    /// Compass bearing in [0, 360).
    pub heading: f64,
    /// Signed path curvature in 1/m, positive for left turns.
    pub curvature: f64,
    /// Signed lateral acceleration in g, same sign as curvature.
    pub lateral_g: f64,
    /// Percent, measured or inferred from speed deltas.
    pub throttle: f64,
    pub brake: f64,

    /// 0 for the pit/out-lap, 1.. for racing laps.
    pub lap_number: usize,
    pub is_corner: bool,
    /// Confirmed corner id (1..), 0 outside corners.
    pub corner_id: usize,
    pub corner_type: CornerType,
    pub is_apex: bool,
}

impl TelemetrySample {
    /// Sample from raw logger columns, derived fields unset.
    pub fn new(latitude: f64, longitude: f64, speed: f64, time: f64) -> Self {
        TelemetrySample {
            latitude,
            longitude,
            speed,
            time,
            latitude_smooth: f64::NAN,
            longitude_smooth: f64::NAN,
            segment_distance: 0.0,
            cumulative_distance: 0.0,
            heading: 0.0,
            curvature: 0.0,
            lateral_g: 0.0,
            throttle: f64::NAN,
            brake: f64::NAN,
            lap_number: 0,
            is_corner: false,
            corner_id: 0,
            corner_type: CornerType::Straight,
            is_apex: false,
        }
    }
}

/// Turn direction from the driver's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CornerType {
    Left,
    Right,
    Straight,
}

impl fmt::Display for CornerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CornerType::Left => write!(f, "left"),
            CornerType::Right => write!(f, "right"),
            CornerType::Straight => write!(f, "straight"),
        }
    }
}

/// One corner traversal on one lap.
#[derive(Debug, Clone, Serialize)]
pub struct CornerLapData {
    pub lap: usize,
    pub entry_index: usize,
    pub apex_index: usize,
    pub exit_index: usize,
    pub entry_speed: f64,
    pub apex_speed: f64,
    pub exit_speed: f64,
    pub max_lateral_g: f64,
}

/// A physical corner of the circuit, confirmed across laps.
///
/// Created once per analysis run by cross-lap clustering; immutable
/// afterwards except for final renumbering and the optimal-speed fields.
#[derive(Debug, Clone, Serialize)]
pub struct Corner {
    /// 1-indexed, assigned by circuit-chronological position.
    pub id: usize,
    pub corner_type: CornerType,
    /// Representative sample indices for display, from the median traversal.
    pub entry_index: usize,
    pub apex_index: usize,
    pub exit_index: usize,
    /// Distinct laps in which this corner was confirmed.
    pub confirmed_in_laps: usize,
    /// 0-1, from the apex GPS spread across laps.
    pub consistency_score: f64,
    /// Apex position averaged across laps.
    pub apex_lat: f64,
    pub apex_lon: f64,
    /// Friction-circle estimate in km/h; NaN when not physically estimable.
    pub apex_speed_optimal: f64,
    /// Mean real apex speed over the estimate; NaN when unset.
    pub speed_efficiency: f64,
    /// One entry per confirmed traversal, ordered by lap.
    pub per_lap_data: Vec<CornerLapData>,
}

/// Session-level corner collection and aggregates.
#[derive(Debug, Clone, Serialize)]
pub struct CornersSummary {
    pub total_corners: usize,
    pub total_distance_m: f64,
    /// Mean speed over racing laps (km/h).
    pub avg_speed_kmh: f64,
    pub max_lateral_g: f64,
    /// Confirmed corners in circuit order.
    pub corners: Vec<Corner>,
}

/// Everything the pipeline learned about a session beyond the per-sample
/// columns: conditioning diagnostics, lap structure, and corners.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisContext {
    pub filtering: FilterReport,
    pub laps: LapSummary,
    pub corners: CornersSummary,
}

/// Fatal input errors. Everything else in the pipeline degrades with a
/// warning instead of failing the session.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("too few samples: {found} (need at least {required})")]
    TooFewSamples { found: usize, required: usize },
    #[error("required channel missing or empty: {0}")]
    MissingChannel(&'static str),
}

// ============================================================================
// Configuration
// ============================================================================

/// Pipeline tuning parameters.
///
/// # Defaults
///
/// | Parameter | Default | Meaning |
/// |-----------|---------|---------|
/// | `filter_window_seconds` | 1.5 | GPS smoothing window span |
/// | `heading_median_window` | 5 | Rolling median width for heading |
/// | `speed_floor_kmh` | 5.0 | Below this, samples are stationary |
/// | `friction_coeff` | 1.1 | Tire-track friction for optimal speed |
/// | `optimal_speed_min_kmh` | 30.0 | Plausible optimal-speed band, low |
/// | `optimal_speed_max_kmh` | 150.0 | Plausible optimal-speed band, high |
/// | `pit_exit_speed_kmh` | 25.0 | Racing-speed threshold for lap logic |
/// | `pit_exit_run_samples` | 10 | Sustained samples above the threshold |
/// | `min_lap_distance_m` | 300.0 | Shortest credible lap |
/// | `near_line_radius_m` | 20.0 | Finish-line crossing radius |
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub filter_window_seconds: f64,
    pub heading_median_window: usize,
    pub speed_floor_kmh: f64,
    pub friction_coeff: f64,
    pub optimal_speed_min_kmh: f64,
    pub optimal_speed_max_kmh: f64,
    pub pit_exit_speed_kmh: f64,
    pub pit_exit_run_samples: usize,
    pub min_lap_distance_m: f64,
    pub near_line_radius_m: f64,
    /// Corner detection tuning, see [`CornerConfig`].
    pub corner: CornerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            filter_window_seconds: 1.5,
            heading_median_window: 5,
            speed_floor_kmh: 5.0,
            friction_coeff: 1.1,
            optimal_speed_min_kmh: 30.0,
            optimal_speed_max_kmh: 150.0,
            pit_exit_speed_kmh: 25.0,
            pit_exit_run_samples: 10,
            min_lap_distance_m: 300.0,
            near_line_radius_m: 20.0,
            corner: CornerConfig::default(),
        }
    }
}

// ============================================================================
// Pipeline Entry Point
// ============================================================================

/// Run the full analysis pipeline over one session.
///
/// Stages run in order: GPS conditioning, geometry, lap segmentation
/// (`beacons` are authoritative when non-empty), corner detection, and
/// optimal-speed estimation. The samples are enriched in place; everything
/// else lands in the returned [`AnalysisContext`].
///
/// Fails only on fatal input problems (see [`InputError`]); every later
/// stage degrades with a warning instead.
pub fn analyze_session(
    samples: &mut [TelemetrySample],
    beacons: &[f64],
    config: &PipelineConfig,
) -> Result<AnalysisContext, InputError> {
    let started = Instant::now();
    info!(
        "[Pipeline] analyzing {} samples, {} beacon markers",
        samples.len(),
        beacons.len()
    );

    let stage = Instant::now();
    let filtering = smooth_gps(samples, config)?;
    info!("[Pipeline] conditioning done in {:?}", stage.elapsed());

    let stage = Instant::now();
    compute_geometry(samples, config)?;
    info!("[Pipeline] geometry done in {:?}", stage.elapsed());

    let stage = Instant::now();
    let laps = assign_laps(samples, beacons, config);
    info!("[Pipeline] lap segmentation done in {:?}", stage.elapsed());

    let stage = Instant::now();
    let mut corners_summary = detect_corners(samples, &laps, &config.corner);
    info!("[Pipeline] corner detection done in {:?}", stage.elapsed());

    estimate_optimal_speeds(samples, &mut corners_summary.corners, config);

    info!(
        "[Pipeline] session analyzed in {:?}: {} laps, {} corners",
        started.elapsed(),
        laps.lap_count,
        corners_summary.total_corners
    );
    Ok(AnalysisContext {
        filtering,
        laps,
        corners: corners_summary,
    })
}
