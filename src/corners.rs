//! # Corner Detection
//!
//! Finds the physical corners of the circuit from per-sample geometry and
//! confirms them across laps.
//!
//! Detection runs in stages:
//!
//! 1. lap-boundary isolation (zero curvature/lateral-g near lap transitions)
//! 2. adaptive resampling to a workable arc-length spacing
//! 3. multi-criteria voting (curvature, lateral-g, local speed dip)
//! 4. run merging and minimum-length filtering
//! 5. apex selection per run
//! 6. optional merge-gap bisection to a known corner count
//! 7. cross-lap clustering of apex positions (rstar R-tree)
//! 8. stable renumbering by median relative entry index
//!
//! Detection is best-effort: every internal failure degrades to an empty
//! corner list with a warning, never an aborted session.

use std::collections::BTreeMap;

use log::{info, warn};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::geo_utils::{haversine_distance, meters_to_degrees};
use crate::laps::LapSummary;
use crate::{Corner, CornerLapData, CornerType, CornersSummary, TelemetrySample};

/// Tuning knobs for corner detection.
///
/// The defaults are calibrated for karting-class telemetry at 10-20 Hz and
/// are deliberately permissive at the voting stage; cross-lap confirmation
/// is what keeps phantom corners out of the final list.
#[derive(Debug, Clone)]
pub struct CornerConfig {
    /// Lateral-g magnitude above which a point votes "in corner" (g).
    pub min_lateral_g: f64,
    /// Samples zeroed on each side of a lap transition.
    pub boundary_isolation_samples: usize,
    /// Mean spacing below this (m) triggers downsampling.
    pub dense_spacing_m: f64,
    /// Mean spacing above this (m) triggers upsampling to a fixed grid.
    pub sparse_spacing_m: f64,
    /// Grid spacing used when upsampling sparse input (m).
    pub sparse_grid_m: f64,
    /// Points in the before/after windows of the speed-dip test.
    pub speed_dip_window: usize,
    /// Speed sag (km/h) below the window means required for a dip vote.
    pub speed_dip_kmh: f64,
    /// Runs separated by at most this arc length (m) are merged.
    pub merge_gap_m: f64,
    /// Minimum resampled points for a run to survive.
    pub min_run_points: usize,
    /// Minimum arc length of a corner (m).
    pub min_corner_distance_m: f64,
    /// Minimum duration of a corner (s).
    pub min_corner_duration_s: f64,
    /// Apexes within this distance across laps are the same corner (m).
    pub coherence_radius_m: f64,
    /// Known corner count from circuit metadata, when available.
    pub expected_corner_count: Option<usize>,
}

impl Default for CornerConfig {
    fn default() -> Self {
        CornerConfig {
            min_lateral_g: 0.25,
            boundary_isolation_samples: 8,
            dense_spacing_m: 0.5,
            sparse_spacing_m: 3.0,
            sparse_grid_m: 2.0,
            speed_dip_window: 5,
            speed_dip_kmh: 2.0,
            merge_gap_m: 8.0,
            min_run_points: 4,
            min_corner_distance_m: 5.0,
            min_corner_duration_s: 0.3,
            coherence_radius_m: 30.0,
            expected_corner_count: None,
        }
    }
}

/// One corner traversal on one lap, before cross-lap clustering.
#[derive(Debug, Clone)]
struct CornerInstance {
    lap: usize,
    entry_index: usize,
    apex_index: usize,
    exit_index: usize,
    corner_type: CornerType,
    apex_lat: f64,
    apex_lon: f64,
    entry_speed: f64,
    apex_speed: f64,
    exit_speed: f64,
    max_lateral_g: f64,
}

/// A run of in-corner points in the resampled domain, `[start, end]`
/// inclusive.
#[derive(Debug, Clone, Copy)]
struct Run {
    start: usize,
    end: usize,
}

struct IndexedApex {
    instance: usize,
    point: [f64; 2],
}

impl RTreeObject for IndexedApex {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl PointDistance for IndexedApex {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.point[0] - point[0];
        let dy = self.point[1] - point[1];
        dx * dx + dy * dy
    }
}

/// Detect and confirm corners, writing `is_corner`, `corner_id`,
/// `corner_type` and `is_apex` back onto the samples.
///
/// Never fails: anything that prevents detection logs a warning and yields
/// an empty summary. Running twice on the same input produces identical
/// output; sample corner columns are reset on entry.
pub fn detect_corners(
    samples: &mut [TelemetrySample],
    laps: &LapSummary,
    config: &CornerConfig,
) -> CornersSummary {
    for s in samples.iter_mut() {
        s.is_corner = false;
        s.corner_id = 0;
        s.corner_type = CornerType::Straight;
        s.is_apex = false;
    }

    let corners = match detect_inner(samples, laps, config) {
        Some(corners) => corners,
        None => Vec::new(),
    };

    for corner in &corners {
        for lap_data in &corner.per_lap_data {
            for s in samples[lap_data.entry_index..=lap_data.exit_index].iter_mut() {
                s.is_corner = true;
                s.corner_id = corner.id;
                s.corner_type = corner.corner_type;
            }
            samples[lap_data.apex_index].is_apex = true;
        }
    }

    let total_distance_m = samples.last().map_or(0.0, |s| s.cumulative_distance);
    let racing: Vec<&TelemetrySample> = samples.iter().filter(|s| s.lap_number >= 1).collect();
    let avg_speed_kmh = if racing.is_empty() {
        0.0
    } else {
        racing.iter().map(|s| s.speed).sum::<f64>() / racing.len() as f64
    };
    let max_lateral_g = samples
        .iter()
        .map(|s| s.lateral_g.abs())
        .fold(0.0, f64::max);

    info!(
        "[Corners] {} corners confirmed over {} laps",
        corners.len(),
        laps.lap_count
    );
    CornersSummary {
        total_corners: corners.len(),
        total_distance_m,
        avg_speed_kmh,
        max_lateral_g,
        corners,
    }
}

fn detect_inner(
    samples: &[TelemetrySample],
    laps: &LapSummary,
    config: &CornerConfig,
) -> Option<Vec<Corner>> {
    let n = samples.len();

    // Working copies: racing laps only, with lap transitions blanked so the
    // end-of-lap discontinuity cannot masquerade as a corner
    let mut curvature: Vec<f64> = samples.iter().map(|s| s.curvature).collect();
    let mut lateral_g: Vec<f64> = samples.iter().map(|s| s.lateral_g).collect();
    for i in 0..n {
        if samples[i].lap_number == 0 {
            curvature[i] = 0.0;
            lateral_g[i] = 0.0;
        }
    }
    let iso = config.boundary_isolation_samples;
    for i in 1..n {
        if samples[i].lap_number != samples[i - 1].lap_number {
            let lo = i.saturating_sub(iso);
            let hi = (i + iso).min(n - 1);
            for j in lo..=hi {
                curvature[j] = 0.0;
                lateral_g[j] = 0.0;
            }
        }
    }

    let active: Vec<usize> = (0..n).filter(|&i| samples[i].lap_number >= 1).collect();
    if active.len() < config.min_run_points {
        warn!("[Corners] {} racing samples, too few to detect on", active.len());
        return None;
    }

    // Adaptive resampling; `resampled[k]` is an original sample index
    let span = samples[*active.last()?].cumulative_distance
        - samples[active[0]].cumulative_distance;
    if span <= 0.0 {
        warn!("[Corners] zero arc length over racing laps");
        return None;
    }
    let mean_spacing = span / (active.len() - 1) as f64;
    let resampled = resample(samples, &active, mean_spacing, config);
    if resampled.len() < config.min_run_points {
        warn!("[Corners] resampling left {} points", resampled.len());
        return None;
    }
    let pos: Vec<f64> = resampled
        .iter()
        .map(|&i| samples[i].cumulative_distance)
        .collect();

    // Multi-criteria voting
    let in_corner = vote(samples, &curvature, &lateral_g, &resampled, config);

    // Run extraction, gap merging, minimum-length filters
    let runs = extract_runs(&in_corner);
    let runs = merge_runs(&runs, config.merge_gap_m, &pos);
    let mut runs: Vec<Run> = runs
        .into_iter()
        .filter(|r| run_survives(r, samples, &resampled, &pos, config))
        .collect();

    if let Some(target) = config.expected_corner_count {
        runs = collapse_to_target(runs, target, laps, samples, &resampled, &pos);
    }

    let instances: Vec<CornerInstance> = runs
        .iter()
        .filter_map(|r| build_instance(r, samples, &curvature, &lateral_g, &resampled))
        .collect();
    if instances.is_empty() {
        info!("[Corners] no corner candidates after filtering");
        return Some(Vec::new());
    }

    let clusters = cluster_across_laps(&instances, config.coherence_radius_m);

    // Confirmation: at least half the racing laps, boundary rounded up
    let required = ((laps.lap_count + 1) / 2).max(1);
    let mut corners: Vec<Corner> = clusters
        .into_iter()
        .filter_map(|members| {
            build_corner(&members, &instances, laps, config.coherence_radius_m, required)
        })
        .collect();

    // Stable numbering: circuit-chronological order by median relative entry
    // index, robust to laps with unequal point counts
    corners.sort_by(|a, b| {
        median_relative_entry(a, laps)
            .partial_cmp(&median_relative_entry(b, laps))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    for (k, corner) in corners.iter_mut().enumerate() {
        corner.id = k + 1;
    }

    Some(corners)
}

/// Select a resampled index series at a workable arc-length spacing.
///
/// Dense input is thinned to 4x its native spacing; sparse input is expanded
/// onto a fixed grid by nearest-original-sample lookup (never interpolation,
/// which would invent corner shape). Mid-density input passes through.
fn resample(
    samples: &[TelemetrySample],
    active: &[usize],
    mean_spacing: f64,
    config: &CornerConfig,
) -> Vec<usize> {
    let target = if mean_spacing < config.dense_spacing_m {
        mean_spacing * 4.0
    } else if mean_spacing > config.sparse_spacing_m {
        config.sparse_grid_m
    } else {
        return active.to_vec();
    };

    info!(
        "[Corners] resampling from {:.2} m to {:.2} m spacing",
        mean_spacing, target
    );

    let first = samples[active[0]].cumulative_distance;
    let last = samples[*active.last().unwrap_or(&active[0])].cumulative_distance;
    let mut out = Vec::new();
    let mut j = 0usize;
    let steps = ((last - first) / target).floor() as usize;
    for k in 0..=steps {
        let grid = first + k as f64 * target;
        while j + 1 < active.len() {
            let here = (samples[active[j]].cumulative_distance - grid).abs();
            let next = (samples[active[j + 1]].cumulative_distance - grid).abs();
            if next <= here {
                j += 1;
            } else {
                break;
            }
        }
        out.push(active[j]);
    }
    out
}

/// Two-of-three voting per resampled point: curvature magnitude, lateral-g
/// magnitude, and a local speed-dip test that catches braking zones before
/// curvature has built up.
fn vote(
    samples: &[TelemetrySample],
    curvature: &[f64],
    lateral_g: &[f64],
    resampled: &[usize],
    config: &CornerConfig,
) -> Vec<bool> {
    let m = resampled.len();
    let kappa: Vec<f64> = resampled.iter().map(|&i| curvature[i].abs()).collect();
    let g: Vec<f64> = resampled.iter().map(|&i| lateral_g[i].abs()).collect();
    let speed: Vec<f64> = resampled.iter().map(|&i| samples[i].speed).collect();

    let nonzero: Vec<f64> = kappa.iter().copied().filter(|&k| k > 0.0).collect();
    let kappa_threshold = percentile(&nonzero, 0.25);

    let w = config.speed_dip_window;
    let mut out = Vec::with_capacity(m);
    for i in 0..m {
        let mut votes = 0u8;
        if let Some(t) = kappa_threshold {
            if kappa[i] > t {
                votes += 1;
            }
        }
        if g[i] > config.min_lateral_g {
            votes += 1;
        }
        if i >= w && i + w < m {
            let before: f64 = speed[i - w..i].iter().sum::<f64>() / w as f64;
            let after: f64 = speed[i + 1..=i + w].iter().sum::<f64>() / w as f64;
            if before.max(after) - speed[i] > config.speed_dip_kmh {
                votes += 1;
            }
        }
        out.push(votes >= 2);
    }
    out
}

fn extract_runs(in_corner: &[bool]) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut start = None;
    for (i, &flag) in in_corner.iter().enumerate() {
        match (flag, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push(Run { start: s, end: i - 1 });
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push(Run {
            start: s,
            end: in_corner.len() - 1,
        });
    }
    runs
}

/// Merge runs whose arc-length gap is at most `gap_m`. Bridges brief sensor
/// dropout inside one physical corner.
fn merge_runs(runs: &[Run], gap_m: f64, pos: &[f64]) -> Vec<Run> {
    let mut out: Vec<Run> = Vec::with_capacity(runs.len());
    for &run in runs {
        match out.last_mut() {
            Some(prev) if pos[run.start] - pos[prev.end] <= gap_m => prev.end = run.end,
            _ => out.push(run),
        }
    }
    out
}

fn run_survives(
    run: &Run,
    samples: &[TelemetrySample],
    resampled: &[usize],
    pos: &[f64],
    config: &CornerConfig,
) -> bool {
    if run.end - run.start + 1 < config.min_run_points {
        return false;
    }
    if pos[run.end] - pos[run.start] < config.min_corner_distance_m {
        return false;
    }
    let duration = samples[resampled[run.end]].time - samples[resampled[run.start]].time;
    duration >= config.min_corner_duration_s
}

/// When circuit metadata states the corner count, bisect the merge gap in
/// [3, 40] m per lap until over-segmented chicanes collapse to it. Laps
/// already at or below the target are left alone.
fn collapse_to_target(
    runs: Vec<Run>,
    target: usize,
    laps: &LapSummary,
    samples: &[TelemetrySample],
    resampled: &[usize],
    pos: &[f64],
) -> Vec<Run> {
    let mut out = Vec::with_capacity(runs.len());
    for lap in 1..=laps.lap_count {
        let lap_runs: Vec<Run> = runs
            .iter()
            .copied()
            .filter(|r| samples[resampled[r.start]].lap_number == lap)
            .collect();
        if lap_runs.len() <= target {
            out.extend(lap_runs);
            continue;
        }

        let (mut lo, mut hi) = (3.0_f64, 40.0_f64);
        let mut best = lap_runs.clone();
        for _ in 0..24 {
            let mid = 0.5 * (lo + hi);
            let merged = merge_runs(&lap_runs, mid, pos);
            match merged.len().cmp(&target) {
                std::cmp::Ordering::Greater => lo = mid,
                std::cmp::Ordering::Less => hi = mid,
                std::cmp::Ordering::Equal => {
                    best = merged;
                    // Keep shrinking toward the minimum gap that works
                    hi = mid;
                }
            }
        }
        if best.len() != target {
            warn!(
                "[Corners] lap {lap}: could not collapse {} runs to {target}",
                lap_runs.len()
            );
        }
        out.extend(best);
    }
    out
}

/// Map a surviving run back to the raw timeline and measure it there. The
/// apex is the raw sample of maximum lateral-g magnitude inside the run.
fn build_instance(
    run: &Run,
    samples: &[TelemetrySample],
    curvature: &[f64],
    lateral_g: &[f64],
    resampled: &[usize],
) -> Option<CornerInstance> {
    let entry = resampled[run.start];
    let exit = resampled[run.end];
    if exit <= entry {
        return None;
    }

    let apex = (entry..=exit)
        .max_by(|&a, &b| {
            lateral_g[a]
                .abs()
                .partial_cmp(&lateral_g[b].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
    let apex_lat = samples[apex].latitude_smooth;
    let apex_lon = samples[apex].longitude_smooth;
    if !apex_lat.is_finite() || !apex_lon.is_finite() {
        warn!("[Corners] apex GPS lookup failed for run at sample {entry}, skipping");
        return None;
    }

    let mean_curvature: f64 =
        (entry..=exit).map(|i| curvature[i]).sum::<f64>() / (exit - entry + 1) as f64;
    let corner_type = if mean_curvature >= 0.0 {
        CornerType::Left
    } else {
        CornerType::Right
    };

    Some(CornerInstance {
        lap: samples[apex].lap_number,
        entry_index: entry,
        apex_index: apex,
        exit_index: exit,
        corner_type,
        apex_lat,
        apex_lon,
        entry_speed: samples[entry].speed,
        apex_speed: samples[apex].speed,
        exit_speed: samples[exit].speed,
        max_lateral_g: (entry..=exit).map(|i| lateral_g[i].abs()).fold(0.0, f64::max),
    })
}

/// Greedy clustering of apex positions: each unassigned instance seeds a
/// cluster of every other unassigned instance within the coherence radius.
///
/// The R-tree query uses a square degree envelope sized from the longitude
/// scale, which over-reaches in the latitude direction at high latitudes;
/// candidates are re-checked with the true great-circle distance.
fn cluster_across_laps(instances: &[CornerInstance], radius_m: f64) -> Vec<Vec<usize>> {
    let tree = RTree::bulk_load(
        instances
            .iter()
            .enumerate()
            .map(|(i, inst)| IndexedApex {
                instance: i,
                point: [inst.apex_lon, inst.apex_lat],
            })
            .collect(),
    );

    let mut assigned = vec![false; instances.len()];
    let mut clusters = Vec::new();
    for seed in 0..instances.len() {
        if assigned[seed] {
            continue;
        }
        let threshold_deg = meters_to_degrees(radius_m, instances[seed].apex_lat);
        let mut members: Vec<usize> = tree
            .locate_within_distance(
                [instances[seed].apex_lon, instances[seed].apex_lat],
                threshold_deg * threshold_deg,
            )
            .map(|p| p.instance)
            .filter(|&i| !assigned[i])
            .filter(|&i| {
                haversine_distance(
                    instances[i].apex_lat,
                    instances[i].apex_lon,
                    instances[seed].apex_lat,
                    instances[seed].apex_lon,
                ) <= radius_m
            })
            .collect();
        members.sort_unstable();
        for &m in &members {
            assigned[m] = true;
        }
        clusters.push(members);
    }
    clusters
}

fn build_corner(
    members: &[usize],
    instances: &[CornerInstance],
    laps: &LapSummary,
    radius_m: f64,
    required_laps: usize,
) -> Option<Corner> {
    // One traversal per lap: a lap that double-detects inside the coherence
    // radius contributes only its strongest instance
    let mut best_per_lap: BTreeMap<usize, usize> = BTreeMap::new();
    for &m in members {
        let slot = best_per_lap.entry(instances[m].lap).or_insert(m);
        if instances[m].max_lateral_g > instances[*slot].max_lateral_g {
            *slot = m;
        }
    }
    if best_per_lap.len() < required_laps {
        return None;
    }
    let confirmed_in_laps = best_per_lap.len();
    let members: Vec<usize> = best_per_lap.into_values().collect();

    let count = members.len() as f64;
    let centroid_lat = members.iter().map(|&m| instances[m].apex_lat).sum::<f64>() / count;
    let centroid_lon = members.iter().map(|&m| instances[m].apex_lon).sum::<f64>() / count;
    let mean_spread = members
        .iter()
        .map(|&m| {
            haversine_distance(
                instances[m].apex_lat,
                instances[m].apex_lon,
                centroid_lat,
                centroid_lon,
            )
        })
        .sum::<f64>()
        / count;
    let consistency_score = (1.0 - mean_spread / radius_m).max(0.0);

    // Majority vote on direction across traversals
    let lefts = members
        .iter()
        .filter(|&&m| instances[m].corner_type == CornerType::Left)
        .count();
    let corner_type = if lefts * 2 >= members.len() {
        CornerType::Left
    } else {
        CornerType::Right
    };

    // Representative indices come from the member with the median relative
    // entry position within its lap
    let mut by_entry: Vec<usize> = members.to_vec();
    by_entry.sort_by_key(|&m| relative_entry(&instances[m], laps));
    let representative = &instances[by_entry[by_entry.len() / 2]];

    let mut per_lap_data: Vec<CornerLapData> = members
        .iter()
        .map(|&m| {
            let inst = &instances[m];
            CornerLapData {
                lap: inst.lap,
                entry_index: inst.entry_index,
                apex_index: inst.apex_index,
                exit_index: inst.exit_index,
                entry_speed: inst.entry_speed,
                apex_speed: inst.apex_speed,
                exit_speed: inst.exit_speed,
                max_lateral_g: inst.max_lateral_g,
            }
        })
        .collect();
    per_lap_data.sort_by_key(|d| (d.lap, d.entry_index));

    Some(Corner {
        id: 0, // assigned by the final renumbering pass
        corner_type,
        entry_index: representative.entry_index,
        apex_index: representative.apex_index,
        exit_index: representative.exit_index,
        confirmed_in_laps,
        consistency_score,
        apex_lat: centroid_lat,
        apex_lon: centroid_lon,
        apex_speed_optimal: f64::NAN,
        speed_efficiency: f64::NAN,
        per_lap_data,
    })
}

fn relative_entry(instance: &CornerInstance, laps: &LapSummary) -> usize {
    let lap_start = laps
        .lap_start_indices
        .get(instance.lap.saturating_sub(1))
        .copied()
        .unwrap_or(0);
    instance.entry_index.saturating_sub(lap_start)
}

/// Median entry index relative to each lap's start, the ordering key that
/// stays stable when laps carry different point counts.
fn median_relative_entry(corner: &Corner, laps: &LapSummary) -> f64 {
    let mut rel: Vec<usize> = corner
        .per_lap_data
        .iter()
        .map(|d| {
            let lap_start = laps
                .lap_start_indices
                .get(d.lap.saturating_sub(1))
                .copied()
                .unwrap_or(0);
            d.entry_index.saturating_sub(lap_start)
        })
        .collect();
    rel.sort_unstable();
    if rel.is_empty() {
        return 0.0;
    }
    let mid = rel.len() / 2;
    if rel.len() % 2 == 0 {
        (rel[mid - 1] + rel[mid]) as f64 / 2.0
    } else {
        rel[mid] as f64
    }
}

/// Nearest-rank percentile of `values` (`q` in 0..1). `None` when empty.
fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((sorted.len() - 1) as f64 * q).round() as usize;
    Some(sorted[rank])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PipelineConfig;

    fn flat_samples(n: usize) -> Vec<TelemetrySample> {
        (0..n)
            .map(|i| {
                let mut s = TelemetrySample::new(45.0, 7.0 + i as f64 * 1e-5, 60.0, i as f64 * 0.1);
                s.latitude_smooth = s.latitude;
                s.longitude_smooth = s.longitude;
                s.cumulative_distance = i as f64 * 0.8;
                s.lap_number = 1;
                s
            })
            .collect()
    }

    /// Build a synthetic multi-lap session with a single left corner injected
    /// into `laps_with_corner` of `n_laps` laps. Geometry columns are set
    /// directly; the detector only reads them.
    fn session_with_corner(n_laps: usize, laps_with_corner: usize) -> (Vec<TelemetrySample>, LapSummary) {
        let per_lap = 200usize;
        let mut samples = Vec::with_capacity(n_laps * per_lap);
        let mut starts = Vec::new();
        for lap in 1..=n_laps {
            starts.push(samples.len());
            for i in 0..per_lap {
                let k = samples.len();
                let mut s =
                    TelemetrySample::new(45.0, 7.0 + i as f64 * 2e-5, 60.0, k as f64 * 0.1);
                s.latitude_smooth = s.latitude;
                s.longitude_smooth = s.longitude;
                s.cumulative_distance = k as f64 * 1.6;
                s.lap_number = lap;
                // Corner between samples 80 and 120 of the lap, parabolic
                // intensity profile peaking at sample 100
                if lap <= laps_with_corner && (80..120).contains(&i) {
                    let depth = (1.0 - ((i as f64 - 100.0) / 20.0).powi(2)).max(0.0);
                    s.curvature = 0.03 + 0.05 * depth;
                    s.lateral_g = 1.2 * depth.max(0.1);
                    s.speed = 60.0 - 20.0 * depth;
                    // Apex GPS pinned so clustering sees one tight group
                    s.latitude_smooth = 45.001;
                    s.longitude_smooth = 7.001 + (i as f64 - 100.0) * 1e-6;
                }
                samples.push(s);
            }
        }
        let summary = LapSummary {
            lap_count: n_laps,
            source: crate::laps::LapSource::Beacons,
            lap_start_indices: starts,
        };
        (samples, summary)
    }

    #[test]
    fn test_straight_session_has_no_corners() {
        let mut samples = flat_samples(300);
        let laps = LapSummary {
            lap_count: 1,
            source: crate::laps::LapSource::SingleLap,
            lap_start_indices: vec![0],
        };
        let summary = detect_corners(&mut samples, &laps, &CornerConfig::default());
        assert_eq!(summary.total_corners, 0);
        assert!(samples.iter().all(|s| !s.is_corner));
    }

    #[test]
    fn test_corner_in_every_lap_is_confirmed() {
        let (mut samples, laps) = session_with_corner(3, 3);
        let summary = detect_corners(&mut samples, &laps, &CornerConfig::default());

        assert_eq!(summary.total_corners, 1);
        let corner = &summary.corners[0];
        assert_eq!(corner.id, 1);
        assert_eq!(corner.corner_type, CornerType::Left);
        assert_eq!(corner.confirmed_in_laps, 3);
        assert_eq!(corner.per_lap_data.len(), 3);
        assert!(corner.consistency_score > 0.9);
        assert!(samples[corner.apex_index].is_apex);
        assert!(samples.iter().any(|s| s.corner_id == 1));

        // Mid-density input passes through the resampler untouched, so the
        // apex must be the plain argmax of |lateral_g|: sample 100 of its lap
        assert_eq!(corner.apex_index % 200, 100);
    }

    #[test]
    fn test_confirmation_boundary_even_laps() {
        // 4 laps: ceil(4/2) = 2 required
        let (mut samples, laps) = session_with_corner(4, 1);
        let summary = detect_corners(&mut samples, &laps, &CornerConfig::default());
        assert_eq!(summary.total_corners, 0);

        let (mut samples, laps) = session_with_corner(4, 2);
        let summary = detect_corners(&mut samples, &laps, &CornerConfig::default());
        assert_eq!(summary.total_corners, 1);
    }

    #[test]
    fn test_confirmation_boundary_odd_laps() {
        // 5 laps: ceil(5/2) = 3 required
        let (mut samples, laps) = session_with_corner(5, 2);
        let summary = detect_corners(&mut samples, &laps, &CornerConfig::default());
        assert_eq!(summary.total_corners, 0);

        let (mut samples, laps) = session_with_corner(5, 3);
        let summary = detect_corners(&mut samples, &laps, &CornerConfig::default());
        assert_eq!(summary.total_corners, 1);
    }

    #[test]
    fn test_detection_is_idempotent() {
        let (mut first, laps) = session_with_corner(3, 3);
        let mut second = first.clone();
        let a = detect_corners(&mut first, &laps, &CornerConfig::default());
        detect_corners(&mut second, &laps, &CornerConfig::default());
        let b = detect_corners(&mut second, &laps, &CornerConfig::default());

        assert_eq!(a.total_corners, b.total_corners);
        for (ca, cb) in a.corners.iter().zip(&b.corners) {
            assert_eq!(ca.id, cb.id);
            assert_eq!(ca.apex_index, cb.apex_index);
            assert_eq!(ca.per_lap_data.len(), cb.per_lap_data.len());
        }
        for (sa, sb) in first.iter().zip(&second) {
            assert_eq!(sa.corner_id, sb.corner_id);
            assert_eq!(sa.is_apex, sb.is_apex);
        }
    }

    #[test]
    fn test_out_lap_is_excluded() {
        let (mut samples, mut laps) = session_with_corner(3, 3);
        // Relabel the first lap as the out-lap
        for s in samples.iter_mut() {
            s.lap_number = s.lap_number.saturating_sub(1);
        }
        laps.lap_count = 2;
        laps.lap_start_indices.remove(0);

        let summary = detect_corners(&mut samples, &laps, &CornerConfig::default());
        assert_eq!(summary.total_corners, 1);
        assert!(samples[..200].iter().all(|s| s.corner_id == 0));
    }

    #[test]
    fn test_merge_runs_bridges_small_gaps() {
        let pos: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let runs = vec![
            Run { start: 10, end: 20 },
            Run { start: 25, end: 30 }, // 5 m gap, merged
            Run { start: 60, end: 70 }, // 30 m gap, kept separate
        ];
        let merged = merge_runs(&runs, 8.0, &pos);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].start, 10);
        assert_eq!(merged[0].end, 30);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&values, 0.25), Some(2.0));
        assert_eq!(percentile(&values, 0.5), Some(3.0));
        assert_eq!(percentile(&[], 0.25), None);
    }

    #[test]
    fn test_mid_density_input_passes_through() {
        // 1.6 m spacing is mid-density; resample must return the input
        let samples = flat_samples(100);
        let active: Vec<usize> = (0..100).collect();
        let out = resample(&samples, &active, 1.6, &CornerConfig::default());
        assert_eq!(out, active);
    }

    #[test]
    fn test_dense_input_is_downsampled() {
        let mut samples = flat_samples(400);
        for (i, s) in samples.iter_mut().enumerate() {
            s.cumulative_distance = i as f64 * 0.2;
        }
        let active: Vec<usize> = (0..400).collect();
        let out = resample(&samples, &active, 0.2, &CornerConfig::default());
        // 4x the native spacing: roughly every 4th point
        assert!(out.len() < 150 && out.len() > 80, "got {}", out.len());
    }

    #[test]
    fn test_pipeline_config_carries_corner_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.corner.min_run_points, 4);
    }

    /// Single lap with two narrow left-hand kinks 35 m apart, far enough for
    /// separate runs and separate clusters, close enough for the merge-gap
    /// bisection to collapse them.
    fn chicane_session() -> (Vec<TelemetrySample>, LapSummary) {
        let m_per_deg_lon = 111_320.0 * 45.0_f64.to_radians().cos();
        let samples = (0..400)
            .map(|i| {
                let mut s = TelemetrySample::new(
                    45.0,
                    7.0 + i as f64 * 1.6 / m_per_deg_lon,
                    60.0,
                    i as f64 * 0.1,
                );
                s.latitude_smooth = s.latitude;
                s.longitude_smooth = s.longitude;
                s.cumulative_distance = i as f64 * 1.6;
                s.lap_number = 1;
                for center in [100.0, 122.0] {
                    let depth = 1.0 - ((i as f64 - center) / 8.0).powi(2);
                    if depth > 0.0 {
                        s.curvature = 0.03 + 0.05 * depth;
                        s.lateral_g = 1.2 * depth.max(0.1);
                        s.speed = 60.0 - 20.0 * depth;
                    }
                }
                s
            })
            .collect();
        let laps = LapSummary {
            lap_count: 1,
            source: crate::laps::LapSource::SingleLap,
            lap_start_indices: vec![0],
        };
        (samples, laps)
    }

    #[test]
    fn test_expected_count_collapses_over_segmented_chicane() {
        // Without circuit metadata the two kinks stay separate corners
        let (mut samples, laps) = chicane_session();
        let summary = detect_corners(&mut samples, &laps, &CornerConfig::default());
        assert_eq!(summary.total_corners, 2, "corners: {:#?}", summary.corners);

        // A known count of 1 drives the merge-gap bisection to fuse them
        let config = CornerConfig {
            expected_corner_count: Some(1),
            ..CornerConfig::default()
        };
        let summary = detect_corners(&mut samples, &laps, &config);
        assert_eq!(summary.total_corners, 1, "corners: {:#?}", summary.corners);
        assert_eq!(summary.corners[0].corner_type, CornerType::Left);
    }

    /// Single lap at 4 m inter-sample spacing with one corner, for the
    /// sparse upsampling path.
    fn sparse_session() -> (Vec<TelemetrySample>, LapSummary) {
        let m_per_deg_lon = 111_320.0 * 45.0_f64.to_radians().cos();
        let samples = (0..200)
            .map(|i| {
                let mut s = TelemetrySample::new(
                    45.0,
                    7.0 + i as f64 * 4.0 / m_per_deg_lon,
                    60.0,
                    i as f64 * 0.1,
                );
                s.latitude_smooth = s.latitude;
                s.longitude_smooth = s.longitude;
                s.cumulative_distance = i as f64 * 4.0;
                s.lap_number = 1;
                let depth = 1.0 - ((i as f64 - 95.0) / 15.0).powi(2);
                if depth > 0.0 {
                    s.curvature = 0.03 + 0.05 * depth;
                    s.lateral_g = 1.2 * depth.max(0.1);
                    s.speed = 60.0 - 20.0 * depth;
                }
                s
            })
            .collect();
        let laps = LapSummary {
            lap_count: 1,
            source: crate::laps::LapSource::SingleLap,
            lap_start_indices: vec![0],
        };
        (samples, laps)
    }

    #[test]
    fn test_sparse_input_is_upsampled_to_grid() {
        // 4 m native spacing lands on the fixed 2 m grid: roughly double the
        // point count, every point a back-reference into the raw timeline
        let (samples, _) = sparse_session();
        let active: Vec<usize> = (0..samples.len()).collect();
        let out = resample(&samples, &active, 4.0, &CornerConfig::default());

        assert!(out.len() > active.len() * 3 / 2, "got {} points", out.len());
        assert!(out.iter().all(|&i| i < samples.len()));
        // Grid walks forward through the originals
        assert!(out.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_sparse_session_still_detects_the_corner() {
        let (mut samples, laps) = sparse_session();
        let summary = detect_corners(&mut samples, &laps, &CornerConfig::default());

        assert_eq!(summary.total_corners, 1, "corners: {:#?}", summary.corners);
        let corner = &summary.corners[0];
        assert_eq!(corner.corner_type, CornerType::Left);
        // Apex maps back to the raw sample of maximum lateral-g
        assert_eq!(corner.apex_index, 95);
    }

    #[test]
    fn test_coherence_radius_is_metric_not_degrees() {
        // Two apexes 36 m apart due north at 45N: the longitude-scaled
        // degree envelope spans ~42 m of latitude, but the true distance
        // exceeds the 30 m radius, so they must stay separate clusters.
        let inst = |lap: usize, lat: f64| CornerInstance {
            lap,
            entry_index: 10,
            apex_index: 20,
            exit_index: 30,
            corner_type: CornerType::Left,
            apex_lat: lat,
            apex_lon: 7.0,
            entry_speed: 60.0,
            apex_speed: 40.0,
            exit_speed: 55.0,
            max_lateral_g: 1.2,
        };
        let instances = vec![inst(1, 45.0), inst(2, 45.0 + 36.0 / 111_320.0)];
        let clusters = cluster_across_laps(&instances, 30.0);
        assert_eq!(clusters.len(), 2);

        // 20 m apart clusters fine
        let instances = vec![inst(1, 45.0), inst(2, 45.0 + 20.0 / 111_320.0)];
        let clusters = cluster_across_laps(&instances, 30.0);
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn test_double_detection_in_one_lap_keeps_strongest() {
        let inst = |lap: usize, entry: usize, g: f64| CornerInstance {
            lap,
            entry_index: entry,
            apex_index: entry + 10,
            exit_index: entry + 20,
            corner_type: CornerType::Left,
            apex_lat: 45.001,
            apex_lon: 7.001,
            entry_speed: 60.0,
            apex_speed: 40.0,
            exit_speed: 55.0,
            max_lateral_g: g,
        };
        // Lap 1 double-detects; only its stronger traversal may survive
        let instances = vec![inst(1, 100, 0.9), inst(1, 110, 1.4), inst(2, 105, 1.2)];
        let laps = LapSummary {
            lap_count: 2,
            source: crate::laps::LapSource::Beacons,
            lap_start_indices: vec![0, 200],
        };

        let corner = build_corner(&[0, 1, 2], &instances, &laps, 30.0, 1).unwrap();
        assert_eq!(corner.confirmed_in_laps, 2);
        assert_eq!(corner.per_lap_data.len(), 2);
        let lap1 = corner.per_lap_data.iter().find(|d| d.lap == 1).unwrap();
        assert_eq!(lap1.entry_index, 110);
        assert!((lap1.max_lateral_g - 1.4).abs() < 1e-12);
    }
}
