//! # GPS Signal Conditioning
//!
//! Smooths raw latitude/longitude with an adaptive-window Savitzky-Golay
//! filter while preserving corner apexes.
//!
//! ## Algorithm
//! 1. Estimate the sampling rate from the median of consecutive time deltas
//! 2. Choose a window spanning ~1.5 s of data, clamped to `[11, n/10]`, odd
//! 3. Fit a local degree-3 polynomial independently to latitude and longitude
//! 4. Handle trajectory boundaries by explicit polynomial fits (no edge
//!    distortion that would flatten the first and last corner)
//! 5. Report a signal-to-noise diagnostic and the mean displacement the
//!    filter introduced
//!
//! The raw coordinates are never overwritten: smoothed values land in the
//! `latitude_smooth`/`longitude_smooth` columns, leaving the raw series
//! available for diagnostics.

use log::{info, warn};
use nalgebra::{DMatrix, DVector};
use serde::Serialize;

use crate::geo_utils::haversine_distance;
use crate::{InputError, PipelineConfig, TelemetrySample};

/// Minimum number of valid GPS fixes required for filtering.
pub const MIN_FILTER_SAMPLES: usize = 10;

/// Qualitative GPS signal classification, derived from the filter SNR.
///
/// Diagnostic only: a `Poor` signal is logged but never blocks the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalQuality {
    /// SNR above 25 dB
    Excellent,
    /// SNR between 15 and 25 dB
    Good,
    /// SNR below 15 dB
    Poor,
}

impl SignalQuality {
    /// Classify a signal-to-noise ratio in decibels.
    pub fn from_snr_db(snr_db: f64) -> Self {
        if snr_db > 25.0 {
            SignalQuality::Excellent
        } else if snr_db >= 15.0 {
            SignalQuality::Good
        } else {
            SignalQuality::Poor
        }
    }
}

/// Diagnostics produced by [`smooth_gps`].
#[derive(Debug, Clone, Serialize)]
pub struct FilterReport {
    /// Window length actually used (samples, odd)
    pub window_length: usize,
    /// Polynomial order actually used
    pub poly_order: usize,
    /// Signal-to-noise ratio in dB, averaged over both axes
    pub snr_db: f64,
    /// Qualitative classification of `snr_db`
    pub quality: SignalQuality,
    /// Mean physical displacement (m) the filter introduced. A sanity check
    /// that smoothing did not silently truncate corners; typically < 1 m.
    pub avg_displacement_m: f64,
}

/// Smooth raw GPS coordinates in place, adding the `latitude_smooth` /
/// `longitude_smooth` columns. Rows with non-finite raw coordinates keep NaN
/// in the smoothed columns.
///
/// Returns [`InputError::TooFewSamples`] when fewer than
/// [`MIN_FILTER_SAMPLES`] valid fixes exist.
pub fn smooth_gps(
    samples: &mut [TelemetrySample],
    config: &PipelineConfig,
) -> Result<FilterReport, InputError> {
    let valid: Vec<usize> = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.latitude.is_finite() && s.longitude.is_finite())
        .map(|(i, _)| i)
        .collect();

    if valid.len() < MIN_FILTER_SAMPLES {
        return Err(InputError::TooFewSamples {
            found: valid.len(),
            required: MIN_FILTER_SAMPLES,
        });
    }

    let lat_clean: Vec<f64> = valid.iter().map(|&i| samples[i].latitude).collect();
    let lon_clean: Vec<f64> = valid.iter().map(|&i| samples[i].longitude).collect();
    let n = lat_clean.len();

    let (window_length, poly_order) = choose_window(samples, n, config);

    let lat_smooth = savgol_smooth(&lat_clean, window_length, poly_order)
        .unwrap_or_else(|| {
            warn!("[Filter] latitude fit failed, passing raw values through");
            lat_clean.clone()
        });
    let lon_smooth = savgol_smooth(&lon_clean, window_length, poly_order)
        .unwrap_or_else(|| {
            warn!("[Filter] longitude fit failed, passing raw values through");
            lon_clean.clone()
        });

    // Reinsert into the full table; invalid rows stay NaN
    for s in samples.iter_mut() {
        s.latitude_smooth = f64::NAN;
        s.longitude_smooth = f64::NAN;
    }
    for (k, &i) in valid.iter().enumerate() {
        samples[i].latitude_smooth = lat_smooth[k];
        samples[i].longitude_smooth = lon_smooth[k];
    }

    let snr_db = (snr_db(&lat_clean, &lat_smooth) + snr_db(&lon_clean, &lon_smooth)) / 2.0;
    let quality = SignalQuality::from_snr_db(snr_db);

    let avg_displacement_m = {
        let sum: f64 = (0..n)
            .map(|k| haversine_distance(lat_clean[k], lon_clean[k], lat_smooth[k], lon_smooth[k]))
            .sum();
        sum / n as f64
    };

    info!(
        "[Filter] window={} order={} snr={:.1}dB ({:?}) displacement={:.2}m over {} fixes",
        window_length, poly_order, snr_db, quality, avg_displacement_m, n
    );

    Ok(FilterReport {
        window_length,
        poly_order,
        snr_db,
        quality,
        avg_displacement_m,
    })
}

/// Pick the filter window from the sampling rate: ~1.5 s of data, clamped to
/// `[11, max(11, n/10)]`, odd, and strictly smaller than the series length.
/// The polynomial order is degraded when the window cannot hold a cubic.
fn choose_window(samples: &[TelemetrySample], n: usize, config: &PipelineConfig) -> (usize, usize) {
    let mut deltas: Vec<f64> = samples
        .windows(2)
        .map(|w| w[1].time - w[0].time)
        .filter(|d| d.is_finite() && *d > 0.0)
        .collect();

    let mut window = if deltas.is_empty() {
        // No usable timestamps: fall back to a fixed mid-size window
        51.min(n / 10).max(11)
    } else {
        deltas.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median_dt = deltas[deltas.len() / 2];
        let sample_rate = 1.0 / median_dt;
        let target = (sample_rate * config.filter_window_seconds) as usize;
        target.clamp(11, (n / 10).max(11))
    };

    if window % 2 == 0 {
        window += 1;
    }
    if window >= n {
        window = if (n - 1) % 2 == 1 { n - 1 } else { n.saturating_sub(2) };
        window = window.max(3);
    }

    let mut order = 3;
    if order >= window {
        order = (window - 1).max(2);
    }
    (window, order)
}

/// Savitzky-Golay smoothing: precomputed central convolution for interior
/// points, explicit polynomial fits over the first/last window for the
/// boundary points (no mirror-padding distortion).
///
/// Returns `None` if a least-squares solve fails, which only happens on a
/// degenerate design matrix.
pub(crate) fn savgol_smooth(values: &[f64], window: usize, order: usize) -> Option<Vec<f64>> {
    let n = values.len();
    if n < window || window < 3 {
        return Some(values.to_vec());
    }

    let half = window / 2;
    let coeffs = central_coefficients(window, order)?;

    let mut out = vec![0.0; n];
    for i in half..n - half {
        let mut acc = 0.0;
        for (j, c) in coeffs.iter().enumerate() {
            acc += c * values[i - half + j];
        }
        out[i] = acc;
    }

    // Head: fit one polynomial to the first window, evaluate in place
    let beta_head = polyfit(&values[..window], order)?;
    for (i, slot) in out.iter_mut().take(half).enumerate() {
        *slot = poly_eval(&beta_head, i as f64);
    }

    // Tail: same over the last window
    let beta_tail = polyfit(&values[n - window..], order)?;
    for i in 0..half {
        let global = n - half + i;
        let local = (global - (n - window)) as f64;
        out[global] = poly_eval(&beta_tail, local);
    }

    Some(out)
}

/// Convolution weights that evaluate the local least-squares polynomial at
/// the window center: `c = A · (AᵀA)⁻¹ e₀` with `A[j][p] = (j - half)^p`.
fn central_coefficients(window: usize, order: usize) -> Option<Vec<f64>> {
    let half = window as i64 / 2;
    let a = DMatrix::from_fn(window, order + 1, |r, c| {
        ((r as i64 - half) as f64).powi(c as i32)
    });
    let ata = a.transpose() * &a;
    let mut e0 = DVector::zeros(order + 1);
    e0[0] = 1.0;
    let b = ata.lu().solve(&e0)?;
    Some((a * b).iter().copied().collect())
}

/// Least-squares polynomial coefficients over `x = 0..values.len()`.
fn polyfit(values: &[f64], order: usize) -> Option<DVector<f64>> {
    let m = values.len();
    let a = DMatrix::from_fn(m, order + 1, |r, c| (r as f64).powi(c as i32));
    let y = DVector::from_row_slice(values);
    let ata = a.transpose() * &a;
    let aty = a.transpose() * y;
    ata.lu().solve(&aty)
}

fn poly_eval(beta: &DVector<f64>, x: f64) -> f64 {
    beta.iter()
        .enumerate()
        .map(|(p, b)| b * x.powi(p as i32))
        .sum()
}

/// Signal-to-noise ratio in dB: `10·log10(var(filtered)/var(raw − filtered))`.
/// Returns 0.0 when either variance vanishes.
fn snr_db(original: &[f64], filtered: &[f64]) -> f64 {
    if original.len() != filtered.len() || original.is_empty() {
        return 0.0;
    }
    let signal_power = variance(filtered);
    let noise: Vec<f64> = original
        .iter()
        .zip(filtered)
        .map(|(o, f)| o - f)
        .collect();
    let noise_power = variance(&noise);

    if noise_power == 0.0 || signal_power == 0.0 {
        return 0.0;
    }
    10.0 * (signal_power / noise_power).log10()
}

fn variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
}
