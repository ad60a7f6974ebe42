//! The ten detector units.
//!
//! Each module exposes an `apply` function that computes findings over the
//! relevant tables and propagates them onto the label columns through
//! [`crate::fusion`]. Detectors are independent; the pipeline runs them in
//! label-column order and MAX-fusion makes the order irrelevant.

pub mod concentration;
pub mod ctit;
pub mod fan_graph;
pub mod multi_participation;
pub mod night;
pub mod overclick;
pub mod price_volume;
pub mod rejoin;
pub mod spike;
pub mod temporal;

use chrono::{Datelike, NaiveDate};

/// Day key used in scope enums: days since the common era.
pub(crate) fn day_key(date: NaiveDate) -> i32 {
    date.num_days_from_ce()
}

/// Median of an unsorted slice. Empty input yields `None`.
pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Population standard deviation (ddof = 0).
pub(crate) fn std_pop(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    Some(var.sqrt())
}

/// Linear-interpolation quantile over an unsorted slice, q in [0, 1].
pub(crate) fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        Some(sorted[lo])
    } else {
        let frac = pos - lo as f64;
        Some(sorted[lo] * (1.0 - frac) + sorted[hi] * frac)
    }
}

/// Trailing rolling median and population std over a series, window inclusive
/// of the current point. Entries with fewer than `min_samples` points in the
/// window carry no baseline.
pub(crate) fn rolling_stats(
    values: &[f64],
    window: usize,
    min_samples: usize,
) -> Vec<Option<(f64, f64)>> {
    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let start = (i + 1).saturating_sub(window);
        let slice = &values[start..=i];
        if slice.len() < min_samples {
            out.push(None);
        } else {
            out.push(Some((
                median(slice).unwrap_or(0.0),
                std_pop(slice).unwrap_or(0.0),
            )));
        }
    }
    out
}
