//! D3: rolling volume spike. Hourly click volume measured against its own
//! trailing window; sudden multiples of the rolling median with a matching
//! z-score are bought traffic, not organic growth.
//!
//! Two sides share the statistic: campaigns over the hourly report and
//! publishers over bucketed click events. The campaign side only trusts the
//! series after a warm-up period past the campaign start and before the
//! campaign end, because launch ramps and last-chance rushes look exactly
//! like spikes.

use std::collections::HashMap;

use chrono::Duration;
use tracing::info;

use crate::config::SpikeConfig;
use crate::detectors::rolling_stats;
use crate::error::EngineError;
use crate::fusion::{apply_labels, merge_max};
use crate::types::{Campaign, DetectorId, EventTable, ReportTable, Severity};

struct SpikePoint {
    bucket: i64,
    severity: Severity,
    mult: f64,
    z: f64,
}

/// Evaluate one hourly series. `points` must be sorted by bucket; ineligible
/// points feed the baseline but never produce findings.
fn scan_series(points: &[(i64, f64, bool)], config: &SpikeConfig) -> Vec<SpikePoint> {
    let values: Vec<f64> = points.iter().map(|p| p.1).collect();
    let stats = rolling_stats(&values, config.window, config.min_samples);

    let mut out = Vec::new();
    for ((bucket, value, eligible), baseline) in points.iter().zip(stats) {
        if !eligible {
            continue;
        }
        let Some((med, std)) = baseline else { continue };
        // The floor keeps thin series from spiking on tiny absolute moves.
        let base = med.max(config.baseline_floor);
        let mult = value / base;
        let z = if std > 0.0 { (value - med) / std } else { 0.0 };

        // Below the floored baseline nothing qualifies, whatever the z says.
        if *value < base {
            continue;
        }
        let hard = mult >= config.mult_threshold && z >= config.z_threshold;
        let soft = mult >= config.mult_threshold - config.soft_margin_mult
            || z >= config.z_threshold - config.soft_margin_z;
        let severity = if hard {
            Severity::Confirmed
        } else if soft {
            Severity::Suspect
        } else {
            continue;
        };
        out.push(SpikePoint {
            bucket: *bucket,
            severity,
            mult,
            z,
        });
    }
    out
}

/// Keep the strongest findings per group and severity tier.
fn top_k(mut points: Vec<SpikePoint>, config: &SpikeConfig) -> Vec<SpikePoint> {
    points.sort_by(|a, b| {
        b.mult
            .partial_cmp(&a.mult)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.z.partial_cmp(&a.z).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.bucket.cmp(&b.bucket))
    });
    let mut confirmed = 0usize;
    let mut suspect = 0usize;
    points.retain(|p| match p.severity {
        Severity::Confirmed => {
            confirmed += 1;
            confirmed <= config.top_confirmed
        }
        Severity::Suspect => {
            suspect += 1;
            suspect <= config.top_suspect
        }
        Severity::Normal => false,
    });
    points
}

pub fn apply(
    config: &SpikeConfig,
    campaigns: &[Campaign],
    events: &mut EventTable,
    reports: &mut ReportTable,
) -> Result<usize, EngineError> {
    let meta: HashMap<i64, &Campaign> =
        campaigns.iter().map(|c| (c.campaign_id, c)).collect();

    // Campaign side: the hourly report is already the series.
    let mut campaign_series: HashMap<i64, Vec<(i64, f64, bool)>> = HashMap::new();
    for r in &reports.rows {
        let Some(c) = meta.get(&r.campaign_id) else { continue };
        if !config.campaign_types.contains(&c.campaign_type) {
            continue;
        }
        // A campaign without a start date has no warm-up boundary; skip it.
        let Some(started) = c.started_at else { continue };
        let Some(bucket) = r.hour_bucket() else { continue };
        let warm = (started + Duration::hours(config.warmup_hours))
            .timestamp()
            .div_euclid(3600);
        // Hours past the campaign end still feed the baseline but never fire.
        let last = c.ended_at.map(|t| t.timestamp().div_euclid(3600));
        let eligible = bucket >= warm && last.map_or(true, |l| bucket <= l);
        campaign_series
            .entry(r.campaign_id)
            .or_default()
            .push((bucket, r.clicks as f64, eligible));
    }

    let mut campaign_map = Vec::new();
    for (campaign_id, mut series) in campaign_series {
        series.sort_by_key(|p| p.0);
        for p in top_k(scan_series(&series, config), config) {
            campaign_map.push(((campaign_id, p.bucket), p.severity));
        }
    }
    let campaign_map = merge_max(campaign_map);

    // Publisher side: bucket raw clicks per hour, no warm-up.
    let mut pub_counts: HashMap<(i64, i64), f64> = HashMap::new();
    for e in &events.rows {
        if let Some(bucket) = e.hour_bucket() {
            *pub_counts.entry((e.publisher_id, bucket)).or_insert(0.0) += 1.0;
        }
    }
    let mut pub_series: HashMap<i64, Vec<(i64, f64, bool)>> = HashMap::new();
    for ((publisher_id, bucket), count) in pub_counts {
        pub_series
            .entry(publisher_id)
            .or_default()
            .push((bucket, count, true));
    }
    let mut pub_map = Vec::new();
    for (publisher_id, mut series) in pub_series {
        series.sort_by_key(|p| p.0);
        for p in top_k(scan_series(&series, config), config) {
            pub_map.push(((publisher_id, p.bucket), p.severity));
        }
    }
    let pub_map = merge_max(pub_map);

    info!(
        detector = %DetectorId::VolumeSpike,
        campaign_spikes = campaign_map.len(),
        publisher_spikes = pub_map.len(),
        "detection complete"
    );

    let raised_reports = apply_labels(
        &reports.rows,
        &mut reports.labels,
        DetectorId::VolumeSpike,
        &campaign_map,
        |r| r.hour_bucket().map(|b| (r.campaign_id, b)),
        ReportTable::table_name(),
    )?;
    let raised_events = apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::VolumeSpike,
        &pub_map,
        |e| e.hour_bucket().map(|b| (e.publisher_id, b)),
        EventTable::table_name(),
    )?;
    Ok(raised_reports + raised_events)
}
