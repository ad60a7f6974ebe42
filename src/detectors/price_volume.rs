//! D7: price/volume anomaly. A media's unit conversion price and daily
//! volume follow its own report history; a day where both jump together is
//! payout inflation. Thresholds scale with media turnover so a large network
//! is not flagged for swings a small one would never see.

use std::collections::HashMap;

use chrono::NaiveDate;
use tracing::{debug, info};

use crate::config::PriceVolumeConfig;
use crate::detectors::day_key;
use crate::error::EngineError;
use crate::fusion::{apply_labels, merge_max};
use crate::types::{DetectorId, ReportTable, SettlementTable, Severity};

struct Baseline {
    unit_mean: f64,
    unit_std: f64,
    volume_mean: f64,
    turnover_mean: f64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tier {
    Small,
    Medium,
    Large,
}

fn tier_for(config: &PriceVolumeConfig, turnover: f64) -> Tier {
    if turnover >= config.large_turnover {
        Tier::Large
    } else if turnover >= config.medium_turnover {
        Tier::Medium
    } else {
        Tier::Small
    }
}

fn scaled_cuts(config: &PriceVolumeConfig, tier: Tier) -> (f64, f64) {
    let (r, z) = match tier {
        Tier::Large => (config.large_ratio_scale, config.large_z_scale),
        Tier::Medium => (1.0, 1.0),
        Tier::Small => (config.small_ratio_scale, config.small_z_scale),
    };
    (config.price_ratio * r, config.price_z * z)
}

/// Per-media baseline from the daily report history.
fn baselines(config: &PriceVolumeConfig, reports: &ReportTable) -> HashMap<i64, Baseline> {
    let mut daily: HashMap<(i64, NaiveDate), (i64, f64)> = HashMap::new();
    for r in &reports.rows {
        let slot = daily.entry((r.media_id, r.date)).or_insert((0, 0.0));
        slot.0 += r.conversions;
        slot.1 += r.revenue;
    }

    let mut per_media: HashMap<i64, Vec<(i64, f64)>> = HashMap::new();
    for ((media_id, _), (turn, earn)) in daily {
        if turn >= config.min_daily_volume {
            per_media.entry(media_id).or_default().push((turn, earn));
        }
    }

    let mut out = HashMap::new();
    for (media_id, days) in per_media {
        if days.len() < config.min_history_days {
            continue;
        }
        let units: Vec<f64> = days
            .iter()
            .filter(|(turn, _)| *turn > 0)
            .map(|(turn, earn)| earn / *turn as f64)
            .collect();
        if units.is_empty() {
            continue;
        }
        let unit_mean = units.iter().sum::<f64>() / units.len() as f64;
        let var = units.iter().map(|u| (u - unit_mean).powi(2)).sum::<f64>() / units.len() as f64;
        let mut unit_std = var.sqrt();
        if unit_std <= 0.0 {
            // degenerate history still deserves a z denominator
            unit_std = 0.3 * unit_mean;
        }
        let volume_mean =
            days.iter().map(|(turn, _)| *turn as f64).sum::<f64>() / days.len() as f64;
        out.insert(
            media_id,
            Baseline {
                unit_mean,
                unit_std,
                volume_mean,
                turnover_mean: volume_mean,
            },
        );
    }
    out
}

pub fn apply(
    config: &PriceVolumeConfig,
    reports: &mut ReportTable,
    settlements: &mut SettlementTable,
) -> Result<usize, EngineError> {
    if !settlements.caps.has_cost || !settlements.caps.has_media {
        debug!(
            detector = %DetectorId::PriceVolume,
            "settlement table lacks cost or media columns, skipping"
        );
        return Ok(0);
    }
    let baselines = baselines(config, reports);
    if baselines.is_empty() {
        debug!(detector = %DetectorId::PriceVolume, "no media has enough report history");
        return Ok(0);
    }

    // current day per media x publisher: conversion count and mean price
    let mut groups: HashMap<(i64, Option<i64>, i32), (u64, f64)> = HashMap::new();
    for s in &settlements.rows {
        let (Some(media_id), Some(date), Some(cost)) = (s.media_id, s.day(), s.cost) else {
            continue;
        };
        if !cost.is_finite() || cost < 0.0 {
            continue;
        }
        let slot = groups
            .entry((media_id, s.publisher_id, day_key(date)))
            .or_insert((0, 0.0));
        slot.0 += 1;
        slot.1 += cost;
    }

    struct Scored {
        media_id: i64,
        publisher_id: Option<i64>,
        day: i32,
        severity: Severity,
        score: f64,
    }
    let mut scored: Vec<Scored> = Vec::new();
    for ((media_id, publisher_id, day), (count, cost_sum)) in groups {
        let Some(base) = baselines.get(&media_id) else { continue };
        if base.unit_mean <= 0.0 {
            continue;
        }
        let unit = cost_sum / count as f64;
        let ratio = unit / base.unit_mean;
        let z = (unit - base.unit_mean) / base.unit_std;
        let vol_ratio = count as f64 / base.volume_mean.max(1.0);

        let tier = tier_for(config, base.turnover_mean);
        let (ratio_cut, z_cut) = scaled_cuts(config, tier);
        let price_spike = ratio >= ratio_cut && z.abs() >= z_cut;
        let volume_spike = vol_ratio >= config.volume_ratio;
        let extreme = unit >= config.extreme_price;
        if !price_spike && !volume_spike && !extreme {
            continue;
        }

        let score = ratio * (z.abs() + 1.0) * vol_ratio.max(1.0);
        let severity = if unit >= config.extreme_price_confirmed
            || score >= config.confirmed_score * config.confirmed_mult
        {
            Severity::Confirmed
        } else if extreme || score >= config.suspect_score * config.suspect_mult {
            Severity::Suspect
        } else {
            continue;
        };
        scored.push(Scored {
            media_id,
            publisher_id,
            day,
            severity,
            score,
        });
    }

    // keep only the worst offenders per media-day
    let mut by_media_day: HashMap<(i64, i32), Vec<Scored>> = HashMap::new();
    for s in scored {
        by_media_day.entry((s.media_id, s.day)).or_default().push(s);
    }
    let mut pub_entries = Vec::new();
    let mut day_entries = Vec::new();
    for (_, mut list) in by_media_day {
        list.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        list.truncate(config.top_k);
        for s in list {
            if let Some(publisher_id) = s.publisher_id {
                pub_entries.push(((s.media_id, publisher_id, s.day), s.severity));
            }
            day_entries.push(((s.media_id, s.day), s.severity));
        }
    }
    let pub_map = merge_max(pub_entries);
    let day_map = merge_max(day_entries);

    info!(
        detector = %DetectorId::PriceVolume,
        publisher_days = pub_map.len(),
        media_days = day_map.len(),
        "detection complete"
    );

    let raised_settle = apply_labels(
        &settlements.rows,
        &mut settlements.labels,
        DetectorId::PriceVolume,
        &pub_map,
        |s| Some((s.media_id?, s.publisher_id?, day_key(s.day()?))),
        SettlementTable::table_name(),
    )?;
    // rows without a publisher column fall back to the media-day roll-up
    let raised_orphan = apply_labels(
        &settlements.rows,
        &mut settlements.labels,
        DetectorId::PriceVolume,
        &day_map,
        |s| {
            if s.publisher_id.is_some() {
                return None;
            }
            Some((s.media_id?, day_key(s.day()?)))
        },
        SettlementTable::table_name(),
    )?;
    let raised_report = apply_labels(
        &reports.rows,
        &mut reports.labels,
        DetectorId::PriceVolume,
        &day_map,
        |r| Some((r.media_id, day_key(r.date))),
        ReportTable::table_name(),
    )?;
    Ok(raised_settle + raised_orphan + raised_report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ReportRow, Settlement};
    use chrono::{TimeZone, Utc};

    fn report(media_id: i64, day: u32, conversions: i64, revenue: f64) -> ReportRow {
        ReportRow {
            campaign_id: 1,
            media_id,
            date: NaiveDate::from_ymd_opt(2025, 8, day).unwrap(),
            hour: 12,
            clicks: conversions * 20,
            conversions,
            cost: 0.0,
            revenue,
        }
    }

    fn settlement(i: usize, media_id: i64, publisher_id: i64, day: u32, cost: f64) -> Settlement {
        Settlement {
            click_key: format!("s-{}", i),
            campaign_id: 1,
            media_id: Some(media_id),
            publisher_id: Some(publisher_id),
            device_id: 1,
            address: None,
            occurred_at: Utc.with_ymd_and_hms(2025, 8, day, 9, 0, 0).latest(),
            latency_raw: None,
            cost: Some(cost),
        }
    }

    /// 14 history days at ~100 conversions of unit price ~10.
    fn history(media_id: i64) -> Vec<ReportRow> {
        (1..=14)
            .map(|d| report(media_id, d, 100, 1000.0 + (d as f64 % 3.0) * 30.0))
            .collect()
    }

    #[test]
    fn test_price_and_volume_spike_confirmed() {
        let mut reports = ReportTable::new(history(1));
        // day 20: 200 conversions at unit price 60, six times the baseline
        let rows: Vec<Settlement> = (0..200)
            .map(|i| settlement(i, 1, 5, 20, 60.0))
            .collect();
        let mut settlements = SettlementTable::new(rows);
        apply(&PriceVolumeConfig::default(), &mut reports, &mut settlements).unwrap();
        assert!(settlements
            .labels
            .iter()
            .all(|l| l.get(DetectorId::PriceVolume) == Severity::Confirmed));
    }

    #[test]
    fn test_baseline_day_untouched() {
        let mut reports = ReportTable::new(history(1));
        let rows: Vec<Settlement> = (0..100)
            .map(|i| settlement(i, 1, 5, 20, 10.0))
            .collect();
        let mut settlements = SettlementTable::new(rows);
        apply(&PriceVolumeConfig::default(), &mut reports, &mut settlements).unwrap();
        assert!(settlements
            .labels
            .iter()
            .all(|l| l.get(DetectorId::PriceVolume) == Severity::Normal));
    }

    #[test]
    fn test_short_history_media_skipped() {
        let mut reports = ReportTable::new(
            (1..=5)
                .map(|d| report(1, d, 100, 1000.0))
                .collect::<Vec<_>>(),
        );
        let rows: Vec<Settlement> = (0..200)
            .map(|i| settlement(i, 1, 5, 20, 60.0))
            .collect();
        let mut settlements = SettlementTable::new(rows);
        apply(&PriceVolumeConfig::default(), &mut reports, &mut settlements).unwrap();
        assert!(settlements
            .labels
            .iter()
            .all(|l| l.get(DetectorId::PriceVolume) == Severity::Normal));
    }

    #[test]
    fn test_extreme_absolute_price_flags_without_ratio_math() {
        let mut reports = ReportTable::new(history(1));
        let rows: Vec<Settlement> = (0..5)
            .map(|i| settlement(i, 1, 5, 20, 12_000.0))
            .collect();
        let mut settlements = SettlementTable::new(rows);
        apply(&PriceVolumeConfig::default(), &mut reports, &mut settlements).unwrap();
        assert!(settlements
            .labels
            .iter()
            .all(|l| l.get(DetectorId::PriceVolume) == Severity::Confirmed));
    }

    #[test]
    fn test_report_rows_inherit_media_day_label() {
        let mut rows = history(1);
        rows.push(report(1, 20, 10, 100.0));
        let mut reports = ReportTable::new(rows);
        let settle_rows: Vec<Settlement> = (0..200)
            .map(|i| settlement(i, 1, 5, 20, 60.0))
            .collect();
        let mut settlements = SettlementTable::new(settle_rows);
        apply(&PriceVolumeConfig::default(), &mut reports, &mut settlements).unwrap();
        let last = reports.labels.last().unwrap();
        assert!(last.get(DetectorId::PriceVolume).is_flagged());
        assert_eq!(
            reports.labels[0].get(DetectorId::PriceVolume),
            Severity::Normal
        );
    }
}
