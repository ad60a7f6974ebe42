//! D6: conversion-latency (CTIT) share. Bots convert either instantly or on a
//! 24h+ replay schedule, so a group whose latency mass piles up at one end of
//! the distribution is flagged.
//!
//! Upstream systems disagree on the latency unit (s / ms / us / ns). The unit
//! is recovered per batch by trying each divisor and keeping the one whose
//! scaled distribution looks most like human behavior.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::CtitConfig;
use crate::detectors::{day_key, median, quantile};
use crate::error::EngineError;
use crate::fusion::{apply_labels, merge_max};
use crate::types::{Campaign, DetectorId, Settlement, SettlementTable, Severity};

const SEVEN_DAYS_SECS: f64 = 7.0 * 24.0 * 3600.0;
const DIVISORS: [f64; 4] = [1.0, 1e3, 1e6, 1e9];

/// Pick the divisor under which the latency distribution is most plausible:
/// little mass beyond seven days, median and p95 in human ranges.
fn autoscale_divisor(raw: &[f64]) -> f64 {
    let mut best = (f64::MAX, 1.0);
    for div in DIVISORS {
        let scaled: Vec<f64> = raw.iter().map(|v| v / div).collect();
        let over = scaled.iter().filter(|v| **v >= SEVEN_DAYS_SECS).count() as f64
            / scaled.len() as f64;
        let mut score = over * 100.0;
        if let Some(med) = median(&scaled) {
            if !(1.0..=6.0 * 3600.0).contains(&med) {
                score += 10.0;
            }
        }
        if let Some(p95) = quantile(&scaled, 0.95) {
            if !(3.0..=SEVEN_DAYS_SECS).contains(&p95) {
                score += 10.0;
            }
        }
        if score < best.0 {
            best = (score, div);
        }
    }
    best.1
}

/// Latency in seconds, or `None` when the raw value is unusable.
fn latency_secs(s: &Settlement, divisor: f64) -> Option<f64> {
    let raw = s.latency_raw?;
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    Some((raw / divisor).min(SEVEN_DAYS_SECS))
}

struct GroupStats {
    n: u64,
    short: u64,
    long: u64,
    short_by_publisher: HashMap<i64, (u64, u64)>, // (short, total)
}

fn short_cut_secs(config: &CtitConfig, campaign: Option<&Campaign>) -> f64 {
    let Some(c) = campaign else {
        return config.default_short_secs;
    };
    config
        .short_secs_by_category
        .get(&c.category)
        .or_else(|| config.short_secs_by_type.get(&c.campaign_type))
        .copied()
        .unwrap_or(config.default_short_secs)
}

fn short_share_threshold(config: &CtitConfig, campaign: Option<&Campaign>) -> f64 {
    campaign
        .and_then(|c| config.short_share_by_type.get(&c.campaign_type))
        .copied()
        .unwrap_or(config.default_short_share)
}

fn severity_for(
    config: &CtitConfig,
    stats: &GroupStats,
    short_share_th: f64,
    check_dominance: bool,
) -> Option<Severity> {
    if stats.n < config.min_daily_n {
        return None;
    }
    let n = stats.n as f64;
    let short_share = stats.short as f64 / n;
    let long_share = stats.long as f64 / n;
    let short_hit = short_share >= short_share_th;
    let long_hit = long_share >= config.long_share;

    // A single publisher contributing most of the near-zero latencies turns
    // a Suspect group into a Confirmed one.
    let dominance = check_dominance
        && stats.short > 0
        && stats
            .short_by_publisher
            .values()
            .max_by_key(|(short, _)| *short)
            .map(|(short, total)| {
                let own_share = *short as f64 / (*total).max(1) as f64;
                let contribution = *short as f64 / stats.short as f64;
                own_share >= config.dominant_pub_short_share
                    && contribution >= config.dominant_pub_contribution
            })
            .unwrap_or(false);

    if (short_hit && long_hit)
        || (short_hit && dominance)
        || long_share >= config.long_share * config.confirmed_long_mult
    {
        return Some(Severity::Confirmed);
    }
    if short_share >= short_share_th * config.suspect_mult
        || long_share >= config.long_share * config.suspect_mult
    {
        return Some(Severity::Suspect);
    }
    None
}

pub fn apply(
    config: &CtitConfig,
    campaigns: &[Campaign],
    settlements: &mut SettlementTable,
) -> Result<usize, EngineError> {
    if !settlements.caps.has_latency || !settlements.caps.has_media {
        debug!(
            detector = %DetectorId::CtitShare,
            "settlement table lacks latency or media columns, skipping"
        );
        return Ok(0);
    }
    let meta: HashMap<i64, &Campaign> =
        campaigns.iter().map(|c| (c.campaign_id, c)).collect();

    let raw: Vec<f64> = settlements
        .rows
        .iter()
        .filter_map(|s| s.latency_raw)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .collect();
    if raw.is_empty() {
        return Ok(0);
    }
    let divisor = autoscale_divisor(&raw);
    debug!(detector = %DetectorId::CtitShare, divisor, "latency unit resolved");

    // variant 1: media x campaign x day, with publisher dominance promotion
    let mut media_groups: HashMap<(i64, i64, i32), GroupStats> = HashMap::new();
    // variant 2: + publisher, catches the placement directly
    let mut pub_groups: HashMap<(i64, i64, i64, i32), GroupStats> = HashMap::new();

    for s in &settlements.rows {
        let (Some(media_id), Some(date), Some(secs)) =
            (s.media_id, s.day(), latency_secs(s, divisor))
        else {
            continue;
        };
        let campaign = meta.get(&s.campaign_id).copied();
        let short_cut = short_cut_secs(config, campaign);
        let is_short = secs <= short_cut;
        let is_long = secs >= config.long_hours * 3600.0;
        let day = day_key(date);

        let g = media_groups
            .entry((media_id, s.campaign_id, day))
            .or_insert_with(|| GroupStats {
                n: 0,
                short: 0,
                long: 0,
                short_by_publisher: HashMap::new(),
            });
        g.n += 1;
        g.short += is_short as u64;
        g.long += is_long as u64;
        if let Some(publisher_id) = s.publisher_id {
            let slot = g.short_by_publisher.entry(publisher_id).or_insert((0, 0));
            slot.0 += is_short as u64;
            slot.1 += 1;

            let pg = pub_groups
                .entry((publisher_id, media_id, s.campaign_id, day))
                .or_insert_with(|| GroupStats {
                    n: 0,
                    short: 0,
                    long: 0,
                    short_by_publisher: HashMap::new(),
                });
            pg.n += 1;
            pg.short += is_short as u64;
            pg.long += is_long as u64;
        }
    }

    let media_map = merge_max(media_groups.into_iter().filter_map(|(key, stats)| {
        let campaign = meta.get(&key.1).copied();
        let th = short_share_threshold(config, campaign);
        severity_for(config, &stats, th, true).map(|sev| (key, sev))
    }));
    let pub_map = merge_max(pub_groups.into_iter().filter_map(|(key, stats)| {
        let campaign = meta.get(&key.2).copied();
        let th = short_share_threshold(config, campaign);
        severity_for(config, &stats, th, false).map(|sev| (key, sev))
    }));

    info!(
        detector = %DetectorId::CtitShare,
        media_groups = media_map.len(),
        publisher_groups = pub_map.len(),
        "detection complete"
    );

    let raised_media = apply_labels(
        &settlements.rows,
        &mut settlements.labels,
        DetectorId::CtitShare,
        &media_map,
        |s| Some((s.media_id?, s.campaign_id, day_key(s.day()?))),
        SettlementTable::table_name(),
    )?;
    let raised_pub = apply_labels(
        &settlements.rows,
        &mut settlements.labels,
        DetectorId::CtitShare,
        &pub_map,
        |s| {
            Some((
                s.publisher_id?,
                s.media_id?,
                s.campaign_id,
                day_key(s.day()?),
            ))
        },
        SettlementTable::table_name(),
    )?;
    Ok(raised_media + raised_pub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RejoinPolicy;
    use chrono::{TimeZone, Utc};

    fn campaign(id: i64, campaign_type: i32, category: i32) -> Campaign {
        Campaign {
            campaign_id: id,
            rejoin_policy: RejoinPolicy::Unlimited,
            campaign_type,
            category,
            started_at: None,
            ended_at: None,
        }
    }

    fn settlement(i: usize, campaign_id: i64, publisher_id: i64, latency: f64) -> Settlement {
        Settlement {
            click_key: format!("s-{}", i),
            campaign_id,
            media_id: Some(1),
            publisher_id: Some(publisher_id),
            device_id: i as i64 + 1,
            address: None,
            occurred_at: Utc.with_ymd_and_hms(2025, 8, 10, 11, 0, 0).latest(),
            latency_raw: Some(latency),
            cost: None,
        }
    }

    #[test]
    fn test_autoscale_picks_milliseconds() {
        // human latencies expressed in ms
        let raw: Vec<f64> = (0..100).map(|i| 30_000.0 + i as f64 * 2000.0).collect();
        assert_eq!(autoscale_divisor(&raw), 1e3);
    }

    #[test]
    fn test_autoscale_keeps_seconds() {
        let raw: Vec<f64> = (0..100).map(|i| 30.0 + i as f64 * 10.0).collect();
        assert_eq!(autoscale_divisor(&raw), 1.0);
    }

    #[test]
    fn test_short_flood_with_long_tail_confirmed() {
        // 70% of conversions inside 10s plus a 25% 24h+ replay tail
        let mut rows = Vec::new();
        for i in 0..28 {
            rows.push(settlement(i, 1, 7, 5.0));
        }
        for i in 28..38 {
            rows.push(settlement(i, 1, 7, 25.0 * 3600.0));
        }
        for i in 38..40 {
            rows.push(settlement(i, 1, 7, 600.0));
        }
        let mut table = SettlementTable::new(rows);
        apply(
            &CtitConfig::default(),
            &[campaign(1, 2, 0)],
            &mut table,
        )
        .unwrap();
        assert!(table
            .labels
            .iter()
            .all(|l| l.get(DetectorId::CtitShare) == Severity::Confirmed));
    }

    #[test]
    fn test_healthy_distribution_untouched() {
        let rows: Vec<Settlement> = (0..50)
            .map(|i| settlement(i, 1, 7, 60.0 + (i as f64 * 37.0) % 2000.0))
            .collect();
        let mut table = SettlementTable::new(rows);
        apply(&CtitConfig::default(), &[campaign(1, 2, 0)], &mut table).unwrap();
        assert!(table
            .labels
            .iter()
            .all(|l| l.get(DetectorId::CtitShare) == Severity::Normal));
    }

    #[test]
    fn test_small_group_never_flagged() {
        // 10 instant conversions, below the 30-row floor
        let rows: Vec<Settlement> = (0..10).map(|i| settlement(i, 1, 7, 1.0)).collect();
        let mut table = SettlementTable::new(rows);
        apply(&CtitConfig::default(), &[campaign(1, 2, 0)], &mut table).unwrap();
        assert!(table
            .labels
            .iter()
            .all(|l| l.get(DetectorId::CtitShare) == Severity::Normal));
    }

    #[test]
    fn test_category_threshold_overrides_type() {
        // 25s installs: implausibly fast for a game (category cut 30s), but
        // plausible for a bare type-1 campaign (cut 15s)
        let rows: Vec<Settlement> = (0..40).map(|i| settlement(i, 1, 7, 25.0)).collect();
        let mut games = SettlementTable::new(rows.clone());
        apply(&CtitConfig::default(), &[campaign(1, 1, 2)], &mut games).unwrap();
        assert!(games
            .labels
            .iter()
            .all(|l| l.get(DetectorId::CtitShare).is_flagged()));

        let mut plain = SettlementTable::new(rows);
        apply(&CtitConfig::default(), &[campaign(1, 1, 0)], &mut plain).unwrap();
        assert!(plain
            .labels
            .iter()
            .all(|l| l.get(DetectorId::CtitShare) == Severity::Normal));
    }

    #[test]
    fn test_dominant_publisher_promotes_to_confirmed() {
        // type 3 campaign: short cut 3s, share threshold 0.8
        let mut rows = Vec::new();
        for i in 0..33 {
            rows.push(settlement(i, 1, 7, 1.0)); // one publisher, instant
        }
        for i in 33..40 {
            rows.push(settlement(i, 1, 8, 2.0));
        }
        let mut table = SettlementTable::new(rows);
        apply(&CtitConfig::default(), &[campaign(1, 3, 0)], &mut table).unwrap();
        assert!(table
            .labels
            .iter()
            .any(|l| l.get(DetectorId::CtitShare) == Severity::Confirmed));
    }
}
