//! D4: night-hours abuse. Campaign-days whose traffic is concentrated in the
//! dead of night, confirmed by a vote over five independent quality signals.
//! Labels attach only to the night-hour rows, attributed to the dominant
//! media or publisher when one exists.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::NaiveDate;
use tracing::info;

use crate::config::NightConfig;
use crate::detectors::{day_key, median};
use crate::error::EngineError;
use crate::fusion::{apply_labels, merge_max};
use crate::types::{DetectorId, EventTable, ReportTable, Settlement, SettlementTable, Severity};

#[derive(Default)]
struct DayAgg {
    total: u64,
    night: u64,
    night_by_publisher: HashMap<i64, u64>,
    night_by_media: HashMap<i64, u64>,
    night_devices: HashSet<i64>,
    devices_by_address: HashMap<String, HashSet<i64>>,
    conversions: u64,
    night_conversions: u64,
    ctit_short: u64,
    ctit_long: u64,
    ctit_n: u64,
}

enum Attribution {
    Media(i64),
    Publisher(i64),
    Campaign,
}

const LONG_CUT_SECS: f64 = 24.0 * 3600.0;

fn is_night(config: &NightConfig, hour: u32) -> bool {
    (config.night_start_hour..=config.night_end_hour).contains(&hour)
}

fn top_share(counts: &HashMap<i64, u64>, total: u64) -> Option<(i64, f64)> {
    if total == 0 {
        return None;
    }
    counts
        .iter()
        .max_by_key(|(_, n)| **n)
        .map(|(id, n)| (*id, *n as f64 / total as f64))
}

fn settlement_latency_secs(s: &Settlement) -> Option<f64> {
    s.latency_raw.filter(|v| v.is_finite() && *v >= 0.0)
}

pub fn apply(
    config: &NightConfig,
    events: &mut EventTable,
    settlements: &mut SettlementTable,
    reports: &mut ReportTable,
) -> Result<usize, EngineError> {
    // BTreeMap keeps days ordered for the rolling CR baseline.
    let mut days: HashMap<i64, BTreeMap<NaiveDate, DayAgg>> = HashMap::new();
    for e in &events.rows {
        let (Some(date), Some(hour)) = (e.day(), e.hour()) else {
            continue;
        };
        let agg = days.entry(e.campaign_id).or_default().entry(date).or_default();
        agg.total += 1;
        if is_night(config, hour) {
            agg.night += 1;
            *agg.night_by_publisher.entry(e.publisher_id).or_insert(0) += 1;
            *agg.night_by_media.entry(e.media_id).or_insert(0) += 1;
            if e.device_id != 0 {
                agg.night_devices.insert(e.device_id);
                if let Some(addr) = &e.address {
                    agg.devices_by_address
                        .entry(addr.clone())
                        .or_default()
                        .insert(e.device_id);
                }
            }
        }
    }
    for s in &settlements.rows {
        let (Some(date), Some(hour)) = (s.day(), s.hour()) else {
            continue;
        };
        let Some(agg) = days
            .get_mut(&s.campaign_id)
            .and_then(|m| m.get_mut(&date))
        else {
            continue;
        };
        agg.conversions += 1;
        if is_night(config, hour) {
            agg.night_conversions += 1;
        }
        if let Some(secs) = settlement_latency_secs(s) {
            agg.ctit_n += 1;
            if secs <= config.ctit_short_secs {
                agg.ctit_short += 1;
            }
            if secs >= LONG_CUT_SECS {
                agg.ctit_long += 1;
            }
        }
    }

    // key: (campaign, day) plus the attribution id for event-row scoping
    let mut media_scoped = Vec::new();
    let mut publisher_scoped = Vec::new();
    let mut campaign_scoped = Vec::new();
    let mut day_scoped = Vec::new();

    for (campaign_id, by_day) in &days {
        let mut cr_history: Vec<f64> = Vec::new();
        for (history_len, (date, agg)) in by_day.iter().enumerate() {
            let cr = if agg.total > 0 {
                agg.conversions as f64 / agg.total as f64
            } else {
                0.0
            };
            let baseline = if cr_history.len() >= config.cr_min_samples {
                let start = cr_history.len().saturating_sub(config.cr_window_days);
                median(&cr_history[start..])
            } else {
                None
            };
            cr_history.push(cr);

            let night_share = if agg.total > 0 {
                agg.night as f64 / agg.total as f64
            } else {
                0.0
            };
            if agg.total < config.min_total
                || night_share < config.night_share
                || history_len + 1 < config.min_history_days
            {
                continue;
            }

            let mut signals = 0usize;
            // a) night conversion rate collapsed against the rolling baseline
            if let Some(base_cr) = baseline {
                if agg.night > 0 && base_cr > 0.0 {
                    let night_cr = agg.night_conversions as f64 / agg.night as f64;
                    if night_cr <= config.cr_drop_ratio * base_cr {
                        signals += 1;
                    }
                }
            }
            // b) one publisher owns the night traffic
            if let Some((_, share)) = top_share(&agg.night_by_publisher, agg.night) {
                if share >= config.top_publisher_share {
                    signals += 1;
                }
            }
            // c) few distinct devices behind many clicks
            if !agg.night_devices.is_empty() {
                let uniqueness = agg.night_devices.len() as f64 / agg.night as f64;
                if uniqueness <= config.device_uniqueness_max {
                    signals += 1;
                }
            }
            // d) conversion latency distribution is degenerate
            if agg.ctit_n > 0 {
                let short_share = agg.ctit_short as f64 / agg.ctit_n as f64;
                let long_share = agg.ctit_long as f64 / agg.ctit_n as f64;
                if short_share >= config.ctit_short_share || long_share >= config.ctit_long_share {
                    signals += 1;
                }
            }
            // e) device farms share egress addresses
            let max_per_addr = agg
                .devices_by_address
                .values()
                .map(|d| d.len() as u64)
                .max()
                .unwrap_or(0);
            if max_per_addr >= config.max_devices_per_address {
                signals += 1;
            }

            let severity = if signals >= config.confirmed_signals {
                Severity::Confirmed
            } else if signals >= config.suspect_signals {
                Severity::Suspect
            } else {
                continue;
            };

            let day = day_key(*date);
            match attribute(config, agg) {
                Attribution::Media(media_id) => {
                    media_scoped.push(((media_id, *campaign_id, day), severity));
                }
                Attribution::Publisher(publisher_id) => {
                    publisher_scoped.push(((publisher_id, *campaign_id, day), severity));
                }
                Attribution::Campaign => {
                    campaign_scoped.push(((*campaign_id, day), severity));
                }
            }
            day_scoped.push(((*campaign_id, day), severity));
        }
    }

    let media_map = merge_max(media_scoped);
    let publisher_map = merge_max(publisher_scoped);
    let campaign_map = merge_max(campaign_scoped);
    let day_map = merge_max(day_scoped);
    info!(
        detector = %DetectorId::NightHours,
        flagged_days = day_map.len(),
        media_scoped = media_map.len(),
        publisher_scoped = publisher_map.len(),
        "detection complete"
    );

    // Only night-hour rows inherit the label, under their attribution scope.
    let mut raised = 0usize;
    raised += apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::NightHours,
        &media_map,
        |e| {
            e.hour().filter(|h| is_night(config, *h))?;
            Some((e.media_id, e.campaign_id, day_key(e.day()?)))
        },
        EventTable::table_name(),
    )?;
    raised += apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::NightHours,
        &publisher_map,
        |e| {
            e.hour().filter(|h| is_night(config, *h))?;
            Some((e.publisher_id, e.campaign_id, day_key(e.day()?)))
        },
        EventTable::table_name(),
    )?;
    raised += apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::NightHours,
        &campaign_map,
        |e| {
            e.hour().filter(|h| is_night(config, *h))?;
            Some((e.campaign_id, day_key(e.day()?)))
        },
        EventTable::table_name(),
    )?;
    raised += apply_labels(
        &settlements.rows,
        &mut settlements.labels,
        DetectorId::NightHours,
        &day_map,
        |s| {
            s.hour().filter(|h| is_night(config, *h))?;
            Some((s.campaign_id, day_key(s.day()?)))
        },
        SettlementTable::table_name(),
    )?;
    raised += apply_labels(
        &reports.rows,
        &mut reports.labels,
        DetectorId::NightHours,
        &day_map,
        |r| {
            if !is_night(config, r.hour) {
                return None;
            }
            Some((r.campaign_id, day_key(r.date)))
        },
        ReportTable::table_name(),
    )?;
    Ok(raised)
}

fn attribute(config: &NightConfig, agg: &DayAgg) -> Attribution {
    if let Some((media_id, share)) = top_share(&agg.night_by_media, agg.night) {
        if share >= config.scope_share {
            return Attribution::Media(media_id);
        }
    }
    if let Some((publisher_id, share)) = top_share(&agg.night_by_publisher, agg.night) {
        if share >= config.scope_share {
            return Attribution::Publisher(publisher_id);
        }
    }
    Attribution::Campaign
}
