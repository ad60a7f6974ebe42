//! D9: publisher concentration. A placement whose clicks pile onto one hour
//! of the day, a handful of devices, or a few addresses is a script, not an
//! audience. Only publishers with real volume are judged, and mega-publishers
//! get wider per-entity allowances.

use std::collections::HashMap;

use tracing::info;

use crate::config::ConcentrationConfig;
use crate::error::EngineError;
use crate::fusion::{apply_labels, merge_max};
use crate::identity::IdentityResolver;
use crate::types::{DetectorId, EventTable, Severity};

#[derive(Default)]
struct PubAgg {
    clicks: u64,
    hours: HashMap<u32, u64>,
    device_clicks: HashMap<i64, u64>,
    web_clicks: u64,
    address_clicks: HashMap<String, u64>,
}

fn two_cut(value: f64, suspect: f64, confirmed: f64) -> Severity {
    if value >= confirmed {
        Severity::Confirmed
    } else if value >= suspect {
        Severity::Suspect
    } else {
        Severity::Normal
    }
}

fn judge(config: &ConcentrationConfig, agg: &PubAgg) -> Severity {
    let mega = agg.clicks >= config.mega_clicks;
    let mut worst = Severity::Normal;

    // hour-of-day mode share
    if let Some(top) = agg.hours.values().copied().max() {
        let share = top as f64 / agg.clicks as f64;
        worst = worst.max(two_cut(
            share,
            config.hour_share_suspect,
            config.hour_share_confirmed,
        ));
    }

    // device concentration
    let device_rows: u64 = agg.device_clicks.values().sum();
    if device_rows > config.min_device_rows && !agg.device_clicks.is_empty() {
        let avg = device_rows as f64 / agg.device_clicks.len() as f64;
        let (avg_sus, avg_conf) = if mega {
            (config.mega_device_avg_suspect, config.mega_device_avg_confirmed)
        } else {
            (config.device_avg_suspect, config.device_avg_confirmed)
        };
        worst = worst.max(two_cut(avg, avg_sus, avg_conf));

        let top = agg.device_clicks.values().copied().max().unwrap_or(0);
        let share = top as f64 / device_rows as f64;
        worst = worst.max(two_cut(
            share,
            config.top_device_share_suspect,
            config.top_device_share_confirmed,
        ));
    }

    // address concentration on the web side
    if agg.web_clicks > config.min_web_rows
        && agg.address_clicks.len() as u64 > config.min_valid_addresses
    {
        let addr_rows: u64 = agg.address_clicks.values().sum();
        let avg = addr_rows as f64 / agg.address_clicks.len() as f64;
        let (avg_sus, avg_conf) = if mega {
            (config.mega_address_avg_suspect, config.mega_address_avg_confirmed)
        } else {
            (config.address_avg_suspect, config.address_avg_confirmed)
        };
        worst = worst.max(two_cut(avg, avg_sus, avg_conf));

        let top = agg.address_clicks.values().copied().max().unwrap_or(0);
        let share = top as f64 / addr_rows as f64;
        worst = worst.max(two_cut(
            share,
            config.top_address_share_suspect,
            config.top_address_share_confirmed,
        ));
    }

    worst
}

pub fn apply(
    config: &ConcentrationConfig,
    resolver: &IdentityResolver,
    events: &mut EventTable,
) -> Result<usize, EngineError> {
    let mut aggs: HashMap<(i64, i64), PubAgg> = HashMap::new();
    for e in &events.rows {
        let agg = aggs.entry((e.media_id, e.publisher_id)).or_default();
        agg.clicks += 1;
        if let Some(hour) = e.hour() {
            *agg.hours.entry(hour).or_insert(0) += 1;
        }
        if e.device_id != 0 {
            *agg.device_clicks.entry(e.device_id).or_insert(0) += 1;
        } else {
            agg.web_clicks += 1;
            if let Some(addr) = e.address.as_deref() {
                if !resolver.is_infrastructure(addr) {
                    *agg.address_clicks.entry(addr.to_string()).or_insert(0) += 1;
                }
            }
        }
    }

    let map = merge_max(aggs.iter().filter_map(|(key, agg)| {
        if agg.clicks < config.min_clicks {
            return None;
        }
        let severity = judge(config, agg);
        severity.is_flagged().then_some((*key, severity))
    }));
    info!(
        detector = %DetectorId::PublisherConcentration,
        publishers = aggs.len(),
        flagged = map.len(),
        "detection complete"
    );

    apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::PublisherConcentration,
        &map,
        |e| Some((e.media_id, e.publisher_id)),
        EventTable::table_name(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::types::ClickEvent;
    use chrono::{TimeZone, Utc};

    fn click(i: usize, publisher_id: i64, device_id: i64, hour: u32) -> ClickEvent {
        ClickEvent {
            click_key: format!("c-{}-{}", publisher_id, i),
            campaign_id: 1,
            media_id: 1,
            publisher_id,
            device_id,
            address: None,
            clicked_at: Utc
                .with_ymd_and_hms(2025, 8, 10 + (i / 500) as u32, hour, (i % 60) as u32, 0)
                .latest(),
        }
    }

    fn run(rows: Vec<ClickEvent>) -> EventTable {
        let resolver = IdentityResolver::audit(&IdentityConfig::default(), &rows);
        let mut events = EventTable::new(rows);
        apply(&ConcentrationConfig::default(), &resolver, &mut events).unwrap();
        events
    }

    #[test]
    fn test_small_publisher_not_judged() {
        // heavy concentration but under the 1000-click floor
        let rows: Vec<ClickEvent> = (0..500).map(|i| click(i, 1, 7, 3)).collect();
        let events = run(rows);
        assert!(events
            .labels
            .iter()
            .all(|l| l.get(DetectorId::PublisherConcentration) == Severity::Normal));
    }

    #[test]
    fn test_hour_mode_confirmed() {
        // 1200 clicks, 85% in hour 3, spread over many devices
        let mut rows = Vec::new();
        for i in 0..1020 {
            rows.push(click(i, 1, 100 + i as i64, 3));
        }
        for i in 0..180 {
            rows.push(click(1020 + i, 1, 5000 + i as i64, (i % 24) as u32));
        }
        let events = run(rows);
        assert!(events
            .labels
            .iter()
            .all(|l| l.get(DetectorId::PublisherConcentration) == Severity::Confirmed));
    }

    #[test]
    fn test_device_hammering_suspect() {
        // 1200 clicks over 20 devices: 60 clicks per device on average
        let mut rows = Vec::new();
        for i in 0..1200 {
            rows.push(click(i, 1, 1 + (i as i64 % 20), (i % 24) as u32));
        }
        let events = run(rows);
        assert!(events
            .labels
            .iter()
            .all(|l| l.get(DetectorId::PublisherConcentration) == Severity::Suspect));
    }

    #[test]
    fn test_diverse_publisher_clean() {
        let rows: Vec<ClickEvent> = (0..1500)
            .map(|i| click(i, 1, 1 + i as i64, (i % 24) as u32))
            .collect();
        let events = run(rows);
        assert!(events
            .labels
            .iter()
            .all(|l| l.get(DetectorId::PublisherConcentration) == Severity::Normal));
    }

    #[test]
    fn test_web_address_concentration() {
        // 1100 web clicks from 60 addresses, one address owning 55%
        let mut rows = Vec::new();
        for i in 0..600 {
            let mut e = click(i, 1, 0, (i % 24) as u32);
            e.address = Some("88.1.1.1".to_string());
            rows.push(e);
        }
        for i in 0..500 {
            let mut e = click(600 + i, 1, 0, (i % 24) as u32);
            e.address = Some(format!("88.2.{}.{}", i % 60 / 30, i % 30));
            rows.push(e);
        }
        let events = run(rows);
        assert!(events
            .labels
            .iter()
            .all(|l| l.get(DetectorId::PublisherConcentration) == Severity::Confirmed));
    }
}
