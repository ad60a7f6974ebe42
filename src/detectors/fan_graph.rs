//! D8: fan-out / fan-in graph. Addresses that touch implausibly many devices
//! (fan-out) and devices that hop across many addresses (fan-in), scored
//! against the population of their peers. The two sides are combined per row;
//! with the default config a row is only Confirmed when both sides are, so
//! single-sided evidence caps at Suspect even when the address side is off.
//!
//! The population z-scores make this detector noisy on small batches, so it
//! carries its own flagged-row quota.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::config::{FanGraphConfig, FanGraphMode};
use crate::error::EngineError;
use crate::identity::IdentityResolver;
use crate::quota::{self, QuotaStats};
use crate::types::{ClickEvent, DetectorId, EventTable, Severity};

const BURST_BUCKET_SECS: i64 = 300;
const OVERLAP_BUCKET_SECS: i64 = 600;
const OVERLAP_MIN_WINDOWS: usize = 50;

#[derive(Default)]
struct AddressAgg {
    devices: HashSet<i64>,
    device_days: HashMap<i64, HashSet<i32>>,
    burst_buckets: HashMap<i64, HashSet<i64>>,
    overlap_windows: HashMap<(i64, i64), HashSet<i64>>,
    days: HashSet<i32>,
}

#[derive(Default)]
struct DeviceAgg {
    addresses: HashSet<String>,
    hour_addresses: HashMap<i64, HashSet<String>>,
    daily_actions: HashMap<i32, u64>,
    days: HashSet<i32>,
}

struct SideVerdict {
    severity: Severity,
    score: f64,
}

fn zscore(value: f64, mean: f64, std: f64, gate: f64) -> f64 {
    if std <= 0.0 {
        return 0.0;
    }
    ((value - mean) / std).clamp(-gate, gate)
}

fn severity_from(config: &FanGraphConfig, hits: usize, score: f64) -> Severity {
    if hits >= config.confirmed_hits || score >= config.confirmed_score {
        Severity::Confirmed
    } else if hits >= config.suspect_hits || score >= config.suspect_score {
        Severity::Suspect
    } else {
        Severity::Normal
    }
}

fn address_side(
    config: &FanGraphConfig,
    aggs: &HashMap<String, AddressAgg>,
) -> HashMap<String, SideVerdict> {
    use crate::detectors::quantile;

    let fanouts: Vec<f64> = aggs.values().map(|a| a.devices.len() as f64).collect();
    let mean = fanouts.iter().sum::<f64>() / fanouts.len().max(1) as f64;
    let std = crate::detectors::std_pop(&fanouts).unwrap_or(0.0);

    let bursts: Vec<f64> = aggs
        .values()
        .map(|a| {
            let sizes: Vec<f64> = a.burst_buckets.values().map(|d| d.len() as f64).collect();
            quantile(&sizes, 0.95).unwrap_or(0.0)
        })
        .collect();
    let burst_q999 = quantile(&bursts, 0.999).unwrap_or(f64::MAX);

    let overlaps: Vec<f64> = aggs
        .values()
        .map(|a| {
            let total = a.overlap_windows.len();
            if total == 0 {
                return 0.0;
            }
            let multi = a
                .overlap_windows
                .values()
                .filter(|d| d.len() >= 2)
                .count();
            multi as f64 / total as f64
        })
        .collect();
    let overlap_q99 = quantile(&overlaps, 0.99).unwrap_or(f64::MAX);

    let mut out = HashMap::new();
    for ((addr, agg), (burst, overlap_rate)) in
        aggs.iter().zip(bursts.iter().zip(overlaps.iter()))
    {
        let fanout = agg.devices.len() as f64;
        let z = zscore(fanout, mean, std, config.z_gate);
        let repeat_rate = if agg.devices.is_empty() {
            0.0
        } else {
            agg.device_days.values().map(|d| d.len() as f64).sum::<f64>()
                / agg.devices.len() as f64
        };
        let burst_hit = *burst >= burst_q999 && *burst > 0.0;
        let overlap_hit =
            *overlap_rate >= overlap_q99 && agg.overlap_windows.len() >= OVERLAP_MIN_WINDOWS;
        let z_hit = z >= 2.0;

        let mut score = 3.0 * z;
        if burst_hit {
            score += 2.0;
        }
        if overlap_hit {
            score += 1.5;
        }
        // long-lived addresses with stable small device sets are households
        if repeat_rate > 0.0 && repeat_rate <= 1.1 {
            score -= 2.0;
        }
        if agg.days.len() >= 7 && agg.devices.len() <= 3 {
            score -= 1.5;
        }

        let hits = z_hit as usize + burst_hit as usize + overlap_hit as usize;
        out.insert(
            addr.clone(),
            SideVerdict {
                severity: severity_from(config, hits, score),
                score,
            },
        );
    }
    out
}

fn device_side(
    config: &FanGraphConfig,
    aggs: &HashMap<i64, DeviceAgg>,
) -> HashMap<i64, SideVerdict> {
    use crate::detectors::quantile;

    let fanins: Vec<f64> = aggs.values().map(|a| a.addresses.len() as f64).collect();
    let mean = fanins.iter().sum::<f64>() / fanins.len().max(1) as f64;
    let std = crate::detectors::std_pop(&fanins).unwrap_or(0.0);

    let speeds: Vec<f64> = aggs
        .values()
        .map(|a| {
            let per_hour: Vec<f64> = a.hour_addresses.values().map(|s| s.len() as f64).collect();
            quantile(&per_hour, 0.99).unwrap_or(0.0)
        })
        .collect();
    let speed_q999 = quantile(&speeds, 0.999).unwrap_or(f64::MAX);

    let dailies: Vec<f64> = aggs
        .values()
        .map(|a| {
            let per_day: Vec<f64> = a.daily_actions.values().map(|n| *n as f64).collect();
            quantile(&per_day, 0.95).unwrap_or(0.0)
        })
        .collect();
    let daily_q99 = quantile(&dailies, 0.99).unwrap_or(f64::MAX);

    let mut out = HashMap::new();
    for ((device, agg), (speed, daily)) in aggs.iter().zip(speeds.iter().zip(dailies.iter())) {
        let fanin = agg.addresses.len() as f64;
        let z = zscore(fanin, mean, std, config.z_gate);
        let speed_hit = *speed >= speed_q999 && *speed > 1.0;
        let z_hit = z >= 2.0;

        let mut score = 3.0 * z;
        if speed_hit {
            score += 1.0;
        }
        if *daily <= daily_q99 {
            score -= 1.0;
        }
        if agg.days.len() >= 7 {
            score -= 0.8;
        }

        let hits = z_hit as usize + speed_hit as usize;
        out.insert(
            *device,
            SideVerdict {
                severity: severity_from(config, hits, score),
                score,
            },
        );
    }
    out
}

fn usable_address<'a>(resolver: &IdentityResolver, e: &'a ClickEvent) -> Option<&'a str> {
    let addr = e.address.as_deref()?;
    (!resolver.is_infrastructure(addr)).then_some(addr)
}

pub fn apply(
    config: &FanGraphConfig,
    resolver: &IdentityResolver,
    events: &mut EventTable,
    seed: u64,
) -> Result<QuotaStats, EngineError> {
    events.check_aligned("fan_graph")?;

    let use_addresses = match config.mode {
        FanGraphMode::ForceAddress => true,
        FanGraphMode::ForceDevice => false,
        FanGraphMode::Auto => resolver.reliable_share() >= config.reliable_share,
    };
    debug!(
        detector = %DetectorId::FanOutFanIn,
        use_addresses,
        reliable_share = resolver.reliable_share(),
        "graph side selection"
    );

    let mut addr_aggs: HashMap<String, AddressAgg> = HashMap::new();
    let mut dev_aggs: HashMap<i64, DeviceAgg> = HashMap::new();
    for e in &events.rows {
        if e.device_id == 0 {
            continue;
        }
        let Some(at) = e.clicked_at else { continue };
        let day = crate::detectors::day_key(at.date_naive());
        let ts = at.timestamp();

        let dev = dev_aggs.entry(e.device_id).or_default();
        *dev.daily_actions.entry(day).or_insert(0) += 1;
        dev.days.insert(day);

        if let Some(addr) = usable_address(resolver, e) {
            dev.addresses.insert(addr.to_string());
            dev.hour_addresses
                .entry(ts.div_euclid(3600))
                .or_default()
                .insert(addr.to_string());

            if use_addresses {
                let agg = addr_aggs.entry(addr.to_string()).or_default();
                agg.devices.insert(e.device_id);
                agg.device_days.entry(e.device_id).or_default().insert(day);
                agg.burst_buckets
                    .entry(ts.div_euclid(BURST_BUCKET_SECS))
                    .or_default()
                    .insert(e.device_id);
                agg.overlap_windows
                    .entry((e.campaign_id, ts.div_euclid(OVERLAP_BUCKET_SECS)))
                    .or_default()
                    .insert(e.device_id);
                agg.days.insert(day);
            }
        }
    }

    let addr_verdicts = if use_addresses {
        address_side(config, &addr_aggs)
    } else {
        HashMap::new()
    };
    let dev_verdicts = device_side(config, &dev_aggs);

    // combine both sides per row and record quota priorities
    let mut priorities = vec![0.0f64; events.rows.len()];
    let mut flagged = 0usize;
    for (i, (e, label)) in events.rows.iter().zip(events.labels.iter_mut()).enumerate() {
        let a = usable_address(resolver, e)
            .and_then(|addr| addr_verdicts.get(addr))
            .map(|v| v.severity)
            .unwrap_or(Severity::Normal);
        let d = if e.device_id != 0 {
            dev_verdicts
                .get(&e.device_id)
                .map(|v| v.severity)
                .unwrap_or(Severity::Normal)
        } else {
            Severity::Normal
        };

        let severity = if config.require_both_confirmed {
            if a == Severity::Confirmed && d == Severity::Confirmed {
                Severity::Confirmed
            } else if a.is_flagged() || d.is_flagged() {
                Severity::Suspect
            } else {
                Severity::Normal
            }
        } else {
            a.max(d)
        };
        if severity.is_flagged() {
            label.set_max(DetectorId::FanOutFanIn, severity);
            flagged += 1;
        }
        priorities[i] = config.address_weight * a.as_u8() as f64
            + config.device_weight * d.as_u8() as f64;
    }

    info!(
        detector = %DetectorId::FanOutFanIn,
        addresses = addr_verdicts.len(),
        devices = dev_verdicts.len(),
        flagged,
        "detection complete"
    );

    quota::enforce(
        &mut events.labels,
        DetectorId::FanOutFanIn,
        &priorities,
        &config.quota,
        seed,
        EventTable::table_name(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use chrono::{TimeZone, Utc};

    fn click(key: &str, device_id: i64, addr: &str, minute: u32) -> ClickEvent {
        ClickEvent {
            click_key: key.to_string(),
            campaign_id: 1,
            media_id: 1,
            publisher_id: 1,
            device_id,
            address: Some(addr.to_string()),
            clicked_at: Utc
                .with_ymd_and_hms(2025, 8, 10, 10 + minute / 60, minute % 60, 0)
                .latest(),
        }
    }

    /// Population of normal users (one device, one address) plus one address
    /// fanning out over many devices in a tight burst.
    fn batch_with_fanout_farm() -> Vec<ClickEvent> {
        let mut rows = Vec::new();
        for i in 0..200i64 {
            rows.push(click(
                &format!("n{}", i),
                1000 + i,
                &format!("20.1.{}.{}", i / 200, i % 200),
                (i % 50) as u32,
            ));
        }
        for i in 0..40i64 {
            rows.push(click(&format!("f{}", i), 2000 + i, "99.9.9.9", (i % 5) as u32));
        }
        rows
    }

    fn config_force_address() -> FanGraphConfig {
        FanGraphConfig {
            mode: FanGraphMode::ForceAddress,
            quota: crate::config::QuotaConfig {
                ceiling: None,
                min_suspect_share: 0.2,
            },
            ..FanGraphConfig::default()
        }
    }

    #[test]
    fn test_fanout_address_flagged() {
        let rows = batch_with_fanout_farm();
        let resolver = IdentityResolver::audit(&IdentityConfig::default(), &rows);
        let mut events = EventTable::new(rows);
        apply(&config_force_address(), &resolver, &mut events, 1).unwrap();

        let farm_flagged = events
            .rows
            .iter()
            .zip(&events.labels)
            .filter(|(e, _)| e.address.as_deref() == Some("99.9.9.9"))
            .all(|(_, l)| l.get(DetectorId::FanOutFanIn).is_flagged());
        assert!(farm_flagged);

        let normals_clean = events
            .rows
            .iter()
            .zip(&events.labels)
            .filter(|(e, _)| e.address.as_deref() != Some("99.9.9.9"))
            .all(|(_, l)| l.get(DetectorId::FanOutFanIn) == Severity::Normal);
        assert!(normals_clean);
    }

    #[test]
    fn test_confirmed_needs_both_sides() {
        // the farm address fans out, but each farm device touches one address
        // so the device side stays Normal: rows cap at Suspect
        let rows = batch_with_fanout_farm();
        let resolver = IdentityResolver::audit(&IdentityConfig::default(), &rows);
        let mut events = EventTable::new(rows);
        apply(&config_force_address(), &resolver, &mut events, 1).unwrap();

        assert!(events
            .labels
            .iter()
            .all(|l| l.get(DetectorId::FanOutFanIn) != Severity::Confirmed));
    }

    #[test]
    fn test_force_device_ignores_addresses() {
        let rows = batch_with_fanout_farm();
        let resolver = IdentityResolver::audit(&IdentityConfig::default(), &rows);
        let mut events = EventTable::new(rows);
        let config = FanGraphConfig {
            mode: FanGraphMode::ForceDevice,
            ..config_force_address()
        };
        apply(&config, &resolver, &mut events, 1).unwrap();

        // no device hops addresses in this batch
        assert!(events
            .labels
            .iter()
            .all(|l| l.get(DetectorId::FanOutFanIn) == Severity::Normal));
    }

    #[test]
    fn test_single_side_caps_at_suspect() {
        // one device hops across 30 addresses while the population stays on
        // one each; the device side confirms it, but with addresses disabled
        // there is no corroborating side and rows stop at Suspect
        let mut rows = Vec::new();
        for i in 0..200i64 {
            rows.push(click(
                &format!("n{}", i),
                1000 + i,
                &format!("20.1.{}.{}", i / 200, i % 200),
                (i % 50) as u32,
            ));
        }
        for i in 0..30i64 {
            rows.push(click(&format!("h{}", i), 5000, &format!("77.7.7.{}", i), i as u32));
        }
        let resolver = IdentityResolver::audit(&IdentityConfig::default(), &rows);
        let mut events = EventTable::new(rows);
        let config = FanGraphConfig {
            mode: FanGraphMode::ForceDevice,
            ..config_force_address()
        };
        apply(&config, &resolver, &mut events, 1).unwrap();

        let hopper_labels: Vec<Severity> = events
            .rows
            .iter()
            .zip(&events.labels)
            .filter(|(e, _)| e.device_id == 5000)
            .map(|(_, l)| l.get(DetectorId::FanOutFanIn))
            .collect();
        assert_eq!(hopper_labels.len(), 30);
        assert!(hopper_labels.iter().all(|s| *s == Severity::Suspect));
    }

    #[test]
    fn test_quota_caps_flagged_rows() {
        let rows = batch_with_fanout_farm();
        let resolver = IdentityResolver::audit(&IdentityConfig::default(), &rows);
        let mut events = EventTable::new(rows);
        let config = FanGraphConfig {
            quota: crate::config::QuotaConfig {
                ceiling: Some(0.05),
                min_suspect_share: 0.2,
            },
            ..config_force_address()
        };
        let stats = apply(&config, &resolver, &mut events, 1).unwrap();
        let n = events.len();
        assert!(stats.flagged_rate() <= 0.05 + 1e-9, "rate {}", stats.flagged_rate());
        assert_eq!(events.len(), n);
    }
}
