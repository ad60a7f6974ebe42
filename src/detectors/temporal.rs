//! D10: temporal drill-down. Scripted clicks betray themselves in timing:
//! the same second of every minute, metronomic inter-arrival gaps, or
//! conversion latencies with near-zero variance. Stage 1 finds suspicious
//! placements cheaply; stage 2 drills into the actors inside them, where the
//! per-entity sample is large enough to judge individuals.

use std::collections::{HashMap, HashSet};

use chrono::Timelike;
use tracing::info;

use crate::config::TemporalConfig;
use crate::detectors::{median, std_pop};
use crate::error::EngineError;
use crate::fusion::{apply_labels, merge_max};
use crate::identity::IdentityResolver;
use crate::types::{
    ActorKey, DetectorId, EventTable, Settlement, SettlementTable, Severity,
};

const CTIT_CLAMP_SECS: f64 = 6.0 * 3600.0;

/// Share of the most common value.
fn mode_share(values: &[i64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for v in values {
        *counts.entry(*v).or_insert(0) += 1;
    }
    let top = counts.values().copied().max()?;
    Some(top as f64 / values.len() as f64)
}

/// Mode share of inter-arrival gaps with +-1s neighbors merged; gaps of zero
/// and long idle periods are dropped first.
fn iat_mode_share(timestamps: &mut Vec<i64>, max_gap: i64) -> Option<f64> {
    timestamps.sort_unstable();
    let diffs: Vec<i64> = timestamps
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| *d > 0 && *d < max_gap)
        .collect();
    if diffs.is_empty() {
        return None;
    }
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for d in &diffs {
        *counts.entry(*d).or_insert(0) += 1;
    }
    let merged_max = counts
        .keys()
        .map(|d| {
            counts.get(&(d - 1)).copied().unwrap_or(0)
                + counts[d]
                + counts.get(&(d + 1)).copied().unwrap_or(0)
        })
        .max()?;
    Some(merged_max as f64 / diffs.len() as f64)
}

/// Latencies in seconds: millisecond batches are recognized by their median
/// and rescaled, then everything is clamped to a six-hour ceiling.
fn ctit_secs(raw: &[f64]) -> Vec<f64> {
    let finite: Vec<f64> = raw.iter().copied().filter(|v| v.is_finite() && *v >= 0.0).collect();
    let scale = match median(&finite) {
        Some(med) if med > 1000.0 => 1000.0,
        _ => 1.0,
    };
    finite
        .into_iter()
        .map(|v| (v / scale).clamp(0.0, CTIT_CLAMP_SECS))
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Verdict {
    Clean,
    Warn,
    Risk,
}

fn grade(value: f64, warn: f64, risk: f64) -> Verdict {
    if value >= risk {
        Verdict::Risk
    } else if value >= warn {
        Verdict::Warn
    } else {
        Verdict::Clean
    }
}

/// CV is flagged when it is small: uniform latencies are the machine tell.
fn grade_low(value: f64, warn: f64, risk: f64) -> Verdict {
    if value <= risk {
        Verdict::Risk
    } else if value <= warn {
        Verdict::Warn
    } else {
        Verdict::Clean
    }
}

fn timing_verdict(config: &TemporalConfig, seconds: &[i64], timestamps: &mut Vec<i64>) -> Verdict {
    let mut worst = Verdict::Clean;
    if let Some(share) = mode_share(seconds) {
        worst = worst.max(grade(share, config.sec_mode_warn, config.sec_mode_risk));
    }
    if let Some(share) = iat_mode_share(timestamps, config.iat_max_gap_secs) {
        worst = worst.max(grade(share, config.iat_mode_warn, config.iat_mode_risk));
    }
    worst
}

fn ctit_verdict(config: &TemporalConfig, latencies: &[f64]) -> Verdict {
    let secs = ctit_secs(latencies);
    if secs.is_empty() {
        return Verdict::Clean;
    }
    let mut worst = Verdict::Clean;
    let mean = secs.iter().sum::<f64>() / secs.len() as f64;
    if mean > 0.0 {
        if let Some(std) = std_pop(&secs) {
            worst = worst.max(grade_low(std / mean, config.ctit_cv_warn, config.ctit_cv_risk));
        }
    }
    let bins: Vec<i64> = secs.iter().map(|s| s.round() as i64).collect();
    if let Some(share) = mode_share(&bins) {
        worst = worst.max(grade(share, config.ctit_mode_warn, config.ctit_mode_risk));
    }
    worst
}

fn severity_of(v: Verdict) -> Option<Severity> {
    match v {
        Verdict::Risk => Some(Severity::Confirmed),
        Verdict::Warn => Some(Severity::Suspect),
        Verdict::Clean => None,
    }
}

fn entity_of(resolver: &IdentityResolver, device_id: i64, address: Option<&str>) -> Option<ActorKey> {
    if device_id != 0 {
        return Some(ActorKey::Device(device_id));
    }
    let addr = address?;
    (!resolver.is_infrastructure(addr)).then(|| ActorKey::Address(addr.to_string()))
}

fn settlement_entity(resolver: &IdentityResolver, s: &Settlement) -> Option<ActorKey> {
    entity_of(resolver, s.device_id, s.address.as_deref())
}

pub fn apply(
    config: &TemporalConfig,
    resolver: &IdentityResolver,
    events: &mut EventTable,
    settlements: &mut SettlementTable,
) -> Result<usize, EngineError> {
    // stage 1: placement-level timing screen
    #[derive(Default)]
    struct GroupAgg {
        seconds: Vec<i64>,
        timestamps: Vec<i64>,
    }
    let mut groups: HashMap<(i64, i64), GroupAgg> = HashMap::new();
    for e in &events.rows {
        let Some(at) = e.clicked_at else { continue };
        let agg = groups.entry((e.media_id, e.publisher_id)).or_default();
        agg.seconds.push(at.second() as i64);
        agg.timestamps.push(at.timestamp());
    }

    let mut candidates: HashSet<(i64, i64)> = HashSet::new();
    for (key, agg) in groups.iter_mut() {
        if (agg.seconds.len() as u64) < config.min_group_n {
            continue;
        }
        if timing_verdict(config, &agg.seconds, &mut agg.timestamps) != Verdict::Clean {
            candidates.insert(*key);
        }
    }

    // stage 2: entities inside flagged placements
    let mut entity_clicks: HashMap<(i64, i64, ActorKey), GroupAgg> = HashMap::new();
    for e in &events.rows {
        if !candidates.contains(&(e.media_id, e.publisher_id)) {
            continue;
        }
        let (Some(at), Some(entity)) =
            (e.clicked_at, entity_of(resolver, e.device_id, e.address.as_deref()))
        else {
            continue;
        };
        let agg = entity_clicks
            .entry((e.media_id, e.publisher_id, entity))
            .or_default();
        agg.seconds.push(at.second() as i64);
        agg.timestamps.push(at.timestamp());
    }
    let mut entity_latencies: HashMap<(i64, i64, ActorKey), Vec<f64>> = HashMap::new();
    for s in &settlements.rows {
        let (Some(media_id), Some(publisher_id), Some(raw)) =
            (s.media_id, s.publisher_id, s.latency_raw)
        else {
            continue;
        };
        if !candidates.contains(&(media_id, publisher_id)) {
            continue;
        }
        let Some(entity) = settlement_entity(resolver, s) else { continue };
        entity_latencies
            .entry((media_id, publisher_id, entity))
            .or_default()
            .push(raw);
    }

    let mut findings = Vec::new();
    for (key, agg) in entity_clicks.iter_mut() {
        if (agg.seconds.len() as u64) < config.min_entity_n {
            continue;
        }
        let mut verdict = timing_verdict(config, &agg.seconds, &mut agg.timestamps);
        if let Some(latencies) = entity_latencies.get(key) {
            verdict = verdict.max(ctit_verdict(config, latencies));
        }
        if let Some(severity) = severity_of(verdict) {
            findings.push((key.clone(), severity));
        }
    }
    let map = merge_max(findings);

    info!(
        detector = %DetectorId::TemporalDrilldown,
        candidate_placements = candidates.len(),
        flagged_entities = map.len(),
        "detection complete"
    );

    let raised_events = apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::TemporalDrilldown,
        &map,
        |e| {
            let entity = entity_of(resolver, e.device_id, e.address.as_deref())?;
            Some((e.media_id, e.publisher_id, entity))
        },
        EventTable::table_name(),
    )?;
    let raised_settle = apply_labels(
        &settlements.rows,
        &mut settlements.labels,
        DetectorId::TemporalDrilldown,
        &map,
        |s| {
            let entity = settlement_entity(resolver, s)?;
            Some((s.media_id?, s.publisher_id?, entity))
        },
        SettlementTable::table_name(),
    )?;
    Ok(raised_events + raised_settle)
}
