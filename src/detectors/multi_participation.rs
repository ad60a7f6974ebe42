//! D5: multi-participation. One actor hitting many campaigns inside a short
//! window is reward-farm behavior. Evaluation runs over bounded chunks of
//! days with a small overlap so windows spanning a chunk boundary are still
//! seen; duplicate verdicts from the overlap collapse in the MAX-merge.
//!
//! A publisher-day roll-up sits on top: placements whose traffic contains
//! many flagged windows get their own label.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::config::{DetectionLevel, MultiParticipationConfig};
use crate::detectors::day_key;
use crate::error::EngineError;
use crate::fusion::{apply_labels, merge_max};
use crate::identity::IdentityResolver;
use crate::types::{ActorKey, Campaign, DetectorId, EventTable, Severity};

const CHUNK_OVERLAP_MINUTES: i64 = 10;

/// Signal margins and vote counts per sensitivity preset.
struct ActorPreset {
    suspect_signals: usize,
    confirmed_signals: usize,
    campaign_margin: u64,
    install_margin: u64,
    repeat_min: u64,
}

struct PublisherPreset {
    suspect_signals: usize,
    confirmed_signals: usize,
    suspect_mult: f64,
    confirmed_mult: f64,
}

fn actor_preset(level: DetectionLevel) -> ActorPreset {
    match level {
        DetectionLevel::Loose => ActorPreset {
            suspect_signals: 1,
            confirmed_signals: 2,
            campaign_margin: 1,
            install_margin: 0,
            repeat_min: 2,
        },
        DetectionLevel::Normal => ActorPreset {
            suspect_signals: 1,
            confirmed_signals: 2,
            campaign_margin: 2,
            install_margin: 1,
            repeat_min: 3,
        },
        DetectionLevel::Strict => ActorPreset {
            suspect_signals: 2,
            confirmed_signals: 3,
            campaign_margin: 3,
            install_margin: 2,
            repeat_min: 4,
        },
    }
}

fn publisher_preset(level: DetectionLevel) -> PublisherPreset {
    match level {
        DetectionLevel::Loose => PublisherPreset {
            suspect_signals: 1,
            confirmed_signals: 2,
            suspect_mult: 0.8,
            confirmed_mult: 1.5,
        },
        DetectionLevel::Normal => PublisherPreset {
            suspect_signals: 1,
            confirmed_signals: 2,
            suspect_mult: 1.0,
            confirmed_mult: 2.0,
        },
        DetectionLevel::Strict => PublisherPreset {
            suspect_signals: 2,
            confirmed_signals: 3,
            suspect_mult: 1.2,
            confirmed_mult: 2.5,
        },
    }
}

#[derive(Clone, Copy)]
struct Click {
    row: usize,
    at: DateTime<Utc>,
    campaign_id: i64,
    media_id: i64,
    publisher_id: i64,
    is_install_type: bool,
}

/// One qualifying window for an actor.
struct Window {
    start: DateTime<Utc>,
    campaigns: u64,
    installs: u64,
    publisher_id: i64,
    media_id: i64,
}

fn candidate_windows(clicks: &[Click], config: &MultiParticipationConfig) -> Vec<Window> {
    let span = Duration::minutes(config.window_minutes);
    let mut out = Vec::new();
    let mut j = 0usize;
    for i in 0..clicks.len() {
        if j < i {
            j = i;
        }
        while j + 1 < clicks.len() && clicks[j + 1].at - clicks[i].at <= span {
            j += 1;
        }
        let window = &clicks[i..=j];
        let campaigns = window
            .iter()
            .map(|c| c.campaign_id)
            .collect::<HashSet<_>>()
            .len() as u64;
        let installs = window.iter().filter(|c| c.is_install_type).count() as u64;
        if campaigns >= config.min_campaigns && installs >= config.min_installs {
            out.push(Window {
                start: clicks[i].at,
                campaigns,
                installs,
                publisher_id: clicks[i].publisher_id,
                media_id: clicks[i].media_id,
            });
        }
    }
    out
}

#[derive(Default)]
struct PubDayAgg {
    flagged_windows: u64,
    flagged_actors: HashSet<ActorKey>,
    active_actors: HashSet<ActorKey>,
}

pub fn apply(
    config: &MultiParticipationConfig,
    resolver: &IdentityResolver,
    campaigns: &[Campaign],
    events: &mut EventTable,
) -> Result<usize, EngineError> {
    let install_campaigns: HashSet<i64> = campaigns
        .iter()
        .filter(|c| config.install_types.contains(&c.campaign_type))
        .map(|c| c.campaign_id)
        .collect();

    let mut clicks: Vec<(ActorKey, Click)> = Vec::new();
    for (row, e) in events.rows.iter().enumerate() {
        let (Some(at), Some(actor)) = (e.clicked_at, resolver.actor_for_event(e)) else {
            continue;
        };
        clicks.push((
            actor,
            Click {
                row,
                at,
                campaign_id: e.campaign_id,
                media_id: e.media_id,
                publisher_id: e.publisher_id,
                is_install_type: install_campaigns.contains(&e.campaign_id),
            },
        ));
    }
    if clicks.is_empty() {
        return Ok(0);
    }
    clicks.sort_by_key(|(_, c)| c.at);

    let preset = actor_preset(config.level);
    let min_rows = config.min_actor_rows.max(config.min_campaigns as usize);
    let overlap = Duration::minutes(CHUNK_OVERLAP_MINUTES);
    let chunk_span = Duration::days(config.chunk_days);
    let first = clicks[0].1.at;
    let last = clicks[clicks.len() - 1].1.at;

    let mut actor_day: Vec<((ActorKey, i32), Severity)> = Vec::new();
    let mut pub_day: HashMap<(i64, i64, i32), PubDayAgg> = HashMap::new();

    let mut chunk_start = first;
    while chunk_start <= last {
        let chunk_end = chunk_start + chunk_span;
        // overlap pulls in the tail of the previous chunk so boundary
        // windows are evaluated whole
        let lo = chunk_start - overlap;

        let mut per_actor: HashMap<&ActorKey, Vec<Click>> = HashMap::new();
        for (actor, c) in &clicks {
            if c.at >= lo && c.at < chunk_end {
                per_actor.entry(actor).or_default().push(*c);
            }
        }

        for (actor, actor_clicks) in per_actor {
            if actor_clicks.len() < min_rows {
                continue;
            }
            for c in &actor_clicks {
                pub_day
                    .entry((c.publisher_id, c.media_id, day_key(c.at.date_naive())))
                    .or_default()
                    .active_actors
                    .insert(actor.clone());
            }

            let windows = candidate_windows(&actor_clicks, config);
            if windows.is_empty() {
                continue;
            }

            let max_campaigns = windows.iter().map(|w| w.campaigns).max().unwrap_or(0);
            let max_installs = windows.iter().map(|w| w.installs).max().unwrap_or(0);
            let mut per_day: HashMap<i32, u64> = HashMap::new();
            for w in &windows {
                *per_day.entry(day_key(w.start.date_naive())).or_insert(0) += 1;
            }
            let max_repeats = per_day.values().copied().max().unwrap_or(0);

            let mut signals = 0usize;
            if max_campaigns >= config.min_campaigns + preset.campaign_margin {
                signals += 1;
            }
            if max_installs >= config.min_installs + preset.install_margin {
                signals += 1;
            }
            if max_repeats >= preset.repeat_min {
                signals += 1;
            }

            let severity = if signals >= preset.confirmed_signals {
                Some(Severity::Confirmed)
            } else if signals >= preset.suspect_signals {
                Some(Severity::Suspect)
            } else {
                None
            };

            if let Some(severity) = severity {
                for day in per_day.keys() {
                    actor_day.push(((actor.clone(), *day), severity));
                }
                for w in &windows {
                    let agg = pub_day
                        .entry((w.publisher_id, w.media_id, day_key(w.start.date_naive())))
                        .or_default();
                    agg.flagged_windows += 1;
                    agg.flagged_actors.insert(actor.clone());
                }
            }
        }
        chunk_start = chunk_end;
    }

    let actor_map = merge_max(actor_day);

    let pub_preset = publisher_preset(config.level);
    let mut pub_findings = Vec::new();
    for (key, agg) in &pub_day {
        let actors = agg.active_actors.len().max(1) as f64;
        let ratio = agg.flagged_actors.len() as f64 / actors;
        let windows = agg.flagged_windows as f64;
        let flagged_actors = agg.flagged_actors.len() as f64;

        // anything at a base threshold makes this pub-day a candidate
        if windows < config.pub_min_windows as f64
            && flagged_actors < config.pub_min_actors as f64
            && ratio < config.pub_flag_ratio
        {
            continue;
        }
        let signals_at = |mult: f64| -> usize {
            let mut n = 0;
            if windows >= config.pub_min_windows as f64 * mult {
                n += 1;
            }
            if flagged_actors >= config.pub_min_actors as f64 * mult {
                n += 1;
            }
            if ratio >= config.pub_flag_ratio * mult {
                n += 1;
            }
            n
        };
        let severity = if signals_at(pub_preset.confirmed_mult) >= pub_preset.confirmed_signals {
            Severity::Confirmed
        } else if signals_at(pub_preset.suspect_mult) >= pub_preset.suspect_signals {
            Severity::Suspect
        } else {
            continue;
        };
        pub_findings.push((*key, severity));
    }
    let pub_map = merge_max(pub_findings);

    info!(
        detector = %DetectorId::MultiParticipation,
        actor_days = actor_map.len(),
        publisher_days = pub_map.len(),
        "detection complete"
    );

    let raised_actor = apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::MultiParticipation,
        &actor_map,
        |e| {
            let actor = resolver.actor_for_event(e)?;
            Some((actor, day_key(e.day()?)))
        },
        EventTable::table_name(),
    )?;
    let raised_pub = apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::MultiParticipation,
        &pub_map,
        |e| Some((e.publisher_id, e.media_id, day_key(e.day()?))),
        EventTable::table_name(),
    )?;
    Ok(raised_actor + raised_pub)
}
