//! D1: excess attempts. An actor hammering one campaign with distinct clicks
//! far beyond what a person produces.

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use tracing::info;

use crate::config::ExcessAttemptsConfig;
use crate::error::EngineError;
use crate::fusion::{apply_labels, merge_max};
use crate::identity::IdentityResolver;
use crate::types::{ActorKey, DetectorId, EventTable, Severity};

pub fn apply(
    config: &ExcessAttemptsConfig,
    resolver: &IdentityResolver,
    events: &mut EventTable,
) -> Result<usize, EngineError> {
    // A suspect cutoff above the confirmed one would invert the tiers.
    let confirmed = config.confirmed_clicks;
    let suspect = config.suspect_clicks.min(confirmed);

    // Optional lookback anchored at the newest click, not wall time, so a
    // re-run over the same batch gives the same answer.
    let cutoff = config.window_days.and_then(|days| {
        let newest = events.rows.iter().filter_map(|e| e.clicked_at).max()?;
        Some(newest - Duration::days(i64::from(days)))
    });

    let mut counts: HashMap<(ActorKey, i64), HashSet<&str>> = HashMap::new();
    for e in &events.rows {
        if let Some(cutoff) = cutoff {
            match e.clicked_at {
                Some(t) if t >= cutoff => {}
                _ => continue,
            }
        }
        let Some(actor) = resolver.actor_for_event(e) else {
            continue;
        };
        counts
            .entry((actor, e.campaign_id))
            .or_default()
            .insert(e.click_key.as_str());
    }

    let verdicts = counts.into_iter().filter_map(|(key, clicks)| {
        let n = clicks.len() as u64;
        let severity = if n >= confirmed {
            Severity::Confirmed
        } else if n >= suspect {
            Severity::Suspect
        } else {
            return None;
        };
        Some((key, severity))
    });
    let map = merge_max(verdicts);
    info!(detector = %DetectorId::ExcessAttempts, flagged_pairs = map.len(), "detection complete");

    apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::ExcessAttempts,
        &map,
        |e| resolver.actor_for_event(e).map(|a| (a, e.campaign_id)),
        EventTable::table_name(),
    )
}
