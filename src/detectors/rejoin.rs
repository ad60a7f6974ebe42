//! D2: rejoin-policy violation. An actor settling the same campaign more
//! often than its rejoin policy allows is definitionally abusive, so every
//! verdict here is Confirmed.

use std::collections::HashMap;

use tracing::info;

use crate::config::RejoinConfig;
use crate::detectors::day_key;
use crate::error::EngineError;
use crate::fusion::{apply_labels, merge_max};
use crate::identity::IdentityResolver;
use crate::types::{
    ActorKey, Campaign, DetectorId, EventTable, RejoinPolicy, Settlement, SettlementTable,
    Severity,
};

#[derive(PartialEq, Eq, Hash, Clone)]
enum Key {
    Ever(ActorKey, i64),
    Daily(ActorKey, i64, i32),
}

fn key_for(
    policies: &HashMap<i64, RejoinPolicy>,
    resolver: &IdentityResolver,
    s: &Settlement,
) -> Option<Key> {
    let actor = resolver.actor_for_settlement(s)?;
    match policies.get(&s.campaign_id).copied().unwrap_or_default() {
        RejoinPolicy::None => Some(Key::Ever(actor, s.campaign_id)),
        RejoinPolicy::DailyUnique => Some(Key::Daily(actor, s.campaign_id, day_key(s.day()?))),
        RejoinPolicy::Unlimited => None,
    }
}

pub fn apply(
    config: &RejoinConfig,
    resolver: &IdentityResolver,
    campaigns: &[Campaign],
    events: &mut EventTable,
    settlements: &mut SettlementTable,
) -> Result<usize, EngineError> {
    let policies: HashMap<i64, RejoinPolicy> = campaigns
        .iter()
        .map(|c| (c.campaign_id, c.rejoin_policy))
        .collect();

    let mut counts: HashMap<Key, u64> = HashMap::new();
    for s in &settlements.rows {
        if let Some(key) = key_for(&policies, resolver, s) {
            *counts.entry(key).or_insert(0) += 1;
        }
    }

    let map = merge_max(
        counts
            .into_iter()
            .filter(|(_, n)| *n >= config.min_repeats)
            .map(|(key, _)| (key, Severity::Confirmed)),
    );
    info!(detector = %DetectorId::RejoinViolation, violations = map.len(), "detection complete");

    let raised_settle = apply_labels(
        &settlements.rows,
        &mut settlements.labels,
        DetectorId::RejoinViolation,
        &map,
        |s| key_for(&policies, resolver, s),
        SettlementTable::table_name(),
    )?;

    // Click rows of the violating actor x campaign (x day) inherit the label.
    let raised_events = apply_labels(
        &events.rows,
        &mut events.labels,
        DetectorId::RejoinViolation,
        &map,
        |e| {
            let actor = resolver.actor_for_event(e)?;
            match policies.get(&e.campaign_id).copied().unwrap_or_default() {
                RejoinPolicy::None => Some(Key::Ever(actor, e.campaign_id)),
                RejoinPolicy::DailyUnique => {
                    Some(Key::Daily(actor, e.campaign_id, day_key(e.day()?)))
                }
                RejoinPolicy::Unlimited => None,
            }
        },
        EventTable::table_name(),
    )?;

    Ok(raised_settle + raised_events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use chrono::{TimeZone, Utc};

    fn campaign(id: i64, policy: RejoinPolicy) -> Campaign {
        Campaign {
            campaign_id: id,
            rejoin_policy: policy,
            campaign_type: 1,
            category: 0,
            started_at: None,
            ended_at: None,
        }
    }

    fn settlement(device_id: i64, campaign_id: i64, day: u32, key: &str) -> Settlement {
        Settlement {
            click_key: key.to_string(),
            campaign_id,
            media_id: Some(1),
            publisher_id: Some(1),
            device_id,
            address: None,
            occurred_at: Utc.with_ymd_and_hms(2025, 8, day, 10, 0, 0).latest(),
            latency_raw: None,
            cost: None,
        }
    }

    fn run(
        campaigns: Vec<Campaign>,
        settlements: Vec<Settlement>,
    ) -> (EventTable, SettlementTable) {
        let resolver = IdentityResolver::audit(&IdentityConfig::default(), &[]);
        let mut events = EventTable::new(vec![]);
        let mut table = SettlementTable::new(settlements);
        apply(
            &RejoinConfig::default(),
            &resolver,
            &campaigns,
            &mut events,
            &mut table,
        )
        .unwrap();
        (events, table)
    }

    #[test]
    fn test_no_rejoin_policy_flags_second_settlement() {
        let (_, table) = run(
            vec![campaign(1, RejoinPolicy::None)],
            vec![
                settlement(5, 1, 10, "a"),
                settlement(5, 1, 12, "b"),
                settlement(6, 1, 10, "c"),
            ],
        );
        assert_eq!(
            table.labels[0].get(DetectorId::RejoinViolation),
            Severity::Confirmed
        );
        assert_eq!(
            table.labels[1].get(DetectorId::RejoinViolation),
            Severity::Confirmed
        );
        assert_eq!(
            table.labels[2].get(DetectorId::RejoinViolation),
            Severity::Normal
        );
    }

    #[test]
    fn test_daily_unique_allows_different_days() {
        let (_, table) = run(
            vec![campaign(1, RejoinPolicy::DailyUnique)],
            vec![
                settlement(5, 1, 10, "a"),
                settlement(5, 1, 11, "b"),
                settlement(5, 1, 11, "c"),
            ],
        );
        assert_eq!(
            table.labels[0].get(DetectorId::RejoinViolation),
            Severity::Normal
        );
        assert_eq!(
            table.labels[1].get(DetectorId::RejoinViolation),
            Severity::Confirmed
        );
        assert_eq!(
            table.labels[2].get(DetectorId::RejoinViolation),
            Severity::Confirmed
        );
    }

    #[test]
    fn test_unlimited_and_unknown_campaigns_never_flag() {
        let (_, table) = run(
            vec![campaign(1, RejoinPolicy::Unlimited)],
            vec![
                settlement(5, 1, 10, "a"),
                settlement(5, 1, 10, "b"),
                // campaign 2 has no metadata; default policy is unlimited
                settlement(5, 2, 10, "c"),
                settlement(5, 2, 10, "d"),
            ],
        );
        assert!(table
            .labels
            .iter()
            .all(|l| l.get(DetectorId::RejoinViolation) == Severity::Normal));
    }

    #[test]
    fn test_event_rows_inherit_violation() {
        let resolver = IdentityResolver::audit(&IdentityConfig::default(), &[]);
        let campaigns = vec![campaign(1, RejoinPolicy::None)];
        let mut settlements =
            SettlementTable::new(vec![settlement(5, 1, 10, "a"), settlement(5, 1, 12, "b")]);
        let mut events = EventTable::new(vec![crate::types::ClickEvent {
            click_key: "a".to_string(),
            campaign_id: 1,
            media_id: 1,
            publisher_id: 1,
            device_id: 5,
            address: None,
            clicked_at: None,
        }]);
        apply(
            &RejoinConfig::default(),
            &resolver,
            &campaigns,
            &mut events,
            &mut settlements,
        )
        .unwrap();
        assert_eq!(
            events.labels[0].get(DetectorId::RejoinViolation),
            Severity::Confirmed
        );
    }
}
