//! Batch pipeline: detectors, fusion, quota, scoring, partition, in order.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::detectors::{
    concentration, ctit, fan_graph, multi_participation, night, overclick, price_volume, rejoin,
    spike, temporal,
};
use crate::error::EngineError;
use crate::identity::IdentityResolver;
use crate::partition::{self, TablePartition};
use crate::quota::QuotaStats;
use crate::scoring::{self, ScoreReport};
use crate::types::{
    ClickEvent, DetectorId, EventStore, EventTable, ReportRow, ReportTable, Settlement,
    SettlementTable,
};

/// Everything a batch run produces.
#[derive(Debug)]
pub struct EngineOutput {
    pub events: TablePartition<ClickEvent>,
    pub settlements: TablePartition<Settlement>,
    pub reports: TablePartition<ReportRow>,
    pub scores: ScoreReport,
    /// What the fan-graph quota did to its label column
    pub fan_graph_quota: QuotaStats,
    /// Rows raised per detector, across all tables
    pub raised: HashMap<DetectorId, usize>,
}

/// The abuse scoring engine. Construct once, run per batch.
pub struct AbuseEngine {
    config: EngineConfig,
}

impl AbuseEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn run(&self, store: EventStore) -> Result<EngineOutput, EngineError> {
        let cfg = &self.config;
        info!(
            events = store.events.len(),
            settlements = store.settlements.len(),
            reports = store.reports.len(),
            campaigns = store.campaigns.len(),
            "batch started"
        );
        if !store.events.iter().any(|e| e.clicked_at.is_some()) && !store.events.is_empty() {
            warn!("participation table carries no usable timestamps; time-based detectors will be idle");
        }

        let mut events = EventTable::new(store.events);
        let mut settlements = SettlementTable::new(store.settlements);
        let mut reports = ReportTable::new(store.reports);
        let campaigns = store.campaigns;
        let input_counts = (events.len(), settlements.len(), reports.len());

        let resolver = IdentityResolver::audit(&cfg.identity, &events.rows);

        let mut raised = HashMap::new();
        raised.insert(
            DetectorId::ExcessAttempts,
            overclick::apply(&cfg.excess_attempts, &resolver, &mut events)?,
        );
        raised.insert(
            DetectorId::RejoinViolation,
            rejoin::apply(&cfg.rejoin, &resolver, &campaigns, &mut events, &mut settlements)?,
        );
        raised.insert(
            DetectorId::VolumeSpike,
            spike::apply(&cfg.spike, &campaigns, &mut events, &mut reports)?,
        );
        raised.insert(
            DetectorId::NightHours,
            night::apply(&cfg.night, &mut events, &mut settlements, &mut reports)?,
        );
        raised.insert(
            DetectorId::MultiParticipation,
            multi_participation::apply(
                &cfg.multi_participation,
                &resolver,
                &campaigns,
                &mut events,
            )?,
        );
        raised.insert(
            DetectorId::CtitShare,
            ctit::apply(&cfg.ctit, &campaigns, &mut settlements)?,
        );
        raised.insert(
            DetectorId::PriceVolume,
            price_volume::apply(&cfg.price_volume, &mut reports, &mut settlements)?,
        );
        let fan_graph_quota =
            fan_graph::apply(&cfg.fan_graph, &resolver, &mut events, cfg.seed)?;
        raised.insert(
            DetectorId::FanOutFanIn,
            fan_graph_quota.confirmed + fan_graph_quota.suspect_kept,
        );
        raised.insert(
            DetectorId::PublisherConcentration,
            concentration::apply(&cfg.concentration, &resolver, &mut events)?,
        );
        raised.insert(
            DetectorId::TemporalDrilldown,
            temporal::apply(&cfg.temporal, &resolver, &mut events, &mut settlements)?,
        );

        // label columns may only ever have been written in place
        for (name, before, after) in [
            (EventTable::table_name(), input_counts.0, events.len()),
            (
                SettlementTable::table_name(),
                input_counts.1,
                settlements.len(),
            ),
            (ReportTable::table_name(), input_counts.2, reports.len()),
        ] {
            if before != after {
                return Err(EngineError::RowCountViolation {
                    stage: name,
                    before,
                    after,
                });
            }
        }
        events.check_aligned("post-detection")?;
        settlements.check_aligned("post-detection")?;
        reports.check_aligned("post-detection")?;

        let scores = scoring::score(&cfg.scoring, &resolver, &events, cfg.seed);

        let events = partition::split_events(events)?;
        let settlements = partition::split_settlements(settlements)?;
        let reports = partition::split_reports(reports)?;

        info!(
            abuse_events = events.abuse.len(),
            abuse_settlements = settlements.abuse.len(),
            abuse_reports = reports.abuse.len(),
            "batch complete"
        );
        Ok(EngineOutput {
            events,
            settlements,
            reports,
            scores,
            fan_graph_quota,
            raised,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn store_with_overclicker() -> EventStore {
        let mut events = Vec::new();
        for i in 0..60 {
            events.push(ClickEvent {
                click_key: format!("hot-{}", i),
                campaign_id: 1,
                media_id: 1,
                publisher_id: 1,
                device_id: 42,
                address: None,
                clicked_at: Utc.with_ymd_and_hms(2025, 8, 10, 12, 0, 0).latest(),
            });
        }
        for i in 0..40 {
            events.push(ClickEvent {
                click_key: format!("ok-{}", i),
                campaign_id: 1,
                media_id: 1,
                publisher_id: 1,
                device_id: 100 + i,
                address: None,
                clicked_at: Utc.with_ymd_and_hms(2025, 8, 10, 13, 0, 0).latest(),
            });
        }
        EventStore {
            events,
            ..EventStore::default()
        }
    }

    #[test]
    fn test_end_to_end_partitions_and_scores() {
        let engine = AbuseEngine::new(EngineConfig::default());
        let out = engine.run(store_with_overclicker()).unwrap();

        assert_eq!(out.events.total(), 100);
        assert_eq!(out.events.abuse.len(), 60);
        assert!(out
            .events
            .abuse
            .iter()
            .all(|e| e.device_id == 42));
        assert_eq!(out.raised[&DetectorId::ExcessAttempts], 60);
        assert!(!out.scores.media.is_empty());
        assert!(out.scores.contamination[&1] > 0.5);
    }

    #[test]
    fn test_empty_store_is_fine() {
        let engine = AbuseEngine::new(EngineConfig::default());
        let out = engine.run(EventStore::default()).unwrap();
        assert_eq!(out.events.total(), 0);
        assert_eq!(out.settlements.total(), 0);
        assert_eq!(out.reports.total(), 0);
        assert!(out.scores.overall.is_empty());
    }

    #[test]
    fn test_deterministic_across_runs() {
        let engine = AbuseEngine::new(EngineConfig::default());
        let a = engine.run(store_with_overclicker()).unwrap();
        let b = engine.run(store_with_overclicker()).unwrap();
        assert_eq!(a.events.abuse.len(), b.events.abuse.len());
        assert_eq!(a.scores.media[0].score, b.scores.media[0].score);
    }
}
