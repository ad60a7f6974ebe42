//! Clean/abuse partitioning
//!
//! The final step splits each labeled table into a clean partition and an
//! abuse partition using only the detectors that apply to that table. The two
//! partitions must account for every input row; anything else is an integrity
//! failure.

use tracing::info;

use crate::error::EngineError;
use crate::types::{
    DetectorId, EventTable, LabelVector, ReportTable, SettlementTable,
};

/// Detectors whose labels count toward the participation-table split.
pub const EVENT_DETECTORS: [DetectorId; 8] = [
    DetectorId::ExcessAttempts,
    DetectorId::RejoinViolation,
    DetectorId::VolumeSpike,
    DetectorId::NightHours,
    DetectorId::MultiParticipation,
    DetectorId::FanOutFanIn,
    DetectorId::PublisherConcentration,
    DetectorId::TemporalDrilldown,
];

/// Detectors whose labels count toward the settlement-table split.
pub const SETTLEMENT_DETECTORS: [DetectorId; 5] = [
    DetectorId::RejoinViolation,
    DetectorId::NightHours,
    DetectorId::CtitShare,
    DetectorId::PriceVolume,
    DetectorId::TemporalDrilldown,
];

/// Detectors whose labels count toward the report-table split.
pub const REPORT_DETECTORS: [DetectorId; 3] = [
    DetectorId::VolumeSpike,
    DetectorId::NightHours,
    DetectorId::PriceVolume,
];

/// One table split in two. Abuse rows keep their label vectors; clean rows by
/// definition carry none of the applicable labels.
#[derive(Debug, Clone)]
pub struct TablePartition<R> {
    pub clean: Vec<R>,
    pub abuse: Vec<R>,
    pub abuse_labels: Vec<LabelVector>,
}

impl<R> TablePartition<R> {
    pub fn total(&self) -> usize {
        self.clean.len() + self.abuse.len()
    }
}

fn split<R>(
    rows: Vec<R>,
    labels: Vec<LabelVector>,
    applicable: &[DetectorId],
    table: &'static str,
) -> Result<TablePartition<R>, EngineError> {
    if rows.len() != labels.len() {
        return Err(EngineError::LabelMisaligned {
            table,
            stage: "partition",
            rows: rows.len(),
            labels: labels.len(),
        });
    }
    let before = rows.len();

    let mut clean = Vec::new();
    let mut abuse = Vec::new();
    let mut abuse_labels = Vec::new();
    for (row, label) in rows.into_iter().zip(labels) {
        if label.any_flagged(applicable) {
            abuse.push(row);
            abuse_labels.push(label);
        } else {
            clean.push(row);
        }
    }

    let out = TablePartition {
        clean,
        abuse,
        abuse_labels,
    };
    if out.total() != before {
        return Err(EngineError::RowCountViolation {
            stage: "partition",
            before,
            after: out.total(),
        });
    }
    info!(
        table,
        clean = out.clean.len(),
        abuse = out.abuse.len(),
        "table partitioned"
    );
    Ok(out)
}

pub fn split_events(
    table: EventTable,
) -> Result<TablePartition<crate::types::ClickEvent>, EngineError> {
    split(
        table.rows,
        table.labels,
        &EVENT_DETECTORS,
        EventTable::table_name(),
    )
}

pub fn split_settlements(
    table: SettlementTable,
) -> Result<TablePartition<crate::types::Settlement>, EngineError> {
    split(
        table.rows,
        table.labels,
        &SETTLEMENT_DETECTORS,
        SettlementTable::table_name(),
    )
}

pub fn split_reports(
    table: ReportTable,
) -> Result<TablePartition<crate::types::ReportRow>, EngineError> {
    split(
        table.rows,
        table.labels,
        &REPORT_DETECTORS,
        ReportTable::table_name(),
    )
}
