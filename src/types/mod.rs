//! Type definitions for the abuse scoring engine

pub mod event;
pub mod finding;

pub use event::{
    Campaign, ClickEvent, EventStore, EventTable, RejoinPolicy, ReportRow, ReportTable,
    Settlement, SettlementTable,
};
pub use finding::{ActorKey, DetectorId, LabelVector, Severity, DETECTOR_COUNT};
