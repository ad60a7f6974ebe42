//! Record types for the three input streams and their labeled table wrappers.
//!
//! Every input row is immutable; labels live in a parallel column vector so
//! that no stage can drop or duplicate rows while attaching detector output.

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::types::finding::{DetectorId, LabelVector};

/// One click attempt (participation record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickEvent {
    /// Unique click identifier
    pub click_key: String,

    /// Campaign the click belongs to
    pub campaign_id: i64,

    /// Media (ad network app/site) that served the click
    pub media_id: i64,

    /// Publisher placement under the media
    pub publisher_id: i64,

    /// Device identifier; 0 means web / no device
    pub device_id: i64,

    /// Network address, if the source table carried one
    pub address: Option<String>,

    /// Click timestamp; `None` when the upstream value failed to parse
    pub clicked_at: Option<DateTime<Utc>>,
}

impl ClickEvent {
    /// Calendar day of the click, when the timestamp parsed.
    pub fn day(&self) -> Option<NaiveDate> {
        self.clicked_at.map(|t| t.date_naive())
    }

    /// Hour of day (0-23).
    pub fn hour(&self) -> Option<u32> {
        self.clicked_at.map(|t| t.hour())
    }

    /// Epoch-hour bucket, used for rolling time series keys.
    pub fn hour_bucket(&self) -> Option<i64> {
        self.clicked_at.map(|t| t.timestamp().div_euclid(3600))
    }
}

/// One credited conversion (settlement record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    /// Click identifier this conversion settles (foreign key to participation)
    pub click_key: String,

    /// Campaign the conversion belongs to
    pub campaign_id: i64,

    /// Media identifier, when present in the source schema
    pub media_id: Option<i64>,

    /// Publisher placement, when present
    pub publisher_id: Option<i64>,

    /// Device identifier; 0 means web / no device
    pub device_id: i64,

    /// Network address, when present
    pub address: Option<String>,

    /// Settlement timestamp (click time carried on the settlement row)
    pub occurred_at: Option<DateTime<Utc>>,

    /// Conversion-time-to-click interval in an ambiguous unit; scaled to
    /// seconds by the CTIT detector before use
    pub latency_raw: Option<f64>,

    /// Payout cost attributed to this conversion, when present
    pub cost: Option<f64>,
}

impl Settlement {
    pub fn day(&self) -> Option<NaiveDate> {
        self.occurred_at.map(|t| t.date_naive())
    }

    pub fn hour(&self) -> Option<u32> {
        self.occurred_at.map(|t| t.hour())
    }
}

/// One pre-aggregated hourly report row (campaign x media x date x hour).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRow {
    pub campaign_id: i64,
    pub media_id: i64,
    pub date: NaiveDate,
    /// Hour of day (0-23); out-of-range values make the row time-less
    pub hour: u32,
    pub clicks: i64,
    pub conversions: i64,
    pub cost: f64,
    pub revenue: f64,
}

impl ReportRow {
    /// Epoch-hour bucket of the report slot, `None` for invalid hours.
    pub fn hour_bucket(&self) -> Option<i64> {
        self.date
            .and_hms_opt(self.hour, 0, 0)
            .map(|t| t.and_utc().timestamp().div_euclid(3600))
    }
}

/// Campaign rejoin policy: how often one actor may legitimately participate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RejoinPolicy {
    /// One participation ever
    None,
    /// At most one participation per calendar day
    DailyUnique,
    /// No restriction
    #[default]
    Unlimited,
}

/// Campaign metadata consumed by policy- and type-aware detectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub campaign_id: i64,
    pub rejoin_policy: RejoinPolicy,
    /// Campaign type code (1 install, 2 run, 3 participate, 4 click)
    pub campaign_type: i32,
    /// Category code used for per-category CTIT thresholds
    pub category: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Which optional columns a table actually carries, checked once at
/// construction. Detectors consult this instead of probing per row; a missing
/// capability downgrades to skipping the table, never to a hard failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableCaps {
    pub has_address: bool,
    pub has_timestamp: bool,
    pub has_latency: bool,
    pub has_cost: bool,
    pub has_media: bool,
    pub has_publisher: bool,
}

macro_rules! labeled_table {
    ($name:ident, $row:ty, $table_name:literal) => {
        /// Rows plus a parallel per-detector label column.
        #[derive(Debug, Clone)]
        pub struct $name {
            pub rows: Vec<$row>,
            pub labels: Vec<LabelVector>,
            pub caps: TableCaps,
        }

        impl $name {
            pub fn len(&self) -> usize {
                self.rows.len()
            }

            pub fn is_empty(&self) -> bool {
                self.rows.is_empty()
            }

            pub const fn table_name() -> &'static str {
                $table_name
            }

            /// Verify label alignment after a propagation stage.
            pub fn check_aligned(&self, stage: &'static str) -> Result<(), crate::error::EngineError> {
                if self.rows.len() == self.labels.len() {
                    Ok(())
                } else {
                    Err(crate::error::EngineError::LabelMisaligned {
                        table: $table_name,
                        stage,
                        rows: self.rows.len(),
                        labels: self.labels.len(),
                    })
                }
            }

            /// Count of rows flagged by any of the given detectors.
            pub fn flagged_count(&self, detectors: &[DetectorId]) -> usize {
                self.labels.iter().filter(|l| l.any_flagged(detectors)).count()
            }
        }
    };
}

labeled_table!(EventTable, ClickEvent, "participation");
labeled_table!(SettlementTable, Settlement, "settlement");
labeled_table!(ReportTable, ReportRow, "report");

impl EventTable {
    pub fn new(rows: Vec<ClickEvent>) -> Self {
        let caps = TableCaps {
            has_address: rows.iter().any(|r| r.address.is_some()),
            has_timestamp: rows.iter().any(|r| r.clicked_at.is_some()),
            ..TableCaps::default()
        };
        let labels = vec![LabelVector::default(); rows.len()];
        Self { rows, labels, caps }
    }
}

impl SettlementTable {
    pub fn new(rows: Vec<Settlement>) -> Self {
        let caps = TableCaps {
            has_address: rows.iter().any(|r| r.address.is_some()),
            has_timestamp: rows.iter().any(|r| r.occurred_at.is_some()),
            has_latency: rows.iter().any(|r| r.latency_raw.is_some()),
            has_cost: rows.iter().any(|r| r.cost.is_some()),
            has_media: rows.iter().any(|r| r.media_id.is_some()),
            has_publisher: rows.iter().any(|r| r.publisher_id.is_some()),
            ..TableCaps::default()
        };
        let labels = vec![LabelVector::default(); rows.len()];
        Self { rows, labels, caps }
    }
}

impl ReportTable {
    pub fn new(rows: Vec<ReportRow>) -> Self {
        let caps = TableCaps {
            has_timestamp: true,
            ..TableCaps::default()
        };
        let labels = vec![LabelVector::default(); rows.len()];
        Self { rows, labels, caps }
    }
}

/// Read-only batch input: the three record streams plus campaign metadata.
#[derive(Debug, Clone, Default)]
pub struct EventStore {
    pub events: Vec<ClickEvent>,
    pub settlements: Vec<Settlement>,
    pub reports: Vec<ReportRow>,
    pub campaigns: Vec<Campaign>,
}
