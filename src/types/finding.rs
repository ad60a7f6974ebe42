//! Detector output types: severities, detector identities and per-row labels.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of detector label columns carried per row.
pub const DETECTOR_COUNT: usize = 10;

/// Two-tier abuse severity. Ordering matters: fusion always keeps the max.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum Severity {
    #[default]
    Normal = 0,
    Suspect = 1,
    Confirmed = 2,
}

impl Severity {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_flagged(self) -> bool {
        self != Severity::Normal
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Normal => "normal",
            Severity::Suspect => "suspect",
            Severity::Confirmed => "confirmed",
        };
        write!(f, "{}", s)
    }
}

/// The ten detector units, numbered like their label columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorId {
    ExcessAttempts,
    RejoinViolation,
    VolumeSpike,
    NightHours,
    MultiParticipation,
    CtitShare,
    PriceVolume,
    FanOutFanIn,
    PublisherConcentration,
    TemporalDrilldown,
}

impl DetectorId {
    pub const ALL: [DetectorId; DETECTOR_COUNT] = [
        DetectorId::ExcessAttempts,
        DetectorId::RejoinViolation,
        DetectorId::VolumeSpike,
        DetectorId::NightHours,
        DetectorId::MultiParticipation,
        DetectorId::CtitShare,
        DetectorId::PriceVolume,
        DetectorId::FanOutFanIn,
        DetectorId::PublisherConcentration,
        DetectorId::TemporalDrilldown,
    ];

    /// Position in a [`LabelVector`].
    pub fn index(self) -> usize {
        match self {
            DetectorId::ExcessAttempts => 0,
            DetectorId::RejoinViolation => 1,
            DetectorId::VolumeSpike => 2,
            DetectorId::NightHours => 3,
            DetectorId::MultiParticipation => 4,
            DetectorId::CtitShare => 5,
            DetectorId::PriceVolume => 6,
            DetectorId::FanOutFanIn => 7,
            DetectorId::PublisherConcentration => 8,
            DetectorId::TemporalDrilldown => 9,
        }
    }

    /// Label column name in exported outputs.
    pub fn label_column(self) -> &'static str {
        match self {
            DetectorId::ExcessAttempts => "abuse_1",
            DetectorId::RejoinViolation => "abuse_2",
            DetectorId::VolumeSpike => "abuse_3",
            DetectorId::NightHours => "abuse_4",
            DetectorId::MultiParticipation => "abuse_5",
            DetectorId::CtitShare => "abuse_6",
            DetectorId::PriceVolume => "abuse_7",
            DetectorId::FanOutFanIn => "abuse_8",
            DetectorId::PublisherConcentration => "abuse_9",
            DetectorId::TemporalDrilldown => "abuse_10",
        }
    }

    /// Key used in the scoring weight map.
    pub fn key(self) -> &'static str {
        match self {
            DetectorId::ExcessAttempts => "excess_attempts",
            DetectorId::RejoinViolation => "rejoin_violation",
            DetectorId::VolumeSpike => "volume_spike",
            DetectorId::NightHours => "night_hours",
            DetectorId::MultiParticipation => "multi_participation",
            DetectorId::CtitShare => "ctit_share",
            DetectorId::PriceVolume => "price_volume",
            DetectorId::FanOutFanIn => "fanout_fanin",
            DetectorId::PublisherConcentration => "publisher_concentration",
            DetectorId::TemporalDrilldown => "temporal_drilldown",
        }
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Per-row label column: one severity slot per detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelVector([Severity; DETECTOR_COUNT]);

impl LabelVector {
    pub fn get(&self, detector: DetectorId) -> Severity {
        self.0[detector.index()]
    }

    /// Raise the slot to `severity` if it is higher than the current value.
    /// Fusion semantics: labels only ever escalate.
    pub fn set_max(&mut self, detector: DetectorId, severity: Severity) {
        let slot = &mut self.0[detector.index()];
        if severity > *slot {
            *slot = severity;
        }
    }

    /// Force a slot to an exact value. Only the quota stage may downgrade.
    pub fn set(&mut self, detector: DetectorId, severity: Severity) {
        self.0[detector.index()] = severity;
    }

    /// True if any of the given detectors flagged this row.
    pub fn any_flagged(&self, detectors: &[DetectorId]) -> bool {
        detectors.iter().any(|d| self.get(*d).is_flagged())
    }

    /// Highest severity across all slots.
    pub fn max_severity(&self) -> Severity {
        self.0.iter().copied().max().unwrap_or(Severity::Normal)
    }
}

/// Resolved actor identity used inside detector grouping keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActorKey {
    Device(i64),
    Address(String),
}

impl fmt::Display for ActorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorKey::Device(d) => write!(f, "dvc:{}", d),
            ActorKey::Address(a) => write!(f, "ip:{}", a),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Confirmed > Severity::Suspect);
        assert!(Severity::Suspect > Severity::Normal);
        assert!(!Severity::Normal.is_flagged());
        assert!(Severity::Suspect.is_flagged());
    }

    #[test]
    fn test_label_vector_set_max_never_downgrades() {
        let mut labels = LabelVector::default();
        labels.set_max(DetectorId::CtitShare, Severity::Confirmed);
        labels.set_max(DetectorId::CtitShare, Severity::Suspect);
        assert_eq!(labels.get(DetectorId::CtitShare), Severity::Confirmed);

        // re-applying the same severity is a no-op
        labels.set_max(DetectorId::CtitShare, Severity::Confirmed);
        assert_eq!(labels.get(DetectorId::CtitShare), Severity::Confirmed);
    }

    #[test]
    fn test_label_vector_any_flagged_scoped_to_detector_list() {
        let mut labels = LabelVector::default();
        labels.set_max(DetectorId::VolumeSpike, Severity::Suspect);
        assert!(labels.any_flagged(&[DetectorId::VolumeSpike, DetectorId::NightHours]));
        assert!(!labels.any_flagged(&[DetectorId::CtitShare]));
    }

    #[test]
    fn test_detector_indices_are_distinct_and_dense() {
        let mut seen = [false; DETECTOR_COUNT];
        for d in DetectorId::ALL {
            assert!(!seen[d.index()]);
            seen[d.index()] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_label_columns_follow_detector_numbering() {
        assert_eq!(DetectorId::ExcessAttempts.label_column(), "abuse_1");
        assert_eq!(DetectorId::TemporalDrilldown.label_column(), "abuse_10");
    }
}
