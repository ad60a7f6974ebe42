//! Quota-constrained relabeling
//!
//! Noisy detectors can flag a large fraction of a table; the quota caps the
//! flagged share per detector. Confirmed labels are never touched; when they
//! fill the ceiling on their own, every Suspect resets to Normal. Otherwise
//! Suspect labels are ranked by priority and the excess is downgraded, with
//! ties broken by a seeded RNG so the same input always keeps the same rows.
//! The flagged fraction never exceeds the ceiling.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::config::QuotaConfig;
use crate::error::EngineError;
use crate::types::{DetectorId, LabelVector, Severity};

/// What the quota pass did to one detector's label column.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaStats {
    pub rows: usize,
    pub confirmed: usize,
    pub suspect_before: usize,
    pub suspect_kept: usize,
    pub downgraded: usize,
}

impl QuotaStats {
    pub fn flagged_rate(&self) -> f64 {
        if self.rows == 0 {
            return 0.0;
        }
        (self.confirmed + self.suspect_kept) as f64 / self.rows as f64
    }
}

/// Apply the flagged-row budget to one detector's labels.
///
/// `priorities` is a per-row ranking strength aligned with `labels`; higher
/// keeps the label longer. Re-running with identical inputs is a no-op.
pub fn enforce(
    labels: &mut [LabelVector],
    detector: DetectorId,
    priorities: &[f64],
    config: &QuotaConfig,
    seed: u64,
    table: &'static str,
) -> Result<QuotaStats, EngineError> {
    if labels.len() != priorities.len() {
        return Err(EngineError::LabelMisaligned {
            table,
            stage: "quota",
            rows: priorities.len(),
            labels: labels.len(),
        });
    }

    let rows = labels.len();
    let confirmed = labels
        .iter()
        .filter(|l| l.get(detector) == Severity::Confirmed)
        .count();
    let mut suspects: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|(_, l)| l.get(detector) == Severity::Suspect)
        .map(|(i, _)| i)
        .collect();
    let suspect_before = suspects.len();

    let Some(ceiling) = config.ceiling else {
        return Ok(QuotaStats {
            rows,
            confirmed,
            suspect_before,
            suspect_kept: suspect_before,
            downgraded: 0,
        });
    };

    let target = (ceiling * rows as f64).floor() as usize;
    let remain = target.saturating_sub(confirmed);
    let mut keep = suspect_before.min(remain);
    // Budget left but the cut keeps nothing: a reserved slice of the target
    // survives, still capped at the remaining budget.
    if keep == 0 && remain > 0 && suspect_before > 0 {
        let reserved = (config.min_suspect_share * target as f64).floor() as usize;
        keep = suspect_before.min(reserved.clamp(1, remain));
    }

    if keep < suspect_before {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut ranked: Vec<(usize, f64, u64)> = suspects
            .drain(..)
            .map(|i| (i, priorities[i], rng.gen::<u64>()))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });
        for &(i, _, _) in &ranked[keep..] {
            labels[i].set(detector, Severity::Normal);
        }
    }

    let stats = QuotaStats {
        rows,
        confirmed,
        suspect_before,
        suspect_kept: keep.min(suspect_before),
        downgraded: suspect_before.saturating_sub(keep),
    };
    info!(
        detector = %detector,
        table,
        confirmed = stats.confirmed,
        suspect_before = stats.suspect_before,
        suspect_kept = stats.suspect_kept,
        flagged_rate = stats.flagged_rate(),
        "quota applied"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_with(suspect: usize, confirmed: usize, normal: usize) -> Vec<LabelVector> {
        let mut labels = Vec::new();
        for _ in 0..suspect {
            let mut l = LabelVector::default();
            l.set(DetectorId::FanOutFanIn, Severity::Suspect);
            labels.push(l);
        }
        for _ in 0..confirmed {
            let mut l = LabelVector::default();
            l.set(DetectorId::FanOutFanIn, Severity::Confirmed);
            labels.push(l);
        }
        labels.extend(std::iter::repeat(LabelVector::default()).take(normal));
        labels
    }

    fn quota(ceiling: f64) -> QuotaConfig {
        QuotaConfig {
            ceiling: Some(ceiling),
            min_suspect_share: 0.20,
        }
    }

    #[test]
    fn test_no_ceiling_is_a_passthrough() {
        let mut labels = labels_with(50, 10, 40);
        let priorities = vec![0.0; labels.len()];
        let config = QuotaConfig {
            ceiling: None,
            min_suspect_share: 0.2,
        };
        let stats = enforce(
            &mut labels,
            DetectorId::FanOutFanIn,
            &priorities,
            &config,
            1,
            "participation",
        )
        .unwrap();
        assert_eq!(stats.downgraded, 0);
        assert_eq!(stats.suspect_kept, 50);
    }

    #[test]
    fn test_excess_suspects_downgraded_by_priority() {
        // 100 rows, ceiling 0.10 -> 10 flagged; 4 confirmed leave 6 suspect slots
        let mut labels = labels_with(20, 4, 76);
        let mut priorities = vec![0.0; labels.len()];
        for (i, p) in priorities.iter_mut().enumerate().take(20) {
            *p = i as f64; // rows 14..19 have the highest priority
        }
        let stats = enforce(
            &mut labels,
            DetectorId::FanOutFanIn,
            &priorities,
            &quota(0.10),
            7,
            "participation",
        )
        .unwrap();
        assert_eq!(stats.confirmed, 4);
        assert_eq!(stats.suspect_kept, 6);
        assert_eq!(stats.downgraded, 14);
        for i in 14..20 {
            assert_eq!(labels[i].get(DetectorId::FanOutFanIn), Severity::Suspect);
        }
        for i in 0..14 {
            assert_eq!(labels[i].get(DetectorId::FanOutFanIn), Severity::Normal);
        }
        assert!(stats.flagged_rate() <= 0.10 + 1e-9);
    }

    #[test]
    fn test_confirmed_never_downgraded() {
        // confirmed alone exceeds the ceiling: it all survives, every
        // suspect resets
        let mut labels = labels_with(10, 30, 60);
        let priorities = vec![1.0; labels.len()];
        let stats = enforce(
            &mut labels,
            DetectorId::FanOutFanIn,
            &priorities,
            &quota(0.10),
            7,
            "participation",
        )
        .unwrap();
        assert_eq!(stats.confirmed, 30);
        let confirmed_after = labels
            .iter()
            .filter(|l| l.get(DetectorId::FanOutFanIn) == Severity::Confirmed)
            .count();
        assert_eq!(confirmed_after, 30);
        assert_eq!(stats.suspect_kept, 0);
        assert_eq!(stats.downgraded, 10);
        for l in labels.iter().take(10) {
            assert_eq!(l.get(DetectorId::FanOutFanIn), Severity::Normal);
        }
    }

    #[test]
    fn test_rate_never_exceeds_ceiling() {
        // 9 confirmed leave a single suspect slot out of target 10; the
        // strongest suspect takes it and the rate stays at the ceiling
        let mut labels = labels_with(20, 9, 71);
        let mut priorities = vec![0.0; labels.len()];
        priorities[5] = 10.0;
        let stats = enforce(
            &mut labels,
            DetectorId::FanOutFanIn,
            &priorities,
            &quota(0.10),
            7,
            "participation",
        )
        .unwrap();
        assert_eq!(stats.suspect_kept, 1);
        assert_eq!(stats.downgraded, 19);
        assert_eq!(labels[5].get(DetectorId::FanOutFanIn), Severity::Suspect);
        assert!(stats.flagged_rate() <= 0.10 + 1e-9);
    }

    #[test]
    fn test_enforce_is_idempotent() {
        let mut labels = labels_with(20, 4, 76);
        let priorities: Vec<f64> = (0..labels.len()).map(|i| (i % 7) as f64).collect();
        enforce(
            &mut labels,
            DetectorId::FanOutFanIn,
            &priorities,
            &quota(0.10),
            99,
            "participation",
        )
        .unwrap();
        let snapshot = labels.clone();
        let stats = enforce(
            &mut labels,
            DetectorId::FanOutFanIn,
            &priorities,
            &quota(0.10),
            99,
            "participation",
        )
        .unwrap();
        assert_eq!(labels, snapshot);
        assert_eq!(stats.downgraded, 0);
    }

    #[test]
    fn test_misaligned_priorities_rejected() {
        let mut labels = labels_with(1, 0, 0);
        let err = enforce(
            &mut labels,
            DetectorId::FanOutFanIn,
            &[],
            &quota(0.10),
            0,
            "participation",
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::LabelMisaligned { .. }));
    }
}
