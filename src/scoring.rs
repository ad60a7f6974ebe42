//! Composite scoring engine
//!
//! Fused per-row labels roll up into per-entity risk scores across three
//! dimensions: media, publisher and user. Per detector the magnitude is
//! `rate^p1 * ln(1+count)^p2 * mean_severity`, squashed through tanh so one
//! screaming detector cannot dominate, then weighted and summed. Media size
//! tiers widen the exponents for large networks so base rates are compared
//! fairly. The publisher and user dimensions are bounded (top entities, row
//! caps, seeded sampling) to keep the roll-up linear in the batch size.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::info;

use crate::config::ScoringConfig;
use crate::detectors::quantile;
use crate::identity::IdentityResolver;
use crate::types::{ActorKey, DetectorId, EventTable, LabelVector, Severity};

/// Exponent pairs (rate, count) per media size tier: large, medium, small.
const MEDIA_EXPONENTS: [(f64, f64); 3] = [(0.9, 0.2), (0.8, 0.3), (0.7, 0.4)];
const PUBLISHER_EXPONENTS: (f64, f64) = (0.8, 0.3);
const USER_EXPONENTS: (f64, f64) = (0.85, 0.25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeTier {
    Large,
    Medium,
    Small,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityId {
    Media(i64),
    Publisher { media_id: i64, publisher_id: i64 },
    User(ActorKey),
}

/// One detector's share of an entity score.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorContribution {
    pub detector: DetectorId,
    pub score: f64,
    pub flagged: u64,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityScore {
    pub entity: EntityId,
    pub score: f64,
    pub traffic: u64,
    pub tier: SizeTier,
    /// Per-detector breakdown, strongest first
    pub contributions: Vec<DetectorContribution>,
}

impl EntityScore {
    /// The detectors driving this score, strongest first.
    pub fn top_contributors(&self, k: usize) -> &[DetectorContribution] {
        &self.contributions[..k.min(self.contributions.len())]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RankedEntry {
    pub rank: usize,
    pub entity: EntityId,
    pub score: f64,
}

/// Full scoring output.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ScoreReport {
    pub media: Vec<EntityScore>,
    pub publishers: Vec<EntityScore>,
    pub users: Vec<EntityScore>,
    /// Cross-dimension ranking, dense-ranked by discounted score
    pub overall: Vec<RankedEntry>,
    /// Per-campaign share of flagged participation rows
    pub contamination: HashMap<i64, f64>,
}

impl ScoreReport {
    /// Export form for downstream consumers.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn detector_weight(config: &ScoringConfig, detector: DetectorId) -> f64 {
    config.weights.get(detector.key()).copied().unwrap_or(1.0)
}

fn recency_multiplier(config: &ScoringConfig, detector: DetectorId) -> f64 {
    if config.recency_detectors.iter().any(|d| d == detector.key()) {
        config.recency_boost
    } else {
        1.0
    }
}

/// Score one entity from the labels of its rows.
fn score_rows(
    config: &ScoringConfig,
    labels: &[&LabelVector],
    exponents: (f64, f64),
    gain: f64,
    size_factor: f64,
) -> (f64, Vec<DetectorContribution>) {
    let rows = labels.len() as f64;
    if rows == 0.0 {
        return (0.0, Vec::new());
    }
    let (p1, p2) = exponents;
    let mut contributions = Vec::new();
    let mut total = 0.0;
    for detector in DetectorId::ALL {
        let mut flagged = 0u64;
        let mut severity_sum = 0u64;
        for l in labels {
            let s = l.get(detector);
            if s.is_flagged() {
                flagged += 1;
                severity_sum += s.as_u8() as u64;
            }
        }
        if flagged == 0 {
            continue;
        }
        let rate = flagged as f64 / rows;
        let mean_severity = severity_sum as f64 / flagged as f64 / Severity::Confirmed.as_u8() as f64;
        let magnitude = rate.powf(p1) * (1.0 + flagged as f64).ln().powf(p2) * mean_severity;
        let normalized = (gain * magnitude).tanh();
        let score = detector_weight(config, detector)
            * normalized
            * recency_multiplier(config, detector)
            * size_factor;
        total += score;
        contributions.push(DetectorContribution {
            detector,
            score,
            flagged,
            rate,
        });
    }
    contributions.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    (total, contributions)
}

fn media_tiers(
    config: &ScoringConfig,
    traffic: &HashMap<i64, u64>,
) -> HashMap<i64, (SizeTier, f64)> {
    let volumes: Vec<f64> = traffic.values().map(|n| *n as f64).collect();
    let large_cut = quantile(&volumes, config.large_quantile).unwrap_or(f64::MAX);
    let medium_cut = quantile(&volumes, config.medium_quantile).unwrap_or(f64::MAX);
    traffic
        .iter()
        .map(|(media_id, n)| {
            let v = *n as f64;
            let entry = if v >= large_cut {
                (SizeTier::Large, config.large_factor)
            } else if v >= medium_cut {
                (SizeTier::Medium, 1.0)
            } else {
                (SizeTier::Small, config.small_factor)
            };
            (*media_id, entry)
        })
        .collect()
}

fn tier_exponents(tier: SizeTier) -> (f64, f64) {
    match tier {
        SizeTier::Large => MEDIA_EXPONENTS[0],
        SizeTier::Medium => MEDIA_EXPONENTS[1],
        SizeTier::Small => MEDIA_EXPONENTS[2],
    }
}

pub fn score(
    config: &ScoringConfig,
    resolver: &IdentityResolver,
    events: &EventTable,
    seed: u64,
) -> ScoreReport {
    // media dimension
    let mut media_rows: HashMap<i64, Vec<&LabelVector>> = HashMap::new();
    for (e, l) in events.rows.iter().zip(&events.labels) {
        media_rows.entry(e.media_id).or_default().push(l);
    }
    let traffic: HashMap<i64, u64> = media_rows
        .iter()
        .map(|(id, rows)| (*id, rows.len() as u64))
        .collect();
    let tiers = media_tiers(config, &traffic);

    let mut media: Vec<EntityScore> = media_rows
        .iter()
        .map(|(media_id, rows)| {
            let (tier, factor) = tiers[media_id];
            let (score, contributions) =
                score_rows(config, rows, tier_exponents(tier), config.media_gain, factor);
            EntityScore {
                entity: EntityId::Media(*media_id),
                score,
                traffic: rows.len() as u64,
                tier,
                contributions,
            }
        })
        .collect();
    media.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // publisher dimension, bounded to the biggest placements
    let mut pub_rows: HashMap<(i64, i64), Vec<&LabelVector>> = HashMap::new();
    for (e, l) in events.rows.iter().zip(&events.labels) {
        let rows = pub_rows.entry((e.media_id, e.publisher_id)).or_default();
        if rows.len() < config.publisher_row_cap {
            rows.push(l);
        }
    }
    let mut pub_order: Vec<((i64, i64), usize)> =
        pub_rows.iter().map(|(k, v)| (*k, v.len())).collect();
    pub_order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    pub_order.truncate(config.publisher_top);

    let mut publishers: Vec<EntityScore> = pub_order
        .iter()
        .map(|((media_id, publisher_id), _)| {
            let rows = &pub_rows[&(*media_id, *publisher_id)];
            let (raw, contributions) =
                score_rows(config, rows, PUBLISHER_EXPONENTS, config.entity_gain, 1.0);
            EntityScore {
                entity: EntityId::Publisher {
                    media_id: *media_id,
                    publisher_id: *publisher_id,
                },
                score: raw * config.publisher_discount,
                traffic: rows.len() as u64,
                tier: SizeTier::Medium,
                contributions,
            }
        })
        .collect();
    publishers.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // user dimension over a seeded sample
    let sample: Vec<usize> = if events.rows.len() > config.user_sample_rows {
        let mut rng = StdRng::seed_from_u64(seed);
        rand::seq::index::sample(&mut rng, events.rows.len(), config.user_sample_rows).into_vec()
    } else {
        (0..events.rows.len()).collect()
    };
    let mut user_rows: HashMap<ActorKey, Vec<&LabelVector>> = HashMap::new();
    for i in sample {
        if let Some(actor) = resolver.actor_for_event(&events.rows[i]) {
            user_rows.entry(actor).or_default().push(&events.labels[i]);
        }
    }
    let mut user_order: Vec<(ActorKey, usize)> = user_rows
        .iter()
        .map(|(k, v)| (k.clone(), v.len()))
        .collect();
    user_order.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.to_string().cmp(&b.0.to_string())));
    user_order.truncate(config.user_top);

    let mut users: Vec<EntityScore> = user_order
        .iter()
        .map(|(actor, _)| {
            let rows = &user_rows[actor];
            let (raw, contributions) =
                score_rows(config, rows, USER_EXPONENTS, config.entity_gain, 1.0);
            EntityScore {
                entity: EntityId::User(actor.clone()),
                score: raw * config.user_discount,
                traffic: rows.len() as u64,
                tier: SizeTier::Small,
                contributions,
            }
        })
        .collect();
    users.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    // overall ranking merges the three dimensions, dense-ranked
    let mut overall: Vec<(EntityId, f64)> = Vec::new();
    for e in media.iter().take(config.media_overall_top) {
        overall.push((e.entity.clone(), e.score));
    }
    for e in publishers.iter().take(config.publisher_overall_top) {
        overall.push((e.entity.clone(), e.score));
    }
    for e in users.iter().take(config.user_overall_top) {
        overall.push((e.entity.clone(), e.score));
    }
    overall.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut ranked = Vec::with_capacity(overall.len());
    let mut rank = 0usize;
    let mut last_score = f64::INFINITY;
    for (entity, score) in overall {
        if score < last_score {
            rank += 1;
            last_score = score;
        }
        ranked.push(RankedEntry {
            rank,
            entity,
            score,
        });
    }

    // per-campaign contamination from fused participation labels
    let mut campaign_totals: HashMap<i64, (u64, u64)> = HashMap::new();
    for (e, l) in events.rows.iter().zip(&events.labels) {
        let slot = campaign_totals.entry(e.campaign_id).or_insert((0, 0));
        slot.0 += 1;
        slot.1 += l.any_flagged(&DetectorId::ALL) as u64;
    }
    let contamination = campaign_totals
        .into_iter()
        .map(|(campaign_id, (total, flagged))| (campaign_id, flagged as f64 / total as f64))
        .collect();

    info!(
        media = media.len(),
        publishers = publishers.len(),
        users = users.len(),
        "scoring complete"
    );

    ScoreReport {
        media,
        publishers,
        users,
        overall: ranked,
        contamination,
    }
}
