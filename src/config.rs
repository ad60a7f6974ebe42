//! Configuration management for the abuse scoring engine
//!
//! Every numeric threshold a detector uses lives here with a documented
//! default, so a deployment can retune any detector from TOML without a
//! rebuild. All defaults mirror the values the detectors were calibrated with.

use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// How the identity resolver may fall back from device id to network address.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddressPolicy {
    /// Always use the address when the device id is missing
    Always,
    /// Never use addresses; device-only identity
    Never,
    /// Use the address only where the scope passes the address-quality audit
    #[default]
    Guarded,
}

/// Which side of the fan-out/fan-in graph supplies address features.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FanGraphMode {
    /// Use address features only when most scopes pass the quality audit
    #[default]
    Auto,
    ForceAddress,
    ForceDevice,
}

/// Sensitivity preset for the multi-participation detector.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectionLevel {
    Loose,
    #[default]
    Normal,
    Strict,
}

/// Main engine configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub identity: IdentityConfig,
    pub excess_attempts: ExcessAttemptsConfig,
    pub rejoin: RejoinConfig,
    pub spike: SpikeConfig,
    pub night: NightConfig,
    pub multi_participation: MultiParticipationConfig,
    pub ctit: CtitConfig,
    pub price_volume: PriceVolumeConfig,
    pub fan_graph: FanGraphConfig,
    pub concentration: ConcentrationConfig,
    pub temporal: TemporalConfig,
    pub scoring: ScoringConfig,
    pub logging: LoggingConfig,
    /// Seed for quota tie-breaking and score sampling
    pub seed: u64,
}

/// Identity resolution configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Address fallback policy
    pub policy: AddressPolicy,
    /// Scopes below this row count are always treated as address-reliable
    pub unreliable_min_rows: usize,
    /// Top-address share at or above which a scope is unreliable
    pub unreliable_top_share: f64,
    /// Distinct/total ratio at or below which a scope is unreliable
    pub unreliable_unique_ratio: f64,
    /// Address prefixes excluded from identity (media egress, RFC1918)
    pub infrastructure_prefixes: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            policy: AddressPolicy::Guarded,
            unreliable_min_rows: 200,
            unreliable_top_share: 0.95,
            unreliable_unique_ratio: 0.001,
            infrastructure_prefixes: default_infrastructure_prefixes(),
        }
    }
}

fn default_infrastructure_prefixes() -> Vec<String> {
    // Known media-server egress ranges plus private space
    [
        "43.203.", "3.38.", "16.184.", "54.180.", "15.165.", "13.125.", "52.79.", "34.64.",
        "175.126.", "10.", "192.168.",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Excess-attempts detector (D1)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExcessAttemptsConfig {
    /// Distinct clicks per actor x campaign for a Suspect label
    pub suspect_clicks: u64,
    /// Distinct clicks for a Confirmed label; suspect is clamped below this
    pub confirmed_clicks: u64,
    /// Optional lookback limit in days from the newest click
    pub window_days: Option<u32>,
}

impl Default for ExcessAttemptsConfig {
    fn default() -> Self {
        Self {
            suspect_clicks: 40,
            confirmed_clicks: 57,
            window_days: None,
        }
    }
}

/// Rejoin-policy detector (D2)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RejoinConfig {
    /// Settled participations per policy scope that constitute a violation
    pub min_repeats: u64,
}

impl Default for RejoinConfig {
    fn default() -> Self {
        Self { min_repeats: 2 }
    }
}

/// Rolling volume spike detector (D3)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpikeConfig {
    /// Trailing window length in hourly buckets
    pub window: usize,
    /// Minimum samples in the window before a baseline exists
    pub min_samples: usize,
    /// Hard cut: multiple of rolling median
    pub mult_threshold: f64,
    /// Hard cut: z-score vs rolling std
    pub z_threshold: f64,
    /// Rolling median floor; quiet series never produce spikes
    pub baseline_floor: f64,
    /// Campaign-side warm-up after campaign start, in hours
    pub warmup_hours: i64,
    /// Soft cut subtracted from the hard thresholds for Suspect
    pub soft_margin_mult: f64,
    pub soft_margin_z: f64,
    /// Per group, keep at most this many Confirmed findings
    pub top_confirmed: usize,
    /// Per group, keep at most this many Suspect findings
    pub top_suspect: usize,
    /// Campaign types the campaign side evaluates (install/run)
    pub campaign_types: Vec<i32>,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            window: 12,
            min_samples: 6,
            mult_threshold: 3.0,
            z_threshold: 3.0,
            baseline_floor: 1000.0,
            warmup_hours: 6,
            soft_margin_mult: 1.0,
            soft_margin_z: 1.0,
            top_confirmed: 3,
            top_suspect: 5,
            campaign_types: vec![1, 2],
        }
    }
}

/// Night-hours detector (D4)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NightConfig {
    /// First night hour, inclusive
    pub night_start_hour: u32,
    /// Last night hour, inclusive
    pub night_end_hour: u32,
    /// Minimum clicks per campaign x date
    pub min_total: u64,
    /// Night share of daily clicks that makes a candidate
    pub night_share: f64,
    /// Campaign must have at least this many distinct history days
    pub min_history_days: usize,
    /// Signals needed for Suspect / Confirmed
    pub suspect_signals: usize,
    pub confirmed_signals: usize,
    /// Share at which the label attaches to the media instead of publishers
    pub scope_share: f64,
    /// Signal a: night CR at or below this fraction of the rolling median CR
    pub cr_drop_ratio: f64,
    /// Rolling CR window in days and its minimum sample count
    pub cr_window_days: usize,
    pub cr_min_samples: usize,
    /// Signal b: top publisher's share of night clicks
    pub top_publisher_share: f64,
    /// Signal c: distinct-device / click ratio at or below this
    pub device_uniqueness_max: f64,
    /// Signal d: CTIT short cut in seconds and its share, long share vs 24 h
    pub ctit_short_secs: f64,
    pub ctit_short_share: f64,
    pub ctit_long_share: f64,
    /// Signal e: distinct devices behind a single address
    pub max_devices_per_address: u64,
}

impl Default for NightConfig {
    fn default() -> Self {
        Self {
            night_start_hour: 1,
            night_end_hour: 6,
            min_total: 50,
            night_share: 0.80,
            min_history_days: 3,
            suspect_signals: 2,
            confirmed_signals: 3,
            scope_share: 0.60,
            cr_drop_ratio: 0.5,
            cr_window_days: 7,
            cr_min_samples: 3,
            top_publisher_share: 0.6,
            device_uniqueness_max: 0.3,
            ctit_short_secs: 3.0,
            ctit_short_share: 0.6,
            ctit_long_share: 0.2,
            max_devices_per_address: 5,
        }
    }
}

/// Multi-participation window detector (D5)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiParticipationConfig {
    /// Sensitivity preset for signal margins and vote counts
    pub level: DetectionLevel,
    /// Sliding window length in minutes
    pub window_minutes: i64,
    /// Base distinct-campaign count per window
    pub min_campaigns: u64,
    /// Base installer-type clicks per window
    pub min_installs: u64,
    /// Chunk span in days for bounded-memory evaluation
    pub chunk_days: i64,
    /// Actors need at least max(this, min_campaigns) rows to be evaluated
    pub min_actor_rows: usize,
    /// Campaign types counted as installer traffic
    pub install_types: Vec<i32>,
    /// Publisher-day side: base flagged-window and flagged-actor counts
    pub pub_min_windows: u64,
    pub pub_min_actors: u64,
    /// Publisher-day side: base flagged-window ratio
    pub pub_flag_ratio: f64,
}

impl Default for MultiParticipationConfig {
    fn default() -> Self {
        Self {
            level: DetectionLevel::Normal,
            window_minutes: 10,
            min_campaigns: 4,
            min_installs: 2,
            chunk_days: 3,
            min_actor_rows: 5,
            install_types: vec![1, 2],
            pub_min_windows: 20,
            pub_min_actors: 10,
            pub_flag_ratio: 0.05,
        }
    }
}

/// CTIT share detector (D6)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CtitConfig {
    /// Minimum settled conversions per group x day
    pub min_daily_n: u64,
    /// Long-latency cut in hours and its share threshold
    pub long_hours: f64,
    pub long_share: f64,
    /// Short-latency cut in seconds per campaign type, then per category
    pub short_secs_by_type: HashMap<i32, f64>,
    pub short_secs_by_category: HashMap<i32, f64>,
    pub default_short_secs: f64,
    /// Short-share threshold per campaign type
    pub short_share_by_type: HashMap<i32, f64>,
    pub default_short_share: f64,
    /// Suspect when within this fraction of a threshold
    pub suspect_mult: f64,
    /// Confirmed when long share exceeds threshold times this
    pub confirmed_long_mult: f64,
    /// Dominant-publisher promotion: top publisher short share and contribution
    pub dominant_pub_short_share: f64,
    pub dominant_pub_contribution: f64,
}

impl Default for CtitConfig {
    fn default() -> Self {
        let mut short_secs_by_type = HashMap::new();
        short_secs_by_type.insert(1, 15.0);
        short_secs_by_type.insert(2, 10.0);
        short_secs_by_type.insert(3, 3.0);
        short_secs_by_type.insert(4, 2.0);

        let mut short_secs_by_category = HashMap::new();
        // games get generous install time, lightweight actions very little
        for cat in [2, 5, 6] {
            short_secs_by_category.insert(cat, 30.0);
        }
        for cat in [4, 13, 8, 10] {
            short_secs_by_category.insert(cat, 3.0);
        }
        short_secs_by_category.insert(7, 15.0);

        let mut short_share_by_type = HashMap::new();
        short_share_by_type.insert(1, 0.6);
        short_share_by_type.insert(2, 0.6);
        short_share_by_type.insert(3, 0.8);
        short_share_by_type.insert(4, 0.9);

        Self {
            min_daily_n: 30,
            long_hours: 24.0,
            long_share: 0.20,
            short_secs_by_type,
            short_secs_by_category,
            default_short_secs: 10.0,
            short_share_by_type,
            default_short_share: 0.8,
            suspect_mult: 0.85,
            confirmed_long_mult: 1.5,
            dominant_pub_short_share: 0.80,
            dominant_pub_contribution: 0.50,
        }
    }
}

/// Price/volume anomaly detector (D7)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriceVolumeConfig {
    /// Baseline needs this many distinct report days per media
    pub min_history_days: usize,
    /// Days below this conversion volume are skipped
    pub min_daily_volume: i64,
    /// Unit-price ratio and z-score spike cuts (before tier scaling)
    pub price_ratio: f64,
    pub price_z: f64,
    /// Daily volume multiple that marks a volume spike
    pub volume_ratio: f64,
    /// Severity score cuts: suspect_score * suspect_mult, confirmed_score * confirmed_mult
    pub suspect_mult: f64,
    pub confirmed_mult: f64,
    pub suspect_score: f64,
    pub confirmed_score: f64,
    /// Absolute unit prices that bypass the relative cuts
    pub extreme_price: f64,
    pub extreme_price_confirmed: f64,
    /// Media turnover tiers and their (ratio, z) scaling
    pub medium_turnover: f64,
    pub large_turnover: f64,
    pub large_ratio_scale: f64,
    pub large_z_scale: f64,
    pub small_ratio_scale: f64,
    pub small_z_scale: f64,
    /// Keep the highest-scoring findings per media x day
    pub top_k: usize,
}

impl Default for PriceVolumeConfig {
    fn default() -> Self {
        Self {
            min_history_days: 14,
            min_daily_volume: 20,
            price_ratio: 2.5,
            price_z: 2.0,
            volume_ratio: 1.5,
            suspect_mult: 0.6,
            confirmed_mult: 1.3,
            suspect_score: 10.0,
            confirmed_score: 25.0,
            extreme_price: 5000.0,
            extreme_price_confirmed: 10000.0,
            medium_turnover: 1000.0,
            large_turnover: 10000.0,
            large_ratio_scale: 1.5,
            large_z_scale: 1.2,
            small_ratio_scale: 0.8,
            small_z_scale: 0.8,
            top_k: 8,
        }
    }
}

/// Fan-out / fan-in graph detector (D8)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanGraphConfig {
    pub mode: FanGraphMode,
    /// Auto mode uses addresses when this share of scopes is address-reliable
    pub reliable_share: f64,
    /// Hit-count and score cuts per side
    pub confirmed_hits: usize,
    pub confirmed_score: f64,
    pub suspect_hits: usize,
    pub suspect_score: f64,
    /// Z-scores are clipped into [-gate, gate] before scoring
    pub z_gate: f64,
    /// Row-level Confirmed requires both the address and device side
    pub require_both_confirmed: bool,
    /// Per-detector flagged budget applied after propagation
    pub quota: QuotaConfig,
    /// Quota priority weights for the two sides
    pub address_weight: f64,
    pub device_weight: f64,
}

impl Default for FanGraphConfig {
    fn default() -> Self {
        Self {
            mode: FanGraphMode::Auto,
            reliable_share: 0.95,
            confirmed_hits: 3,
            confirmed_score: 5.0,
            suspect_hits: 2,
            suspect_score: 2.0,
            z_gate: 5.0,
            require_both_confirmed: true,
            quota: QuotaConfig {
                ceiling: Some(0.10),
                min_suspect_share: 0.20,
            },
            address_weight: 1.0,
            device_weight: 1.0,
        }
    }
}

/// Publisher concentration detector (D9)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcentrationConfig {
    /// Publishers below this click count are never evaluated
    pub min_clicks: u64,
    /// Mega-publisher cut; raises the per-entity averages below
    pub mega_clicks: u64,
    /// Top hour-of-day share cuts
    pub hour_share_suspect: f64,
    pub hour_share_confirmed: f64,
    /// Device sub-signal: rows needed, clicks-per-device, top-device share
    pub min_device_rows: u64,
    pub device_avg_suspect: f64,
    pub device_avg_confirmed: f64,
    pub mega_device_avg_suspect: f64,
    pub mega_device_avg_confirmed: f64,
    pub top_device_share_suspect: f64,
    pub top_device_share_confirmed: f64,
    /// Address sub-signal: web rows and valid addresses needed, then cuts
    pub min_web_rows: u64,
    pub min_valid_addresses: u64,
    pub address_avg_suspect: f64,
    pub address_avg_confirmed: f64,
    pub mega_address_avg_suspect: f64,
    pub mega_address_avg_confirmed: f64,
    pub top_address_share_suspect: f64,
    pub top_address_share_confirmed: f64,
}

impl Default for ConcentrationConfig {
    fn default() -> Self {
        Self {
            min_clicks: 1000,
            mega_clicks: 1_000_000,
            hour_share_suspect: 0.6,
            hour_share_confirmed: 0.8,
            min_device_rows: 100,
            device_avg_suspect: 50.0,
            device_avg_confirmed: 500.0,
            mega_device_avg_suspect: 200.0,
            mega_device_avg_confirmed: 1000.0,
            top_device_share_suspect: 0.3,
            top_device_share_confirmed: 0.7,
            min_web_rows: 100,
            min_valid_addresses: 50,
            address_avg_suspect: 30.0,
            address_avg_confirmed: 300.0,
            mega_address_avg_suspect: 100.0,
            mega_address_avg_confirmed: 500.0,
            top_address_share_suspect: 0.2,
            top_address_share_confirmed: 0.5,
        }
    }
}

/// Temporal drill-down detector (D10)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TemporalConfig {
    /// Stage 1 minimum clicks per media x publisher
    pub min_group_n: u64,
    /// Stage 2 minimum clicks per entity
    pub min_entity_n: u64,
    /// Second-of-minute mode share: warn / risk
    pub sec_mode_warn: f64,
    pub sec_mode_risk: f64,
    /// Inter-arrival mode share after +-1 s merge: warn / risk
    pub iat_mode_warn: f64,
    pub iat_mode_risk: f64,
    /// Inter-arrival gaps at or above this many seconds are dropped
    pub iat_max_gap_secs: i64,
    /// CTIT coefficient of variation, flagged at or BELOW: warn / risk
    pub ctit_cv_warn: f64,
    pub ctit_cv_risk: f64,
    /// CTIT 1 s-bin mode share: warn / risk
    pub ctit_mode_warn: f64,
    pub ctit_mode_risk: f64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            min_group_n: 200,
            min_entity_n: 30,
            sec_mode_warn: 0.45,
            sec_mode_risk: 0.62,
            iat_mode_warn: 0.65,
            iat_mode_risk: 0.85,
            iat_max_gap_secs: 3 * 3600,
            ctit_cv_warn: 0.18,
            ctit_cv_risk: 0.065,
            ctit_mode_warn: 0.45,
            ctit_mode_risk: 0.62,
        }
    }
}

/// Flagged-row budget for quota-constrained relabeling
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Maximum flagged fraction of the table; `None` disables the quota
    pub ceiling: Option<f64>,
    /// Minimum Suspect slice of the budget, applied only when budget remains
    /// and the priority cut would keep none
    pub min_suspect_share: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            ceiling: None,
            min_suspect_share: 0.20,
        }
    }
}

/// Composite scoring configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Per-detector importance weights for score fusion
    pub weights: HashMap<String, f64>,
    /// tanh gain for media scores and for publisher/user scores
    pub media_gain: f64,
    pub entity_gain: f64,
    /// Boost applied to detectors that react quickly to fresh abuse
    pub recency_boost: f64,
    pub recency_detectors: Vec<String>,
    /// Media traffic quantiles that split the size tiers
    pub large_quantile: f64,
    pub medium_quantile: f64,
    /// Size factors by tier (medium is 1.0)
    pub large_factor: f64,
    pub small_factor: f64,
    /// Dimension discounts in the overall ranking
    pub publisher_discount: f64,
    pub user_discount: f64,
    /// Publisher scoring bounds
    pub publisher_top: usize,
    pub publisher_row_cap: usize,
    /// User scoring sample size and output bound
    pub user_sample_rows: usize,
    pub user_top: usize,
    /// Entries kept per dimension in the overall ranking
    pub media_overall_top: usize,
    pub publisher_overall_top: usize,
    pub user_overall_top: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: default_detector_weights(),
            media_gain: 3.0,
            entity_gain: 2.0,
            recency_boost: 1.1,
            recency_detectors: vec![
                "excess_attempts".to_string(),
                "volume_spike".to_string(),
                "ctit_share".to_string(),
                "price_volume".to_string(),
                "fanout_fanin".to_string(),
            ],
            large_quantile: 0.9,
            medium_quantile: 0.7,
            large_factor: 1.2,
            small_factor: 0.8,
            publisher_discount: 0.8,
            user_discount: 0.6,
            publisher_top: 1000,
            publisher_row_cap: 1000,
            user_sample_rows: 100_000,
            user_top: 3000,
            media_overall_top: 50,
            publisher_overall_top: 100,
            user_overall_top: 100,
        }
    }
}

fn default_detector_weights() -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    weights.insert("excess_attempts".to_string(), 1.0);
    weights.insert("rejoin_violation".to_string(), 1.2);
    weights.insert("volume_spike".to_string(), 1.0);
    weights.insert("night_hours".to_string(), 0.9);
    weights.insert("multi_participation".to_string(), 1.0);
    weights.insert("ctit_share".to_string(), 1.1);
    weights.insert("price_volume".to_string(), 1.2);
    weights.insert("fanout_fanin".to_string(), 1.0);
    weights.insert("publisher_concentration".to_string(), 0.9);
    weights.insert("temporal_drilldown".to_string(), 1.0);
    weights
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/engine.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.excess_attempts.suspect_clicks, 40);
        assert_eq!(config.excess_attempts.confirmed_clicks, 57);
        assert_eq!(config.identity.policy, AddressPolicy::Guarded);
        assert_eq!(config.fan_graph.quota.ceiling, Some(0.10));
        assert_eq!(config.scoring.weights.len(), 10);
        assert_eq!(config.seed, 0);
    }

    #[test]
    fn test_detector_weights_cover_every_label_column() {
        use crate::types::DetectorId;
        let weights = default_detector_weights();
        for d in DetectorId::ALL {
            assert!(weights.contains_key(d.key()), "missing weight for {}", d);
        }
    }

    #[test]
    fn test_load_partial_toml_keeps_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "seed = 7\n[excess_attempts]\nsuspect_clicks = 25\n[identity]\npolicy = \"never\"\n"
        )
        .unwrap();

        let config = EngineConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.excess_attempts.suspect_clicks, 25);
        // untouched fields keep their defaults
        assert_eq!(config.excess_attempts.confirmed_clicks, 57);
        assert_eq!(config.identity.policy, AddressPolicy::Never);
        assert_eq!(config.spike.window, 12);
    }

    #[test]
    fn test_load_missing_file_fails_with_context() {
        let err = EngineConfig::load_from_path("/nonexistent/engine.toml").unwrap_err();
        assert!(err.to_string().contains("configuration"));
    }
}
