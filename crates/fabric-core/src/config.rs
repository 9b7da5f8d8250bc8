//! engine.toml configuration parser.
//!
//! Every section and field is optional; a missing file section falls back to
//! the built-in defaults. Strategy tables are layered on top of the built-in
//! presets, so `[strategies.resilient]` with a single `risk_weight` keeps the
//! rest of the resilient preset intact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cost: CostConfig,
    pub network: NetworkDefaults,
    pub merger: MergerConfig,
    pub engine: EngineSettings,
    pub strategies: BTreeMap<String, StrategyOverrides>,
}

// ── Cost model ────────────────────────────────────────────────────

/// Constants for the cost model. Only the shape of the resulting scores is
/// meaningful; the values here are tuning knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Floor latency per stage (ms).
    pub min_stage_ms: f64,
    /// Divides a node's CPU units into a speed multiplier.
    pub cpu_unit_divisor: f64,
    /// Base work per MB of stage input.
    pub work_per_mb: f64,
    /// Base work per requested CPU core.
    pub work_per_core: f64,
    /// Work multiplier for IO-bound stages.
    pub io_bound_factor: f64,
    /// `cuda` speedup is `cuda_base_boost * (1 + gpu_accel_score / 10)`,
    /// clamped to `[1, cuda_max_boost]`.
    pub cuda_base_boost: f64,
    pub cuda_max_boost: f64,
    /// `npu` speedup is `1 + npu_tops / npu_tops_per_boost`, clamped to
    /// `[1, npu_max_boost]`.
    pub npu_tops_per_boost: f64,
    pub npu_max_boost: f64,
    /// Slowdown for stages pinned to `wasm` on a node that offers it.
    pub wasm_penalty: f64,
    /// Speed multiplier when the node supports none of the allowed formats.
    pub format_mismatch_factor: f64,
    /// Queueing delay as a multiple of compute time at full load.
    pub queue_factor: f64,
    /// CPU units per core when a node does not declare a benchmark score.
    pub cpu_units_per_core: f64,

    /// Throughput overhead (TCP/TLS framing).
    pub proto_overhead: f64,
    /// Cap on the loss-rate throughput penalty.
    pub loss_penalty_ceil: f64,

    pub default_tdp_w: f64,
    pub idle_fraction: f64,
    /// Exponent mapping utilization to active power (> 1 is convex).
    pub util_exponent: f64,
    /// Utilization above which a near-saturation energy surcharge applies.
    pub saturation_knee: f64,
    /// Extra power fraction at 100% utilization.
    pub saturation_surcharge: f64,

    pub default_trust: f64,
    pub risk_weight_health: f64,
    pub risk_weight_trust: f64,
    pub risk_weight_ssd_wear: f64,
    pub risk_weight_crash: f64,
    pub risk_weight_thermal: f64,
    pub risk_weight_link_loss: f64,
    pub risk_weight_partition: f64,
    /// Crash count at which the crash term saturates.
    pub crash_saturation: f64,
    /// Loss percentage at which the link-loss term saturates.
    pub loss_saturation_pct: f64,

    pub slo_alpha: f64,
    pub slo_beta: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            min_stage_ms: 15.0,
            cpu_unit_divisor: 10.0,
            work_per_mb: 2.0,
            work_per_core: 120.0,
            io_bound_factor: 0.85,
            cuda_base_boost: 1.0,
            cuda_max_boost: 6.0,
            npu_tops_per_boost: 10.0,
            npu_max_boost: 3.0,
            wasm_penalty: 1.35,
            format_mismatch_factor: 0.5,
            queue_factor: 1.0,
            cpu_units_per_core: 10.0,
            proto_overhead: 0.85,
            loss_penalty_ceil: 0.30,
            default_tdp_w: 65.0,
            idle_fraction: 0.12,
            util_exponent: 2.0,
            saturation_knee: 0.9,
            saturation_surcharge: 0.5,
            default_trust: 0.8,
            risk_weight_health: 0.20,
            risk_weight_trust: 0.20,
            risk_weight_ssd_wear: 0.10,
            risk_weight_crash: 0.10,
            risk_weight_thermal: 0.15,
            risk_weight_link_loss: 0.10,
            risk_weight_partition: 0.15,
            crash_saturation: 5.0,
            loss_saturation_pct: 5.0,
            slo_alpha: 1.2,
            slo_beta: 0.002,
        }
    }
}

// ── Network ───────────────────────────────────────────────────────

/// Metrics used for implicit links between nodes with no declared link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkDefaults {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
    pub bandwidth_mbps: f64,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            latency_ms: 5.0,
            jitter_ms: 0.5,
            loss_pct: 0.0,
            bandwidth_mbps: 1000.0,
        }
    }
}

// ── Merger ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergerConfig {
    /// JSON-lines override log to tail. `None` disables file ingestion.
    pub override_log: Option<PathBuf>,
    pub poll_interval_ms: u64,
    /// Upper bound on a single log read.
    pub read_timeout_ms: u64,
    pub ttl_sweep_interval_ms: u64,
    /// Capacity of the pushed-event channel.
    pub channel_capacity: usize,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            override_log: None,
            poll_interval_ms: 500,
            read_timeout_ms: 2000,
            ttl_sweep_interval_ms: 1000,
            channel_capacity: 256,
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Re-plan attempts after a stale-snapshot commit failure.
    pub stale_retry_limit: u32,
    /// TTL applied to reservations of jobs that do not carry their own.
    pub default_reservation_ttl_ms: Option<u64>,
    /// Released reservations kept for inspection.
    pub released_history: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            stale_retry_limit: 3,
            default_reservation_ttl_ms: None,
            released_history: 1024,
        }
    }
}

// ── Strategies ────────────────────────────────────────────────────

/// Fully resolved weights for one planning strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub latency_weight: f64,
    pub energy_weight: f64,
    pub risk_weight: f64,
    /// Penalty per unit of projected federation load.
    pub load_weight: f64,
    /// Penalty per stage already placed in the same federation.
    pub spread_weight: f64,
    /// Penalty for lossy or down inbound paths.
    pub network_weight: f64,
    /// Penalty per unit of federation down + hot fraction.
    pub resilience_weight: f64,
    /// Projected federation load at or above which the saturation penalty applies.
    pub saturation_threshold: f64,
    pub saturation_penalty: f64,
    /// Score bonus for keeping consecutive stages on the same node.
    pub prefer_prev_bonus: f64,
    /// Weight of the deadline (SLO) penalty in the plan score.
    pub slo_weight: f64,
    /// Number of fallback plans to produce.
    pub fallbacks: usize,
    /// Score added per unit of learned node penalty (adaptive only).
    pub adaptive_penalty: f64,
    /// Smoothing factor for learned penalties (adaptive only).
    pub adaptive_learning_rate: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::greedy()
    }
}

impl StrategyConfig {
    pub fn greedy() -> Self {
        Self {
            latency_weight: 1.0,
            energy_weight: 0.0,
            risk_weight: 10.0,
            load_weight: 0.0,
            spread_weight: 0.0,
            network_weight: 0.0,
            resilience_weight: 0.0,
            saturation_threshold: 0.85,
            saturation_penalty: 0.0,
            prefer_prev_bonus: 0.0,
            slo_weight: 0.0,
            fallbacks: 0,
            adaptive_penalty: 0.0,
            adaptive_learning_rate: 0.0,
        }
    }

    pub fn resilient() -> Self {
        Self {
            risk_weight: 220.0,
            load_weight: 380.0,
            spread_weight: 210.0,
            network_weight: 240.0,
            resilience_weight: 250.0,
            saturation_penalty: 500.0,
            prefer_prev_bonus: 15.0,
            slo_weight: 1.0,
            fallbacks: 1,
            ..Self::greedy()
        }
    }

    pub fn network_aware() -> Self {
        Self {
            risk_weight: 200.0,
            load_weight: 260.0,
            spread_weight: 140.0,
            network_weight: 300.0,
            resilience_weight: 190.0,
            prefer_prev_bonus: 12.0,
            fallbacks: 0,
            ..Self::resilient()
        }
    }

    pub fn federated() -> Self {
        Self {
            risk_weight: 210.0,
            load_weight: 360.0,
            spread_weight: 260.0,
            network_weight: 230.0,
            resilience_weight: 240.0,
            prefer_prev_bonus: 10.0,
            fallbacks: 2,
            ..Self::resilient()
        }
    }

    pub fn adaptive() -> Self {
        Self {
            adaptive_penalty: 50.0,
            adaptive_learning_rate: 0.3,
            ..Self::greedy()
        }
    }

    /// Built-in preset for a canonical strategy name.
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "greedy" => Some(Self::greedy()),
            "resilient" => Some(Self::resilient()),
            "network-aware" => Some(Self::network_aware()),
            "federated" => Some(Self::federated()),
            "adaptive" => Some(Self::adaptive()),
            _ => None,
        }
    }

    fn apply(mut self, o: &StrategyOverrides) -> Self {
        macro_rules! layer {
            ($($field:ident),*) => {
                $(if let Some(v) = o.$field { self.$field = v; })*
            };
        }
        layer!(
            latency_weight,
            energy_weight,
            risk_weight,
            load_weight,
            spread_weight,
            network_weight,
            resilience_weight,
            saturation_threshold,
            saturation_penalty,
            prefer_prev_bonus,
            slo_weight,
            fallbacks,
            adaptive_penalty,
            adaptive_learning_rate
        );
        self
    }
}

/// Partial strategy table as written in `[strategies.<name>]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyOverrides {
    pub latency_weight: Option<f64>,
    pub energy_weight: Option<f64>,
    pub risk_weight: Option<f64>,
    pub load_weight: Option<f64>,
    pub spread_weight: Option<f64>,
    pub network_weight: Option<f64>,
    pub resilience_weight: Option<f64>,
    pub saturation_threshold: Option<f64>,
    pub saturation_penalty: Option<f64>,
    pub prefer_prev_bonus: Option<f64>,
    pub slo_weight: Option<f64>,
    pub fallbacks: Option<usize>,
    pub adaptive_penalty: Option<f64>,
    pub adaptive_learning_rate: Option<f64>,
}

/// Map a user-supplied strategy name to its canonical spelling.
///
/// Unknown names are returned lower-cased so custom strategies can still be
/// looked up in a registry.
pub fn canonical_strategy_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "fault-tolerant" | "ft" | "failover" => "resilient".to_string(),
        "balanced" | "load-balance" | "load-balanced" => "network-aware".to_string(),
        _ => name,
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Resolved weights for `name`: preset (or greedy for unknown names)
    /// with any `[strategies.<name>]` overrides layered on top.
    pub fn strategy(&self, name: &str) -> StrategyConfig {
        let canonical = canonical_strategy_name(name);
        let base = StrategyConfig::preset(&canonical).unwrap_or_default();
        match self.strategies.get(&canonical) {
            Some(overrides) => base.apply(overrides),
            None => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.cost, CostConfig::default());
        assert_eq!(config.engine.stale_retry_limit, 3);
        assert!(config.merger.override_log.is_none());
    }

    #[test]
    fn test_parse_sections() {
        let toml_str = r#"
[cost]
min_stage_ms = 20.0

[network]
latency_ms = 8.0

[merger]
override_log = "/tmp/overrides.jsonl"
poll_interval_ms = 100

[engine]
stale_retry_limit = 5
default_reservation_ttl_ms = 60000

[strategies.resilient]
risk_weight = 999.0
"#;
        let config = EngineConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.cost.min_stage_ms, 20.0);
        assert_eq!(config.cost.cpu_unit_divisor, 10.0);
        assert_eq!(config.network.latency_ms, 8.0);
        assert_eq!(config.network.bandwidth_mbps, 1000.0);
        assert_eq!(
            config.merger.override_log.as_deref(),
            Some(Path::new("/tmp/overrides.jsonl"))
        );
        assert_eq!(config.engine.default_reservation_ttl_ms, Some(60_000));

        let resilient = config.strategy("resilient");
        assert_eq!(resilient.risk_weight, 999.0);
        assert_eq!(resilient.load_weight, 380.0);
        assert_eq!(resilient.fallbacks, 1);
    }

    #[test]
    fn test_aliases_resolve_to_presets() {
        let config = EngineConfig::default();
        assert_eq!(config.strategy("FT"), StrategyConfig::resilient());
        assert_eq!(config.strategy("failover"), StrategyConfig::resilient());
        assert_eq!(config.strategy("balanced"), StrategyConfig::network_aware());
        assert_eq!(config.strategy("federated").fallbacks, 2);
        assert_eq!(config.strategy("greedy").fallbacks, 0);
    }

    #[test]
    fn test_unknown_strategy_falls_back_to_greedy_weights() {
        let config = EngineConfig::default();
        assert_eq!(config.strategy("my-custom"), StrategyConfig::greedy());
    }

    #[test]
    fn test_round_trip_toml() {
        let mut config = EngineConfig::default();
        config.strategies.insert(
            "federated".into(),
            StrategyOverrides {
                fallbacks: Some(4),
                ..Default::default()
            },
        );
        let text = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.strategy("federated").fallbacks, 4);
    }
}
