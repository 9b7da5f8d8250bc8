//! Cost model: deterministic latency, energy, and risk estimates.
//!
//! Every term is monotonic in the stress it models. Raising a node's load
//! or derate, or a path's loss, never lowers the corresponding output. The
//! model is pure and can be shared across threads without locking.

use fabric_core::{CostConfig, Resources};
use fabric_state::{LinkPath, Node};
use serde::{Deserialize, Serialize};

use crate::job::Stage;

/// Everything the model needs to cost one stage on one node.
#[derive(Debug, Clone, Copy)]
pub struct CostInput<'a> {
    pub node: &'a Node,
    /// Node allocation before this stage is added (includes earlier stages
    /// of the same plan).
    pub allocated: Resources,
    /// Inbound path from the previous stage's node.
    pub path: &'a LinkPath,
    pub stage: &'a Stage,
    /// The node's federation is partitioned or isolated.
    pub federation_partitioned: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// compute + queue + transfer + path latency and jitter.
    pub latency_ms: f64,
    pub compute_ms: f64,
    pub queue_ms: f64,
    pub transfer_ms: f64,
    pub energy_kj: f64,
    /// Bounded to `[0, 1]`.
    pub risk: f64,
}

#[derive(Debug, Clone, Default)]
pub struct CostModel {
    config: CostConfig,
}

impl CostModel {
    pub fn new(config: CostConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }

    pub fn estimate(&self, input: CostInput<'_>) -> CostEstimate {
        let CostInput {
            node,
            allocated,
            path,
            stage,
            federation_partitioned,
        } = input;

        let load = allocated.utilization(&node.capacity).clamp(0.0, 1.0);
        let compute_ms = self.compute_ms(node, stage);
        let queue_ms = self.queue_ms(compute_ms, load);
        let transfer_ms = self.transfer_ms(path, stage.size_mb);
        let path_ms = if path.is_local() {
            0.0
        } else if path.down {
            f64::INFINITY
        } else {
            path.latency_ms + path.jitter_ms
        };

        let load_after = (allocated + stage.resources).utilization(&node.capacity);
        CostEstimate {
            latency_ms: compute_ms + queue_ms + transfer_ms + path_ms,
            compute_ms,
            queue_ms,
            transfer_ms,
            energy_kj: self.energy_kj(node, load_after, compute_ms + queue_ms),
            risk: self.risk(node, path, federation_partitioned),
        }
    }

    /// Service time of `stage` on `node`, slowed by thermal derate and
    /// scaled by the format speedup.
    pub fn compute_ms(&self, node: &Node, stage: &Stage) -> f64 {
        let c = &self.config;
        let derate = node.thermal_derate.clamp(0.0, 1.0);
        let units = node.cpu_units(c.cpu_units_per_core) * (1.0 - derate);
        let mut work = stage.size_mb.max(0.0) * c.work_per_mb
            + stage.resources.cpu_cores() * c.work_per_core;
        if stage.io_bound {
            work *= c.io_bound_factor;
        }
        let speed = (units / c.cpu_unit_divisor.max(f64::EPSILON)).max(1.0)
            * self.format_speedup(node, stage);
        (work / speed).max(c.min_stage_ms)
    }

    /// Speed multiplier from the execution formats `node` offers and
    /// `stage` accepts. `1.0` is plain native execution.
    pub fn format_speedup(&self, node: &Node, stage: &Stage) -> f64 {
        let c = &self.config;
        let allowed = &stage.allowed_formats;
        if !allowed.is_empty() && stage.format_on(node).is_none() {
            return c.format_mismatch_factor.max(f64::EPSILON);
        }
        let usable = |format: &str| {
            node.supports_format(format)
                && !stage.disallowed_formats.iter().any(|f| f == format)
                && (allowed.is_empty() || allowed.iter().any(|f| f == format))
        };

        let mut mult: f64 = 1.0;
        if usable("cuda") {
            let score = node.profile.gpu_accel_score.unwrap_or(0.0);
            let boost = c.cuda_base_boost * (1.0 + score / 10.0);
            mult = mult.max(boost.clamp(1.0, c.cuda_max_boost.max(1.0)));
        }
        if usable("npu") {
            let tops = node.profile.npu_tops.unwrap_or(0.0);
            let boost = 1.0 + tops / c.npu_tops_per_boost.max(f64::EPSILON);
            mult = mult.max(boost.clamp(1.0, c.npu_max_boost.max(1.0)));
        }
        let wasm_only = allowed.iter().any(|f| f == "wasm") && !allowed.iter().any(|f| f == "native");
        if node.supports_format("wasm") && wasm_only {
            mult /= c.wasm_penalty.max(f64::EPSILON);
        }
        mult
    }

    /// Waiting time in proportion to the node's current load fraction.
    pub fn queue_ms(&self, compute_ms: f64, load: f64) -> f64 {
        compute_ms * self.config.queue_factor * load.clamp(0.0, 1.0)
    }

    /// Time to push `size_mb` across `path`. Infinite on a down path.
    pub fn transfer_ms(&self, path: &LinkPath, size_mb: f64) -> f64 {
        if path.is_local() || size_mb <= 0.0 {
            return 0.0;
        }
        if path.down {
            return f64::INFINITY;
        }
        let c = &self.config;
        let loss = (path.loss_pct / 100.0).clamp(0.0, c.loss_penalty_ceil);
        let effective_mbps = path.bandwidth_mbps * c.proto_overhead * (1.0 - loss);
        size_mb * 8.0 / effective_mbps.max(1.0) * 1000.0
    }

    /// Energy for `busy_ms` at utilization `load_after`.
    ///
    /// Power rises convexly with utilization and picks up a surcharge past
    /// the saturation knee.
    pub fn energy_kj(&self, node: &Node, load_after: f64, busy_ms: f64) -> f64 {
        let c = &self.config;
        let tdp = node.profile.tdp_w.unwrap_or(c.default_tdp_w).max(0.0);
        let derate = node.thermal_derate.clamp(0.0, 1.0);
        let util = load_after.clamp(0.05, 1.0);
        let util_eff = (util * (1.0 + 0.2 * derate)).min(1.0);

        let idle_w = tdp * c.idle_fraction;
        let mut watts = idle_w + (tdp - idle_w) * util_eff.powf(c.util_exponent);
        if util > c.saturation_knee && c.saturation_knee < 1.0 {
            let over = (util - c.saturation_knee) / (1.0 - c.saturation_knee);
            watts *= 1.0 + c.saturation_surcharge * over;
        }
        watts * (busy_ms / 1000.0) / 1000.0
    }

    /// Weighted, clamped risk of running on `node` behind `path`.
    pub fn risk(&self, node: &Node, path: &LinkPath, federation_partitioned: bool) -> f64 {
        let c = &self.config;
        let unit = |v: f64| if v.is_finite() { v.clamp(0.0, 1.0) } else { 1.0 };

        let trust = node.profile.trust.unwrap_or(c.default_trust);
        let link = if path.down {
            1.0
        } else {
            unit(path.loss_pct / c.loss_saturation_pct.max(f64::EPSILON))
        };
        let r = c.risk_weight_health * node.status.degradation()
            + c.risk_weight_trust * (1.0 - unit(trust))
            + c.risk_weight_ssd_wear * unit(node.profile.ssd_wear_pct / 100.0)
            + c.risk_weight_crash
                * unit(node.profile.recent_crashes as f64 / c.crash_saturation.max(f64::EPSILON))
            + c.risk_weight_thermal * unit(node.thermal_derate)
            + c.risk_weight_link_loss * link
            + c.risk_weight_partition * if federation_partitioned { 1.0 } else { 0.0 };
        unit(r)
    }

    /// Smooth penalty once `latency_ms` passes `deadline_ms`; zero before.
    pub fn slo_penalty(&self, deadline_ms: f64, latency_ms: f64) -> f64 {
        if deadline_ms <= 0.0 || !latency_ms.is_finite() {
            return 0.0;
        }
        let ratio = (latency_ms / deadline_ms.max(1.0)).clamp(0.0, 100.0);
        if ratio <= 1.0 {
            return 0.0;
        }
        (ratio.powf(self.config.slo_alpha) - 1.0) / self.config.slo_beta.max(1e-6)
    }
}
