//! Domain types for the fabric state store.
//!
//! Nodes, links, and federations are created once from a validated
//! descriptor and only their dynamic fields change afterwards. Reservations
//! are created by a successful `try_reserve` and move to the released
//! history on release or expiry.

use std::collections::{BTreeMap, BTreeSet};

use fabric_core::{
    FederationId, HealthStatus, JobId, LinkId, NodeId, ReservationId, Resources,
};
use serde::{Deserialize, Serialize};

/// Thermal derate at or above which a node counts as "hot".
pub const HOT_DERATE: f64 = 0.25;

// ── Nodes ──────────────────────────────────────────────────────────

/// Static hardware profile used by the cost model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeProfile {
    /// Benchmark CPU score. Derived from core count when absent.
    pub cpu_units: Option<f64>,
    pub tdp_w: Option<f64>,
    /// Operator trust label in `[0, 1]`.
    pub trust: Option<f64>,
    pub ssd_wear_pct: f64,
    pub recent_crashes: u32,
    /// Execution formats the node can run, e.g. `native`, `cuda`, `wasm`.
    pub formats_supported: BTreeSet<String>,
    /// GPU acceleration score behind the `cuda` speedup.
    pub gpu_accel_score: Option<f64>,
    pub npu_tops: Option<f64>,
}

/// Per-node network hints used to estimate implicit links.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkHints {
    pub base_latency_ms: Option<f64>,
    pub loss_pct: Option<f64>,
    pub bandwidth_mbps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub federation: FederationId,
    /// Declared capacity. `allocated <= capacity` always holds.
    pub capacity: Resources,
    /// Sum of active reservation holds on this node.
    pub allocated: Resources,
    pub status: HealthStatus,
    /// Fraction of CPU lost to thermal throttling, in `[0, 1]`.
    pub thermal_derate: f64,
    pub profile: NodeProfile,
    pub network: NetworkHints,
    pub labels: BTreeMap<String, String>,
}

impl Node {
    /// Capacity that new reservations may be admitted against.
    ///
    /// Thermal derate shrinks the admissible CPU but never the declared
    /// capacity, so a hot node may temporarily run above its admissible
    /// level without breaking the capacity invariant.
    pub fn admissible(&self) -> Resources {
        let derate = self.thermal_derate.clamp(0.0, 1.0);
        Resources {
            cpu_millis: (self.capacity.cpu_millis as f64 * (1.0 - derate)).floor() as u64,
            ..self.capacity
        }
    }

    /// Room left for new reservations.
    pub fn free(&self) -> Resources {
        self.admissible().saturating_sub(&self.allocated)
    }

    /// Whether `request` could be admitted on top of the current allocation.
    pub fn can_admit(&self, request: &Resources) -> bool {
        self.status.is_available()
            && self
                .allocated
                .checked_add(request)
                .is_some_and(|total| total.fits_within(&self.admissible()))
    }

    /// Highest per-resource allocation ratio against declared capacity.
    pub fn load_fraction(&self) -> f64 {
        self.allocated.utilization(&self.capacity).clamp(0.0, 1.0)
    }

    pub fn is_hot(&self) -> bool {
        self.thermal_derate >= HOT_DERATE
    }

    pub fn supports_format(&self, format: &str) -> bool {
        self.profile.formats_supported.contains(format)
    }

    /// CPU benchmark units before derate.
    pub fn cpu_units(&self, units_per_core: f64) -> f64 {
        self.profile
            .cpu_units
            .unwrap_or_else(|| self.capacity.cpu_cores() * units_per_core)
    }
}

// ── Links ──────────────────────────────────────────────────────────

/// What a link's endpoints name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkScope {
    #[default]
    Node,
    Federation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    /// Canonical `{a}|{b}` key.
    pub id: LinkId,
    pub a: String,
    pub b: String,
    pub scope: LinkScope,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
    /// Declared bandwidth. `allocated_mbps <= bandwidth_mbps` always holds.
    pub bandwidth_mbps: u64,
    /// Throttle applied by an override; lowers admissible bandwidth only.
    pub bandwidth_limit_mbps: Option<u64>,
    pub allocated_mbps: u64,
    pub status: HealthStatus,
}

impl Link {
    pub fn admissible_mbps(&self) -> u64 {
        match self.bandwidth_limit_mbps {
            Some(limit) => limit.min(self.bandwidth_mbps),
            None => self.bandwidth_mbps,
        }
    }

    pub fn available_mbps(&self) -> u64 {
        self.admissible_mbps().saturating_sub(self.allocated_mbps)
    }

    pub fn connects(&self, x: &str, y: &str) -> bool {
        (self.a == x && self.b == y) || (self.a == y && self.b == x)
    }
}

// ── Federations ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Federation {
    pub id: FederationId,
    pub nodes: Vec<NodeId>,
    /// Cut off from every other federation.
    pub isolated: bool,
    /// Federations this one is partitioned from (kept symmetric).
    pub partitioned_from: BTreeSet<FederationId>,
}

impl Federation {
    pub fn is_partitioned(&self) -> bool {
        self.isolated || !self.partitioned_from.is_empty()
    }
}

// ── Reservations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    #[default]
    Active,
    Released,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHold {
    pub node: NodeId,
    pub amount: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHold {
    pub link: LinkId,
    pub mbps: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub job_id: JobId,
    pub stage_id: Option<String>,
    pub nodes: Vec<NodeHold>,
    pub links: Vec<LinkHold>,
    pub created_at_ms: u64,
    pub expires_at_ms: Option<u64>,
    pub status: ReservationStatus,
}

impl Reservation {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

/// Input to [`FabricStore::try_reserve`](crate::FabricStore::try_reserve).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub job_id: JobId,
    pub stage_id: Option<String>,
    pub nodes: Vec<NodeHold>,
    pub links: Vec<LinkHold>,
    pub ttl_ms: Option<u64>,
}

impl ReserveRequest {
    pub fn new(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            ..Default::default()
        }
    }

    pub fn stage(mut self, stage_id: impl Into<String>) -> Self {
        self.stage_id = Some(stage_id.into());
        self
    }

    pub fn node(mut self, node: impl Into<NodeId>, amount: Resources) -> Self {
        self.nodes.push(NodeHold {
            node: node.into(),
            amount,
        });
        self
    }

    pub fn link(mut self, link: impl Into<LinkId>, mbps: u64) -> Self {
        self.links.push(LinkHold {
            link: link.into(),
            mbps,
        });
        self
    }

    pub fn ttl(mut self, ttl_ms: Option<u64>) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node(cpu_millis: u64, derate: f64) -> Node {
        Node {
            id: "n1".into(),
            federation: "f1".into(),
            capacity: Resources::new(cpu_millis, 1024, 0),
            allocated: Resources::ZERO,
            status: HealthStatus::Up,
            thermal_derate: derate,
            profile: NodeProfile::default(),
            network: NetworkHints::default(),
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn derate_shrinks_admissible_cpu_only() {
        let node = make_node(10_000, 0.3);
        assert_eq!(node.admissible(), Resources::new(7000, 1024, 0));
        assert_eq!(node.capacity.cpu_millis, 10_000);
        assert!(node.is_hot());
    }

    #[test]
    fn can_admit_respects_status_and_free_capacity() {
        let mut node = make_node(10_000, 0.0);
        node.allocated = Resources::new(4000, 0, 0);
        assert!(node.can_admit(&Resources::new(6000, 0, 0)));
        assert!(!node.can_admit(&Resources::new(6001, 0, 0)));
        node.status = HealthStatus::Down;
        assert!(!node.can_admit(&Resources::new(1, 0, 0)));
    }

    #[test]
    fn cpu_units_falls_back_to_cores() {
        let mut node = make_node(4000, 0.0);
        assert_eq!(node.cpu_units(10.0), 40.0);
        node.profile.cpu_units = Some(123.0);
        assert_eq!(node.cpu_units(10.0), 123.0);
    }

    #[test]
    fn link_throttle_limits_admission() {
        let link = Link {
            id: "a|b".into(),
            a: "a".into(),
            b: "b".into(),
            scope: LinkScope::Node,
            latency_ms: 1.0,
            jitter_ms: 0.0,
            loss_pct: 0.0,
            bandwidth_mbps: 1000,
            bandwidth_limit_mbps: Some(300),
            allocated_mbps: 100,
            status: HealthStatus::Up,
        };
        assert_eq!(link.available_mbps(), 200);
        assert!(link.connects("b", "a"));
    }

    #[test]
    fn reservation_expiry() {
        let r = Reservation {
            id: "res-0000001".into(),
            job_id: "j".into(),
            stage_id: None,
            nodes: vec![],
            links: vec![],
            created_at_ms: 10,
            expires_at_ms: Some(20),
            status: ReservationStatus::Active,
        };
        assert!(!r.is_expired(19));
        assert!(r.is_expired(20));
    }
}
