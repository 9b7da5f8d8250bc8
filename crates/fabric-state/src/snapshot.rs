//! Immutable, versioned views of the fabric.
//!
//! A [`Snapshot`] is what planners read. It also answers the derived
//! questions planners ask: the effective path between two nodes and the
//! per-federation load and health overview.

use std::collections::BTreeMap;

use fabric_core::{
    FederationId, LinkId, NetworkDefaults, NodeId, ReservationId, Resources, link_key,
};
use serde::{Deserialize, Serialize};

use crate::types::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Strictly increasing; bumped by exactly one per state-changing mutation.
    pub version: u64,
    pub taken_at_ms: u64,
    pub nodes: BTreeMap<NodeId, Node>,
    pub links: BTreeMap<LinkId, Link>,
    pub federations: BTreeMap<FederationId, Federation>,
    /// Active reservations only.
    pub reservations: BTreeMap<ReservationId, Reservation>,
    pub network: NetworkDefaults,
}

/// Effective network path between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkPath {
    /// Declared links traversed. Empty for local and estimated paths.
    pub hops: Vec<LinkId>,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub loss_pct: f64,
    /// Bandwidth used for transfer-time estimates; zero on local paths.
    pub bandwidth_mbps: f64,
    /// Reservable bandwidth left on the tightest declared hop.
    /// `None` when no declared link is traversed.
    pub available_mbps: Option<u64>,
    /// A down path contributes infinite cost.
    pub down: bool,
    /// No declared link; metrics come from defaults and node hints.
    pub estimated: bool,
    pub cross_federation: bool,
}

impl LinkPath {
    /// Path from a node to itself.
    pub fn local() -> Self {
        Self {
            hops: Vec::new(),
            latency_ms: 0.0,
            jitter_ms: 0.0,
            loss_pct: 0.0,
            bandwidth_mbps: 0.0,
            available_mbps: None,
            down: false,
            estimated: false,
            cross_federation: false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.hops.is_empty() && !self.estimated
    }

    fn via(link: &Link, partitioned: bool, cross_federation: bool) -> Self {
        Self {
            hops: vec![link.id.clone()],
            latency_ms: link.latency_ms,
            jitter_ms: link.jitter_ms,
            loss_pct: link.loss_pct,
            bandwidth_mbps: link.admissible_mbps() as f64,
            available_mbps: Some(link.available_mbps()),
            down: partitioned || !link.status.is_available(),
            estimated: false,
            cross_federation,
        }
    }
}

// ── Federation overview ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationStats {
    pub name: FederationId,
    pub nodes: usize,
    pub total: Resources,
    pub free: Resources,
    /// Mean allocation ratio across resource kinds.
    pub load_factor: f64,
    pub down_nodes: usize,
    pub hot_nodes: usize,
    pub down_fraction: f64,
    pub hot_fraction: f64,
    pub active_reservations: usize,
    pub isolated: bool,
    pub partitioned_from: Vec<FederationId>,
}

/// Aggregate health of links crossing federation boundaries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrossLinkStats {
    pub links: usize,
    pub down: usize,
    pub worst_loss_pct: f64,
    pub mean_latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FederationOverview {
    pub federations: Vec<FederationStats>,
    pub cross_links: CrossLinkStats,
}

impl FederationOverview {
    pub fn get(&self, name: &str) -> Option<&FederationStats> {
        self.federations.iter().find(|f| f.name == name)
    }
}

impl Snapshot {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn link(&self, id: &str) -> Option<&Link> {
        self.links.get(id)
    }

    pub fn federation_of(&self, node: &str) -> Option<&str> {
        self.nodes.get(node).map(|n| n.federation.as_str())
    }

    /// Whether traffic between the two federations is cut.
    pub fn partitioned(&self, a: &str, b: &str) -> bool {
        if a == b {
            return false;
        }
        let cut = |x: &str, y: &str| {
            self.federations
                .get(x)
                .is_some_and(|f| f.isolated || f.partitioned_from.contains(y))
        };
        cut(a, b) || cut(b, a)
    }

    /// Whether the node's federation is cut off from anything.
    pub fn federation_partitioned(&self, node: &str) -> bool {
        self.federation_of(node)
            .and_then(|f| self.federations.get(f))
            .is_some_and(Federation::is_partitioned)
    }

    /// Resolve the effective path from `a` to `b`.
    ///
    /// Order: same node, explicit node link, federation link (across
    /// federations), then an estimate from network defaults and node hints.
    /// Unknown nodes yield a down estimated path.
    pub fn path_between(&self, a: &str, b: &str) -> LinkPath {
        if a == b {
            return LinkPath::local();
        }
        let (Some(na), Some(nb)) = (self.nodes.get(a), self.nodes.get(b)) else {
            return LinkPath {
                down: true,
                ..self.estimate(None, None)
            };
        };
        let cross = na.federation != nb.federation;
        let partitioned = self.partitioned(&na.federation, &nb.federation);

        if let Some(link) = self.links.get(&link_key(a, b)) {
            return LinkPath::via(link, partitioned, cross);
        }
        if cross {
            if let Some(link) = self.links.get(&link_key(&na.federation, &nb.federation)) {
                return LinkPath::via(link, partitioned, cross);
            }
        }
        LinkPath {
            down: partitioned,
            cross_federation: cross,
            ..self.estimate(Some(na), Some(nb))
        }
    }

    fn estimate(&self, a: Option<&Node>, b: Option<&Node>) -> LinkPath {
        let net = &self.network;
        let mut latency = net.latency_ms;
        let mut loss = net.loss_pct;
        let mut bandwidth = net.bandwidth_mbps;
        for node in [a, b].into_iter().flatten() {
            let hints = &node.network;
            latency = latency.max(hints.base_latency_ms.unwrap_or(latency));
            loss = loss.max(hints.loss_pct.unwrap_or(loss));
            bandwidth = bandwidth.min(hints.bandwidth_mbps.unwrap_or(bandwidth));
        }
        LinkPath {
            hops: Vec::new(),
            latency_ms: latency,
            jitter_ms: net.jitter_ms,
            loss_pct: loss,
            bandwidth_mbps: bandwidth,
            available_mbps: None,
            down: false,
            estimated: true,
            cross_federation: false,
        }
    }

    /// Per-federation load, health, and partition state.
    pub fn federation_overview(&self) -> FederationOverview {
        let mut reservations_by_fed: BTreeMap<&str, usize> = BTreeMap::new();
        for r in self.reservations.values() {
            let mut feds: Vec<&str> = r
                .nodes
                .iter()
                .filter_map(|h| self.federation_of(&h.node))
                .collect();
            feds.sort_unstable();
            feds.dedup();
            for f in feds {
                *reservations_by_fed.entry(f).or_default() += 1;
            }
        }

        let federations = self
            .federations
            .values()
            .map(|fed| {
                let members: Vec<&Node> =
                    fed.nodes.iter().filter_map(|id| self.nodes.get(id)).collect();
                let total: Resources = members.iter().map(|n| n.capacity).sum();
                let allocated: Resources = members.iter().map(|n| n.allocated).sum();
                let free: Resources = members
                    .iter()
                    .filter(|n| n.status.is_available())
                    .map(|n| n.free())
                    .sum();
                let count = members.len();
                let down_nodes = members.iter().filter(|n| !n.status.is_available()).count();
                let hot_nodes = members.iter().filter(|n| n.is_hot()).count();
                let fraction = |k: usize| if count == 0 { 0.0 } else { k as f64 / count as f64 };
                FederationStats {
                    name: fed.id.clone(),
                    nodes: count,
                    total,
                    free,
                    load_factor: allocated.mean_utilization(&total),
                    down_nodes,
                    hot_nodes,
                    down_fraction: fraction(down_nodes),
                    hot_fraction: fraction(hot_nodes),
                    active_reservations: reservations_by_fed
                        .get(fed.id.as_str())
                        .copied()
                        .unwrap_or(0),
                    isolated: fed.isolated,
                    partitioned_from: fed.partitioned_from.iter().cloned().collect(),
                }
            })
            .collect();

        FederationOverview {
            federations,
            cross_links: self.cross_link_stats(),
        }
    }

    fn cross_link_stats(&self) -> CrossLinkStats {
        let crossing: Vec<&Link> = self
            .links
            .values()
            .filter(|l| match l.scope {
                LinkScope::Federation => true,
                LinkScope::Node => self.federation_of(&l.a) != self.federation_of(&l.b),
            })
            .collect();
        if crossing.is_empty() {
            return CrossLinkStats::default();
        }
        CrossLinkStats {
            links: crossing.len(),
            down: crossing.iter().filter(|l| !l.status.is_available()).count(),
            worst_loss_pct: crossing.iter().map(|l| l.loss_pct).fold(0.0, f64::max),
            mean_latency_ms: crossing.iter().map(|l| l.latency_ms).sum::<f64>()
                / crossing.len() as f64,
        }
    }
}
