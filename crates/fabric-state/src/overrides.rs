//! Override events: externally injected health, derate, link, and partition
//! changes.
//!
//! On the wire an event is one JSON object with a `type` tag:
//!
//! ```json
//! {"id":"e1","timestamp_ms":1700000000000,"type":"node","node":"n1","status":"down"}
//! {"id":"e2","timestamp_ms":1700000000500,"type":"federation_partition","a":"east","b":"west"}
//! ```
//!
//! Each event expands into per-field writes. A write only lands if its
//! `(timestamp_ms, seq, id)` stamp is newer than the stamp already recorded
//! for that field, so duplicates and late arrivals are no-ops.

use std::collections::{BTreeMap, HashMap};

use fabric_core::{FederationId, HealthStatus, LinkId, NodeId, link_endpoints, link_key};
use serde::{Deserialize, Serialize};

use crate::types::{Federation, Link, Node};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideEvent {
    /// Filled in by the store when empty.
    #[serde(default)]
    pub id: String,
    /// Filled in with the current time when zero.
    #[serde(default)]
    pub timestamp_ms: u64,
    /// Tie-breaker for events sharing a timestamp.
    #[serde(default)]
    pub seq: u64,
    #[serde(flatten)]
    pub action: OverrideAction,
}

impl OverrideEvent {
    pub fn new(id: impl Into<String>, timestamp_ms: u64, action: OverrideAction) -> Self {
        Self {
            id: id.into(),
            timestamp_ms,
            seq: 0,
            action,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    pub(crate) fn stamp(&self) -> Stamp {
        Stamp {
            timestamp_ms: self.timestamp_ms,
            seq: self.seq,
            id: self.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OverrideAction {
    Node {
        node: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<HealthStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thermal_derate: Option<f64>,
    },
    Link {
        /// `a|b` in either order.
        link: LinkId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<HealthStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        latency_ms: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter_ms: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loss_pct: Option<f64>,
        /// Throttle on admissible bandwidth; `0` removes the throttle.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bandwidth_limit_mbps: Option<u64>,
    },
    /// Every node in the federation goes down.
    FederationBlackout { federation: FederationId },
    /// Every node in the federation comes back up.
    FederationRecover { federation: FederationId },
    FederationPartition { a: FederationId, b: FederationId },
    FederationHeal { a: FederationId, b: FederationId },
    FederationIsolate {
        federation: FederationId,
        #[serde(default = "default_isolated")]
        isolated: bool,
    },
    /// Applied atomically; later actions win over earlier ones.
    Group { actions: Vec<OverrideAction> },
}

fn default_isolated() -> bool {
    true
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideOutcome {
    pub event_id: String,
    /// False when every write was superseded or already in place.
    pub changed: bool,
    pub version: u64,
}

/// Result of applying a batch of events under one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideReport {
    pub applied: Vec<String>,
    pub unchanged: Vec<String>,
    /// `(event id, reason)` for dropped events.
    pub rejected: Vec<(String, String)>,
    pub version: u64,
}

// ── Field-level merge ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Stamp {
    pub timestamp_ms: u64,
    pub seq: u64,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum FieldKey {
    NodeStatus(NodeId),
    NodeDerate(NodeId),
    LinkStatus(LinkId),
    LinkLatency(LinkId),
    LinkJitter(LinkId),
    LinkLoss(LinkId),
    LinkLimit(LinkId),
    FederationIsolated(FederationId),
    /// Endpoints sorted.
    FederationPartition(FederationId, FederationId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum FieldValue {
    Status(HealthStatus),
    Number(f64),
    Limit(Option<u64>),
    Flag(bool),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FieldWrite {
    pub key: FieldKey,
    pub value: FieldValue,
}

/// Read-only view of the topology needed to expand and validate actions.
pub(crate) struct TopologyView<'a> {
    pub nodes: &'a BTreeMap<NodeId, Node>,
    pub links: &'a BTreeMap<LinkId, Link>,
    pub federations: &'a BTreeMap<FederationId, Federation>,
}

impl TopologyView<'_> {
    /// Expand an action into validated field writes, last write per field
    /// winning. Nothing is applied if any part is invalid.
    pub fn expand(&self, action: &OverrideAction) -> Result<Vec<FieldWrite>, String> {
        let mut writes = Vec::new();
        self.expand_into(action, &mut writes)?;

        let mut last: HashMap<&FieldKey, usize> = HashMap::new();
        for (i, w) in writes.iter().enumerate() {
            last.insert(&w.key, i);
        }
        let keep: Vec<bool> = (0..writes.len())
            .map(|i| last.get(&writes[i].key) == Some(&i))
            .collect();
        Ok(writes
            .iter()
            .zip(keep)
            .filter(|(_, k)| *k)
            .map(|(w, _)| w.clone())
            .collect())
    }

    fn expand_into(&self, action: &OverrideAction, out: &mut Vec<FieldWrite>) -> Result<(), String> {
        match action {
            OverrideAction::Node {
                node,
                status,
                thermal_derate,
            } => {
                if !self.nodes.contains_key(node) {
                    return Err(format!("unknown node {node}"));
                }
                if status.is_none() && thermal_derate.is_none() {
                    return Err(format!("node override for {node} changes nothing"));
                }
                if let Some(status) = status {
                    out.push(write(FieldKey::NodeStatus(node.clone()), FieldValue::Status(*status)));
                }
                if let Some(derate) = thermal_derate {
                    if !derate.is_finite() || !(0.0..=1.0).contains(derate) {
                        return Err(format!("thermal_derate {derate} out of [0, 1]"));
                    }
                    out.push(write(FieldKey::NodeDerate(node.clone()), FieldValue::Number(*derate)));
                }
            }
            OverrideAction::Link {
                link,
                status,
                latency_ms,
                jitter_ms,
                loss_pct,
                bandwidth_limit_mbps,
            } => {
                let id = self.resolve_link(link)?;
                let before = out.len();
                if let Some(status) = status {
                    out.push(write(FieldKey::LinkStatus(id.clone()), FieldValue::Status(*status)));
                }
                for (value, key) in [
                    (latency_ms, FieldKey::LinkLatency(id.clone())),
                    (jitter_ms, FieldKey::LinkJitter(id.clone())),
                    (loss_pct, FieldKey::LinkLoss(id.clone())),
                ] {
                    if let Some(v) = value {
                        if !v.is_finite() || *v < 0.0 {
                            return Err(format!("link {id}: negative or non-finite metric {v}"));
                        }
                        if matches!(key, FieldKey::LinkLoss(_)) && *v > 100.0 {
                            return Err(format!("link {id}: loss_pct {v} above 100"));
                        }
                        out.push(write(key, FieldValue::Number(*v)));
                    }
                }
                if let Some(limit) = bandwidth_limit_mbps {
                    let limit = (*limit > 0).then_some(*limit);
                    out.push(write(FieldKey::LinkLimit(id.clone()), FieldValue::Limit(limit)));
                }
                if out.len() == before {
                    return Err(format!("link override for {id} changes nothing"));
                }
            }
            OverrideAction::FederationBlackout { federation }
            | OverrideAction::FederationRecover { federation } => {
                let fed = self
                    .federations
                    .get(federation)
                    .ok_or_else(|| format!("unknown federation {federation}"))?;
                let status = if matches!(action, OverrideAction::FederationBlackout { .. }) {
                    HealthStatus::Down
                } else {
                    HealthStatus::Up
                };
                for node in &fed.nodes {
                    out.push(write(FieldKey::NodeStatus(node.clone()), FieldValue::Status(status)));
                }
            }
            OverrideAction::FederationPartition { a, b } | OverrideAction::FederationHeal { a, b } => {
                for fed in [a, b] {
                    if !self.federations.contains_key(fed) {
                        return Err(format!("unknown federation {fed}"));
                    }
                }
                if a == b {
                    return Err(format!("cannot partition {a} from itself"));
                }
                let cut = matches!(action, OverrideAction::FederationPartition { .. });
                let (x, y) = if a <= b { (a, b) } else { (b, a) };
                out.push(write(
                    FieldKey::FederationPartition(x.clone(), y.clone()),
                    FieldValue::Flag(cut),
                ));
            }
            OverrideAction::FederationIsolate {
                federation,
                isolated,
            } => {
                if !self.federations.contains_key(federation) {
                    return Err(format!("unknown federation {federation}"));
                }
                out.push(write(
                    FieldKey::FederationIsolated(federation.clone()),
                    FieldValue::Flag(*isolated),
                ));
            }
            OverrideAction::Group { actions } => {
                if actions.is_empty() {
                    return Err("empty group".to_string());
                }
                for inner in actions {
                    self.expand_into(inner, out)?;
                }
            }
        }
        Ok(())
    }

    fn resolve_link(&self, raw: &str) -> Result<LinkId, String> {
        let (a, b) = link_endpoints(raw).ok_or_else(|| format!("malformed link id {raw:?}"))?;
        let id = link_key(a, b);
        if self.links.contains_key(&id) {
            Ok(id)
        } else {
            Err(format!("unknown link {id}"))
        }
    }
}

fn write(key: FieldKey, value: FieldValue) -> FieldWrite {
    FieldWrite { key, value }
}

/// Rebuild the single-field event that reproduces `value` for `key`.
pub(crate) fn export_event(key: &FieldKey, value: FieldValue, stamp: &Stamp) -> OverrideEvent {
    let number = |v: FieldValue| match v {
        FieldValue::Number(n) => Some(n),
        _ => None,
    };
    let status = |v: FieldValue| match v {
        FieldValue::Status(s) => Some(s),
        _ => None,
    };
    let flag = matches!(value, FieldValue::Flag(true));

    let action = match key {
        FieldKey::NodeStatus(node) => OverrideAction::Node {
            node: node.clone(),
            status: status(value),
            thermal_derate: None,
        },
        FieldKey::NodeDerate(node) => OverrideAction::Node {
            node: node.clone(),
            status: None,
            thermal_derate: number(value),
        },
        FieldKey::LinkStatus(id) => OverrideAction::Link {
            link: id.clone(),
            status: status(value),
            latency_ms: None,
            jitter_ms: None,
            loss_pct: None,
            bandwidth_limit_mbps: None,
        },
        FieldKey::LinkLatency(id) | FieldKey::LinkJitter(id) | FieldKey::LinkLoss(id) => {
            let v = number(value);
            OverrideAction::Link {
                link: id.clone(),
                status: None,
                latency_ms: v.filter(|_| matches!(key, FieldKey::LinkLatency(_))),
                jitter_ms: v.filter(|_| matches!(key, FieldKey::LinkJitter(_))),
                loss_pct: v.filter(|_| matches!(key, FieldKey::LinkLoss(_))),
                bandwidth_limit_mbps: None,
            }
        }
        FieldKey::LinkLimit(id) => OverrideAction::Link {
            link: id.clone(),
            status: None,
            latency_ms: None,
            jitter_ms: None,
            loss_pct: None,
            bandwidth_limit_mbps: Some(match value {
                FieldValue::Limit(limit) => limit.unwrap_or(0),
                _ => 0,
            }),
        },
        FieldKey::FederationIsolated(federation) => OverrideAction::FederationIsolate {
            federation: federation.clone(),
            isolated: flag,
        },
        FieldKey::FederationPartition(a, b) if flag => OverrideAction::FederationPartition {
            a: a.clone(),
            b: b.clone(),
        },
        FieldKey::FederationPartition(a, b) => OverrideAction::FederationHeal {
            a: a.clone(),
            b: b.clone(),
        },
    };

    OverrideEvent {
        id: stamp.id.clone(),
        timestamp_ms: stamp.timestamp_ms,
        seq: stamp.seq,
        action,
    }
}
