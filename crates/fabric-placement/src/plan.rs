//! Placement plans returned by strategies.

use std::collections::BTreeSet;

use fabric_core::{FederationId, JobId, NodeId, Resources};
use fabric_state::{LinkHold, LinkPath, NodeHold, ReserveRequest};
use serde::{Deserialize, Serialize};

use crate::cost::CostEstimate;

/// Per-stage penalty terms, in score units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub latency: f64,
    pub energy: f64,
    pub risk_penalty: f64,
    pub load_penalty: f64,
    pub spread_penalty: f64,
    pub network_penalty: f64,
    pub resilience_penalty: f64,
    pub saturation_penalty: f64,
    pub adaptive_penalty: f64,
    pub prefer_prev_bonus: f64,
    /// Federation load after this stage, in `[0, 1]`.
    pub projected_load: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageAssignment {
    pub stage_id: String,
    pub node: NodeId,
    pub federation: FederationId,
    /// Execution format picked from the stage's allowed formats.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Inbound path from the previous stage's node.
    pub path: LinkPath,
    pub resources: Resources,
    /// Bandwidth held on each declared hop of `path`.
    pub link_mbps: u64,
    pub cost: CostEstimate,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

impl StageAssignment {
    /// The hold this stage needs from the store.
    pub fn reserve_request(&self, job_id: &str, ttl_ms: Option<u64>) -> ReserveRequest {
        let links = if self.link_mbps > 0 {
            self.path
                .hops
                .iter()
                .map(|hop| LinkHold {
                    link: hop.clone(),
                    mbps: self.link_mbps,
                })
                .collect()
        } else {
            Vec::new()
        };
        ReserveRequest {
            job_id: job_id.to_string(),
            stage_id: Some(self.stage_id.clone()),
            nodes: vec![NodeHold {
                node: self.node.clone(),
                amount: self.resources,
            }],
            links,
            ttl_ms,
        }
    }
}

/// Aggregate plan score. Lower is better.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanScore {
    pub latency_ms: f64,
    pub energy_kj: f64,
    /// Mean stage risk.
    pub risk: f64,
    pub slo_penalty: f64,
    pub total: f64,
}

impl PlanScore {
    pub fn from_stages(stages: &[StageAssignment], slo_penalty: f64, slo_weight: f64) -> Self {
        let latency_ms = stages.iter().map(|s| s.cost.latency_ms).sum();
        let energy_kj = stages.iter().map(|s| s.cost.energy_kj).sum();
        let risk = if stages.is_empty() {
            0.0
        } else {
            stages.iter().map(|s| s.cost.risk).sum::<f64>() / stages.len() as f64
        };
        Self {
            latency_ms,
            energy_kj,
            risk,
            slo_penalty,
            total: stages.iter().map(|s| s.score).sum::<f64>() + slo_weight * slo_penalty,
        }
    }
}

/// Standby placement, not reserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPlan {
    /// 1 for the best fallback.
    pub rank: usize,
    pub assignments: Vec<StageAssignment>,
    pub score: PlanScore,
    /// Every stage avoids the primary's node, federation, and inbound links.
    pub disjoint: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Feasibility {
    Feasible,
    Infeasible { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanMetrics {
    pub federations_in_use: Vec<FederationId>,
    /// Distinct primary federations per stage.
    pub federation_spread: f64,
    /// Share of stages with a fallback on a different node.
    pub resilience_score: f64,
    /// Share of fallback stage assignments in a different federation than
    /// the primary.
    pub cross_federation_fallback_ratio: f64,
}

impl PlanMetrics {
    pub fn compute(primary: &[StageAssignment], fallbacks: &[FallbackPlan]) -> Self {
        if primary.is_empty() {
            return Self::default();
        }
        let federations: BTreeSet<&str> = primary.iter().map(|s| s.federation.as_str()).collect();
        let covered = primary
            .iter()
            .enumerate()
            .filter(|(i, s)| {
                fallbacks
                    .iter()
                    .any(|f| f.assignments.get(*i).is_some_and(|a| a.node != s.node))
            })
            .count();
        let (mut fallback_stages, mut cross) = (0usize, 0usize);
        for fallback in fallbacks {
            for (i, a) in fallback.assignments.iter().enumerate() {
                fallback_stages += 1;
                if primary.get(i).is_some_and(|p| p.federation != a.federation) {
                    cross += 1;
                }
            }
        }
        Self {
            federations_in_use: federations.iter().map(|f| f.to_string()).collect(),
            federation_spread: federations.len() as f64 / primary.len() as f64,
            resilience_score: covered as f64 / primary.len() as f64,
            cross_federation_fallback_ratio: if fallback_stages == 0 {
                0.0
            } else {
                cross as f64 / fallback_stages as f64
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementPlan {
    pub job_id: JobId,
    pub strategy: String,
    /// Snapshot the plan was computed against.
    pub snapshot_version: u64,
    pub primary: Vec<StageAssignment>,
    pub fallbacks: Vec<FallbackPlan>,
    pub score: PlanScore,
    pub verdict: Feasibility,
    /// Some fallback stage could not avoid the primary's failure domain.
    pub degraded_fallback: bool,
    pub metrics: PlanMetrics,
}

impl PlacementPlan {
    pub fn infeasible(
        job_id: impl Into<JobId>,
        strategy: impl Into<String>,
        snapshot_version: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            strategy: strategy.into(),
            snapshot_version,
            primary: Vec::new(),
            fallbacks: Vec::new(),
            score: PlanScore::default(),
            verdict: Feasibility::Infeasible {
                reason: reason.into(),
            },
            degraded_fallback: false,
            metrics: PlanMetrics::default(),
        }
    }

    pub fn is_feasible(&self) -> bool {
        matches!(self.verdict, Feasibility::Feasible)
    }

    pub fn infeasible_reason(&self) -> Option<&str> {
        match &self.verdict {
            Feasibility::Infeasible { reason } => Some(reason),
            Feasibility::Feasible => None,
        }
    }

    /// Primary nodes in stage order.
    pub fn nodes(&self) -> Vec<&str> {
        self.primary.iter().map(|s| s.node.as_str()).collect()
    }
}

/// What happened when a plan was committed; fed back to learning strategies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanFeedback {
    Committed,
    /// Commit failed on `node` because the fabric changed under the plan.
    Stale { node: Option<NodeId> },
    /// Commit failed on `node` with no drift detected.
    PartialInfeasible { node: Option<NodeId> },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(stage: &str, node: &str, fed: &str, score: f64) -> StageAssignment {
        StageAssignment {
            stage_id: stage.into(),
            node: node.into(),
            federation: fed.into(),
            format: None,
            path: LinkPath::local(),
            resources: Resources::new(1000, 0, 0),
            link_mbps: 0,
            cost: CostEstimate {
                latency_ms: 10.0,
                risk: 0.2,
                ..Default::default()
            },
            score,
            breakdown: ScoreBreakdown::default(),
        }
    }

    #[test]
    fn score_sums_stages_and_weights_slo() {
        let stages = vec![assignment("a", "n1", "f", 5.0), assignment("b", "n2", "f", 7.0)];
        let score = PlanScore::from_stages(&stages, 10.0, 0.5);
        assert_eq!(score.latency_ms, 20.0);
        assert!((score.risk - 0.2).abs() < 1e-12);
        assert_eq!(score.total, 17.0);
    }

    #[test]
    fn metrics_measure_spread_and_fallback_coverage() {
        let primary = vec![assignment("a", "n1", "east", 1.0), assignment("b", "n2", "west", 1.0)];
        let fallback = FallbackPlan {
            rank: 1,
            assignments: vec![
                assignment("a", "n3", "west", 1.0),
                assignment("b", "n2", "west", 1.0),
            ],
            score: PlanScore::default(),
            disjoint: false,
        };
        let m = PlanMetrics::compute(&primary, &[fallback]);
        assert_eq!(m.federations_in_use, vec!["east".to_string(), "west".to_string()]);
        assert_eq!(m.federation_spread, 1.0);
        assert_eq!(m.resilience_score, 0.5);
        assert_eq!(m.cross_federation_fallback_ratio, 0.5);
    }

    #[test]
    fn reserve_request_holds_bandwidth_on_each_hop() {
        let mut a = assignment("b", "n2", "f", 1.0);
        a.path.hops = vec!["n1|n2".into()];
        a.link_mbps = 50;
        let req = a.reserve_request("job", Some(1000));
        assert_eq!(req.nodes.len(), 1);
        assert_eq!(req.links[0].mbps, 50);
        assert_eq!(req.ttl_ms, Some(1000));
        assert_eq!(req.stage_id.as_deref(), Some("b"));
    }
}
