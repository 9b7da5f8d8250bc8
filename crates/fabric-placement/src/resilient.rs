//! Resilient planner: load, spread, network, and resilience aware scoring
//! with disjoint fallback plans.
//!
//! The same planner serves three modes that differ only in their weights:
//! `resilient`, `network-aware`, and `federated`.
//!
//! Fallbacks are standby placements. They are scored against the snapshot
//! as it would look after the primary is reserved, and each fallback stage
//! is chosen from the most disjoint tier available relative to the primary
//! stage it backs:
//!
//! 1. different node, different federation, no shared inbound link
//! 2. different node, no shared inbound link
//! 3. different node
//! 4. anything feasible
//!
//! Falling below tier 1 anywhere marks the plan `degraded_fallback`.

use std::collections::BTreeSet;

use fabric_core::StrategyConfig;
use fabric_state::Snapshot;
use tracing::{debug, warn};

use crate::candidates::{
    Candidate, Ledger, Scored, StageRequest, by_score, feasible_candidates, finish, plan_chain,
};
use crate::cost::CostModel;
use crate::job::Job;
use crate::plan::{FallbackPlan, PlacementPlan, PlanScore, ScoreBreakdown, StageAssignment};
use crate::registry::PlacementStrategy;

#[derive(Debug, Clone)]
pub struct ResilientPlanner {
    name: String,
}

impl ResilientPlanner {
    /// `name` is the mode reported on plans: `resilient`, `network-aware`,
    /// or `federated`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PlacementStrategy for ResilientPlanner {
    fn name(&self) -> &str {
        &self.name
    }

    fn plan(
        &self,
        job: &Job,
        snapshot: &Snapshot,
        cost: &CostModel,
        config: &StrategyConfig,
    ) -> PlacementPlan {
        let mut ledger = Ledger::new(snapshot);
        let primary = plan_chain(job, &mut ledger, cost, |c, l, r| score(c, l, r, config));

        let (fallbacks, degraded) = match &primary {
            Ok(primary) if config.fallbacks > 0 => {
                plan_fallbacks(job, primary, &ledger, cost, config)
            }
            _ => (Vec::new(), false),
        };
        debug!(
            job = %job.id,
            mode = %self.name,
            version = snapshot.version,
            feasible = primary.is_ok(),
            fallbacks = fallbacks.len(),
            degraded,
            "resilient plan computed"
        );
        finish(job, &self.name, snapshot, cost, config, primary, fallbacks, degraded)
    }
}

/// Score one candidate. Lower is better.
pub(crate) fn score(
    candidate: &Candidate<'_>,
    ledger: &Ledger<'_>,
    req: &StageRequest<'_>,
    config: &StrategyConfig,
) -> (f64, ScoreBreakdown) {
    let node = candidate.node;
    let (down_fraction, hot_fraction) = ledger
        .federation_stats(&node.federation)
        .map_or((0.0, 0.0), |s| (s.down_fraction, s.hot_fraction));

    let path = &candidate.path;
    let network = if path.is_local() {
        0.0
    } else {
        let down = if path.down { 1.0 } else { 0.0 };
        down + (path.loss_pct / 10.0).clamp(0.0, 1.0)
    };

    let breakdown = ScoreBreakdown {
        latency: config.latency_weight * candidate.cost.latency_ms,
        energy: config.energy_weight * candidate.cost.energy_kj,
        risk_penalty: config.risk_weight * candidate.cost.risk,
        load_penalty: config.load_weight * candidate.projected_load,
        spread_penalty: config.spread_weight * ledger.stages_in(&node.federation) as f64,
        network_penalty: config.network_weight * network,
        resilience_penalty: config.resilience_weight * (down_fraction + hot_fraction),
        saturation_penalty: if candidate.projected_load >= config.saturation_threshold {
            config.saturation_penalty
        } else {
            0.0
        },
        adaptive_penalty: 0.0,
        prefer_prev_bonus: if req.prev_node == Some(node.id.as_str()) {
            config.prefer_prev_bonus
        } else {
            0.0
        },
        projected_load: candidate.projected_load,
    };
    let total = breakdown.latency
        + breakdown.energy
        + breakdown.risk_penalty
        + breakdown.load_penalty
        + breakdown.spread_penalty
        + breakdown.network_penalty
        + breakdown.resilience_penalty
        + breakdown.saturation_penalty
        - breakdown.prefer_prev_bonus;
    (total, breakdown)
}

/// 0 is fully disjoint from `primary`, 3 shares its node.
fn disjoint_tier(candidate: &Candidate<'_>, primary: &StageAssignment) -> u8 {
    if candidate.node.id == primary.node {
        return 3;
    }
    let primary_hops: BTreeSet<&str> = primary.path.hops.iter().map(String::as_str).collect();
    let shares_link = candidate
        .path
        .hops
        .iter()
        .any(|h| primary_hops.contains(h.as_str()));
    match (candidate.node.federation == primary.federation, shares_link) {
        (false, false) => 0,
        (_, false) => 1,
        _ => 2,
    }
}

fn plan_fallbacks(
    job: &Job,
    primary: &[StageAssignment],
    after_primary: &Ledger<'_>,
    cost: &CostModel,
    config: &StrategyConfig,
) -> (Vec<FallbackPlan>, bool) {
    let stages = job.effective_stages();
    let mut fallbacks: Vec<FallbackPlan> = Vec::with_capacity(config.fallbacks);
    let mut degraded = false;

    'ranks: for rank in 1..=config.fallbacks {
        let mut ledger = after_primary.clone();
        let mut assignments = Vec::with_capacity(stages.len());
        let mut disjoint = true;
        let mut latency_so_far = 0.0;

        for (i, stage) in stages.iter().enumerate() {
            let Some(backed) = primary.get(i) else {
                break;
            };
            let req = StageRequest {
                job,
                stage,
                prev_node: i.checked_sub(1).and_then(|p| primary.get(p)).map(|p| p.node.as_str()),
                latency_so_far,
            };
            let (candidates, pruned) = feasible_candidates(&ledger, cost, &req);
            let used_before: BTreeSet<&str> = fallbacks
                .iter()
                .filter_map(|f| f.assignments.get(i))
                .map(|a| a.node.as_str())
                .collect();

            let best = candidates
                .into_iter()
                .map(|candidate| {
                    let tier = disjoint_tier(&candidate, backed);
                    let reused = used_before.contains(candidate.node.id.as_str());
                    let (score, breakdown) = score(&candidate, &ledger, &req, config);
                    (tier, reused, Scored { candidate, score, breakdown })
                })
                .min_by(|a, b| {
                    a.0.cmp(&b.0)
                        .then_with(|| a.1.cmp(&b.1))
                        .then_with(|| by_score(&a.2, &b.2))
                });

            let Some((tier, _, best)) = best else {
                warn!(
                    job = %job.id,
                    rank,
                    stage = %stage.id,
                    %pruned,
                    "no fallback candidate for stage"
                );
                degraded = true;
                break 'ranks;
            };
            if tier > 0 {
                disjoint = false;
                degraded = true;
            }
            latency_so_far += backed.cost.latency_ms;
            let assignment = best.into_assignment(stage);
            ledger.record(&assignment);
            assignments.push(assignment);
        }

        fallbacks.push(FallbackPlan {
            rank,
            score: PlanScore::from_stages(&assignments, 0.0, config.slo_weight),
            assignments,
            disjoint,
        });
    }
    (fallbacks, degraded)
}
