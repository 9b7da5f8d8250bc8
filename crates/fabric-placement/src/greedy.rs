//! Greedy planner: cheapest feasible node per stage, no fallbacks.

use fabric_core::StrategyConfig;
use fabric_state::Snapshot;
use tracing::debug;

use crate::candidates::{Candidate, Ledger, finish, plan_chain};
use crate::cost::CostModel;
use crate::job::Job;
use crate::plan::{PlacementPlan, ScoreBreakdown};
use crate::registry::PlacementStrategy;

pub const GREEDY: &str = "greedy";

/// Weighted latency + energy + risk.
pub(crate) fn greedy_score(candidate: &Candidate<'_>, config: &StrategyConfig) -> (f64, ScoreBreakdown) {
    let breakdown = ScoreBreakdown {
        latency: config.latency_weight * candidate.cost.latency_ms,
        energy: config.energy_weight * candidate.cost.energy_kj,
        risk_penalty: config.risk_weight * candidate.cost.risk,
        projected_load: candidate.projected_load,
        ..Default::default()
    };
    (breakdown.latency + breakdown.energy + breakdown.risk_penalty, breakdown)
}

#[derive(Debug, Default)]
pub struct GreedyPlanner;

impl GreedyPlanner {
    pub fn new() -> Self {
        Self
    }
}

impl PlacementStrategy for GreedyPlanner {
    fn name(&self) -> &str {
        GREEDY
    }

    fn plan(
        &self,
        job: &Job,
        snapshot: &Snapshot,
        cost: &CostModel,
        config: &StrategyConfig,
    ) -> PlacementPlan {
        let mut ledger = Ledger::new(snapshot);
        let primary = plan_chain(job, &mut ledger, cost, |c, _, _| greedy_score(c, config));
        debug!(
            job = %job.id,
            version = snapshot.version,
            feasible = primary.is_ok(),
            "greedy plan computed"
        );
        finish(job, GREEDY, snapshot, cost, config, primary, Vec::new(), false)
    }
}
