//! Adaptive planner: greedy scoring plus per-node penalties learned from
//! commit outcomes.
//!
//! Each commit failure pulls the failing node's penalty toward 1, and each
//! successful commit decays the penalty of every node it used toward 0.
//! Learned state can be exported as an opaque blob and imported later.

use std::collections::BTreeMap;
use std::sync::RwLock;

use fabric_core::{NodeId, StrategyConfig};
use fabric_state::Snapshot;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::candidates::{Ledger, finish, plan_chain};
use crate::cost::CostModel;
use crate::error::{PlanError, PlanResult};
use crate::greedy::greedy_score;
use crate::job::Job;
use crate::plan::{PlacementPlan, PlanFeedback};
use crate::registry::PlacementStrategy;

pub const ADAPTIVE: &str = "adaptive";

/// Version tag written into exported state.
const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveState {
    pub version: u32,
    /// Learned penalty per node, in `[0, 1]`.
    pub penalties: BTreeMap<NodeId, f64>,
    pub observations: u64,
}

#[derive(Debug)]
pub struct AdaptivePlanner {
    state: RwLock<AdaptiveState>,
}

impl Default for AdaptivePlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptivePlanner {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(AdaptiveState {
                version: STATE_VERSION,
                ..Default::default()
            }),
        }
    }

    pub fn penalty(&self, node: &str) -> f64 {
        self.read().penalties.get(node).copied().unwrap_or(0.0)
    }

    pub fn state(&self) -> AdaptiveState {
        self.read().clone()
    }

    // A poisoned lock still holds a consistent map: every update is a
    // single insert.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, AdaptiveState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, AdaptiveState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl PlacementStrategy for AdaptivePlanner {
    fn name(&self) -> &str {
        ADAPTIVE
    }

    fn plan(
        &self,
        job: &Job,
        snapshot: &Snapshot,
        cost: &CostModel,
        config: &StrategyConfig,
    ) -> PlacementPlan {
        let penalties = self.read().penalties.clone();
        let mut ledger = Ledger::new(snapshot);
        let primary = plan_chain(job, &mut ledger, cost, |c, _, _| {
            let (score, mut breakdown) = greedy_score(c, config);
            let learned = penalties.get(&c.node.id).copied().unwrap_or(0.0);
            breakdown.adaptive_penalty = config.adaptive_penalty * learned;
            (score + breakdown.adaptive_penalty, breakdown)
        });
        debug!(
            job = %job.id,
            version = snapshot.version,
            feasible = primary.is_ok(),
            learned = penalties.len(),
            "adaptive plan computed"
        );
        finish(job, ADAPTIVE, snapshot, cost, config, primary, Vec::new(), false)
    }

    fn record_outcome(&self, plan: &PlacementPlan, feedback: &PlanFeedback, config: &StrategyConfig) {
        let rate = config.adaptive_learning_rate.clamp(0.0, 1.0);
        let mut state = self.write();
        let mut nudge = |node: &str, target: f64| {
            let p = state.penalties.entry(node.to_string()).or_insert(0.0);
            *p = ((1.0 - rate) * *p + rate * target).clamp(0.0, 1.0);
        };

        match feedback {
            PlanFeedback::Committed => {
                for node in plan.nodes() {
                    nudge(node, 0.0);
                }
            }
            PlanFeedback::Stale { node } | PlanFeedback::PartialInfeasible { node } => match node {
                Some(node) => nudge(node.as_str(), 1.0),
                None => {
                    for node in plan.nodes() {
                        nudge(node, 1.0);
                    }
                }
            },
        }
        state.observations += 1;
        debug!(job = %plan.job_id, ?feedback, observations = state.observations, "adaptive outcome recorded");
    }

    fn export_state(&self) -> PlanResult<Option<Vec<u8>>> {
        let blob = serde_json::to_vec(&*self.read())
            .map_err(|e| PlanError::PolicyState(e.to_string()))?;
        Ok(Some(blob))
    }

    fn import_state(&self, blob: &[u8]) -> PlanResult<()> {
        let imported: AdaptiveState =
            serde_json::from_slice(blob).map_err(|e| PlanError::PolicyState(e.to_string()))?;
        if imported.version != STATE_VERSION {
            return Err(PlanError::PolicyState(format!(
                "unsupported adaptive state version {} (expected {STATE_VERSION})",
                imported.version
            )));
        }
        info!(nodes = imported.penalties.len(), observations = imported.observations, "adaptive state imported");
        *self.write() = imported;
        Ok(())
    }
}
