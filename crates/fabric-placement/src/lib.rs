//! fabric-placement — scoring and planning for the fabric twin.
//!
//! Planners read one immutable [`Snapshot`](fabric_state::Snapshot), prune
//! infeasible candidates, score the rest with the [`CostModel`], and return
//! a [`PlacementPlan`]. They never mutate the store; committing a plan is
//! the reservation engine's job.
//!
//! # Components
//!
//! - **`cost`** — deterministic latency / energy / risk estimates
//! - **`candidates`** — feasibility pruning and the in-plan capacity ledger
//! - **`greedy`** — per-stage minimum cost, no fallbacks
//! - **`resilient`** — load, spread, network, and resilience aware, with
//!   disjoint fallbacks (also serves `network-aware` and `federated`)
//! - **`adaptive`** — greedy scoring plus penalties learned from outcomes
//! - **`registry`** — the `PlacementStrategy` trait and name → strategy map

pub mod adaptive;
pub mod candidates;
pub mod cost;
pub mod error;
pub mod greedy;
pub mod job;
pub mod plan;
pub mod registry;
pub mod resilient;

pub use adaptive::AdaptivePlanner;
pub use cost::{CostEstimate, CostInput, CostModel};
pub use error::{PlanError, PlanResult};
pub use greedy::GreedyPlanner;
pub use job::{Job, JobConstraints, LinkRequirement, Stage};
pub use plan::{
    FallbackPlan, Feasibility, PlacementPlan, PlanFeedback, PlanMetrics, PlanScore,
    ScoreBreakdown, StageAssignment,
};
pub use registry::{PlacementStrategy, StrategyKind, StrategyRegistry};
pub use resilient::ResilientPlanner;
