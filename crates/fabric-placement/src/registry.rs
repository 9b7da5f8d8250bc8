//! The `PlacementStrategy` trait and the name → strategy registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use fabric_core::{StrategyConfig, canonical_strategy_name};
use fabric_state::Snapshot;
use serde::{Deserialize, Serialize};

use crate::adaptive::AdaptivePlanner;
use crate::cost::CostModel;
use crate::error::{PlanError, PlanResult};
use crate::greedy::GreedyPlanner;
use crate::job::Job;
use crate::plan::{PlacementPlan, PlanFeedback};
use crate::resilient::ResilientPlanner;

/// A planning policy.
///
/// Implementations must be pure with respect to the snapshot: the same job,
/// snapshot, and configuration always produce the same plan, and nothing in
/// the snapshot is mutated.
pub trait PlacementStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn plan(
        &self,
        job: &Job,
        snapshot: &Snapshot,
        cost: &CostModel,
        config: &StrategyConfig,
    ) -> PlacementPlan;

    /// Called after the engine tries to commit a plan from this strategy.
    fn record_outcome(&self, _plan: &PlacementPlan, _feedback: &PlanFeedback, _config: &StrategyConfig) {}

    /// Opaque learned state, if the strategy has any.
    fn export_state(&self) -> PlanResult<Option<Vec<u8>>> {
        Ok(None)
    }

    fn import_state(&self, _blob: &[u8]) -> PlanResult<()> {
        Ok(())
    }
}

/// Well-known strategy names. Aliases resolve through
/// [`canonical_strategy_name`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StrategyKind {
    Greedy,
    Resilient,
    NetworkAware,
    Federated,
    Adaptive,
    Custom(String),
}

impl StrategyKind {
    pub fn parse(name: &str) -> Self {
        match canonical_strategy_name(name).as_str() {
            "greedy" => Self::Greedy,
            "resilient" => Self::Resilient,
            "network-aware" => Self::NetworkAware,
            "federated" => Self::Federated,
            "adaptive" => Self::Adaptive,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Greedy => "greedy",
            Self::Resilient => "resilient",
            Self::NetworkAware => "network-aware",
            Self::Federated => "federated",
            Self::Adaptive => "adaptive",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for StrategyKind {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl From<&str> for StrategyKind {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl From<StrategyKind> for String {
    fn from(kind: StrategyKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategies by canonical name.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Arc<dyn PlacementStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Greedy, resilient, network-aware, federated, and adaptive.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GreedyPlanner::new()));
        for mode in ["resilient", "network-aware", "federated"] {
            registry.register(Arc::new(ResilientPlanner::new(mode)));
        }
        registry.register(Arc::new(AdaptivePlanner::new()));
        registry
    }

    /// Add or replace a strategy under its own name. Returns the one it replaced.
    pub fn register(&mut self, strategy: Arc<dyn PlacementStrategy>) -> Option<Arc<dyn PlacementStrategy>> {
        let name = canonical_strategy_name(strategy.name());
        self.strategies.insert(name, strategy)
    }

    pub fn get(&self, kind: &StrategyKind) -> PlanResult<Arc<dyn PlacementStrategy>> {
        self.strategies
            .get(kind.as_str())
            .cloned()
            .ok_or_else(|| PlanError::UnknownStrategy(kind.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn PlacementStrategy>)> {
        self.strategies.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.names())
            .finish()
    }
}
