//! Engine — the public face of the fabric twin.
//!
//! A plan request moves through these phases:
//!
//! ```text
//! Received → SnapshotTaken → CandidatesScored → PlanSelected
//!          → Committed | DryRunOk | Infeasible | StaleSnapshot
//! ```
//!
//! Every transition is logged. `StaleSnapshot` is retryable: re-running the
//! request takes a fresh snapshot and plans again.

use std::fmt;
use std::sync::Arc;

use fabric_core::{EngineConfig, StrategyConfig};
use fabric_placement::{
    CostModel, Job, PlacementPlan, PlacementStrategy, PlanFeedback, StrategyKind, StrategyRegistry,
};
use fabric_state::{
    FabricDescriptor, FabricStore, OverrideEvent, OverrideOutcome, Reservation, Snapshot,
    SnapshotArchive, StoreOptions,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::reservation::{CancelToken, ReservationEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanPhase {
    Received,
    SnapshotTaken,
    CandidatesScored,
    PlanSelected,
    Committed,
    DryRunOk,
    Infeasible,
    StaleSnapshot,
}

impl PlanPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::DryRunOk | Self::Infeasible | Self::StaleSnapshot
        )
    }
}

impl fmt::Display for PlanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Received => "RECEIVED",
            Self::SnapshotTaken => "SNAPSHOT_TAKEN",
            Self::CandidatesScored => "CANDIDATES_SCORED",
            Self::PlanSelected => "PLAN_SELECTED",
            Self::Committed => "COMMITTED",
            Self::DryRunOk => "DRY_RUN_OK",
            Self::Infeasible => "INFEASIBLE",
            Self::StaleSnapshot => "STALE_SNAPSHOT",
        };
        f.write_str(s)
    }
}

/// A successful plan request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanOutcome {
    /// `Committed` or `DryRunOk`.
    pub phase: PlanPhase,
    pub plan: PlacementPlan,
    /// Holds taken for the primary stages. Empty for dry runs.
    pub reservations: Vec<Reservation>,
    /// Planning attempts, counting stale-snapshot retries.
    pub attempts: u32,
}

pub struct Engine {
    store: FabricStore,
    config: EngineConfig,
    cost: CostModel,
    registry: StrategyRegistry,
    reservations: ReservationEngine,
    archive: Option<SnapshotArchive>,
}

impl Engine {
    /// Wrap an existing store with the built-in strategies.
    pub fn new(store: FabricStore, config: EngineConfig) -> Self {
        Self {
            cost: CostModel::new(config.cost.clone()),
            reservations: ReservationEngine::new(store.clone()),
            registry: StrategyRegistry::with_builtins(),
            archive: None,
            store,
            config,
        }
    }

    /// Build a store from `descriptor` and wrap it.
    pub fn from_descriptor(descriptor: &FabricDescriptor, config: EngineConfig) -> EngineResult<Self> {
        let options = StoreOptions {
            network: config.network.clone(),
            released_history: config.engine.released_history,
        };
        let store = FabricStore::init(descriptor, options)?;
        Ok(Self::new(store, config))
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &FabricStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }

    // ── Planning ───────────────────────────────────────────────────

    /// Plan `job` against the latest snapshot and commit it (or dry-run).
    pub fn plan(&self, job: &Job, strategy: &StrategyKind) -> EngineResult<PlanOutcome> {
        self.plan_with_cancel(job, strategy, &CancelToken::new())
    }

    pub fn plan_with_cancel(
        &self,
        job: &Job,
        strategy: &StrategyKind,
        cancel: &CancelToken,
    ) -> EngineResult<PlanOutcome> {
        self.plan_against(job, strategy, self.store.snapshot(), cancel)
    }

    /// Plan with an explicit strategy config instead of the one resolved
    /// from `engine.toml`.
    pub fn plan_with_config(
        &self,
        job: &Job,
        strategy: &StrategyKind,
        config: &StrategyConfig,
    ) -> EngineResult<PlanOutcome> {
        self.execute(job, strategy, config, self.store.snapshot(), &CancelToken::new())
    }

    /// Plan against a specific snapshot. The commit still validates
    /// against the live store.
    pub fn plan_against(
        &self,
        job: &Job,
        strategy: &StrategyKind,
        snapshot: Arc<Snapshot>,
        cancel: &CancelToken,
    ) -> EngineResult<PlanOutcome> {
        let config = self.config.strategy(strategy.as_str());
        self.execute(job, strategy, &config, snapshot, cancel)
    }

    fn execute(
        &self,
        job: &Job,
        strategy: &StrategyKind,
        config: &StrategyConfig,
        snapshot: Arc<Snapshot>,
        cancel: &CancelToken,
    ) -> EngineResult<PlanOutcome> {
        transition(&job.id, PlanPhase::Received, None);
        job.validate()?;
        let planner = self.registry.get(strategy)?;
        transition(&job.id, PlanPhase::SnapshotTaken, Some(snapshot.version));
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled(job.id.clone()));
        }

        let plan = planner.plan(job, &snapshot, &self.cost, config);
        transition(&job.id, PlanPhase::CandidatesScored, Some(snapshot.version));
        if let Some(reason) = plan.infeasible_reason() {
            transition(&job.id, PlanPhase::Infeasible, Some(snapshot.version));
            return Err(EngineError::Infeasible {
                job_id: job.id.clone(),
                reason: reason.to_string(),
            });
        }
        transition(&job.id, PlanPhase::PlanSelected, Some(snapshot.version));
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled(job.id.clone()));
        }

        if job.constraints.dry_run {
            if let Err(e) = self.reservations.validate(&plan, &snapshot, &self.store.snapshot()) {
                self.finish_failed(job, &e, snapshot.version);
                return Err(e);
            }
            transition(&job.id, PlanPhase::DryRunOk, Some(snapshot.version));
            return Ok(PlanOutcome {
                phase: PlanPhase::DryRunOk,
                plan,
                reservations: Vec::new(),
                attempts: 1,
            });
        }

        let ttl = job.ttl_ms.or(self.config.engine.default_reservation_ttl_ms);
        match self.reservations.commit(&plan, &snapshot, ttl, cancel) {
            Ok(reservations) => {
                planner.record_outcome(&plan, &PlanFeedback::Committed, config);
                transition(&job.id, PlanPhase::Committed, Some(self.store.version()));
                Ok(PlanOutcome {
                    phase: PlanPhase::Committed,
                    plan,
                    reservations,
                    attempts: 1,
                })
            }
            Err(e) => {
                record_failure(planner.as_ref(), &plan, &e, config);
                self.finish_failed(job, &e, snapshot.version);
                Err(e)
            }
        }
    }

    /// Like [`Engine::plan`], re-planning from a fresh snapshot after a
    /// stale-snapshot failure up to the configured retry limit.
    pub fn plan_with_retry(&self, job: &Job, strategy: &StrategyKind) -> EngineResult<PlanOutcome> {
        let config = self.config.strategy(strategy.as_str());
        self.retry(job, strategy, &config)
    }

    fn retry(
        &self,
        job: &Job,
        strategy: &StrategyKind,
        config: &StrategyConfig,
    ) -> EngineResult<PlanOutcome> {
        let limit = self.config.engine.stale_retry_limit;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.plan_with_config(job, strategy, config) {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    return Ok(outcome);
                }
                Err(e) if e.is_retryable() && attempt <= limit => {
                    warn!(job_id = %job.id, attempt, error = %e, "stale snapshot, re-planning");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Plan and commit each job in order. Later jobs see earlier commits.
    pub fn plan_batch(&self, jobs: &[Job], strategy: &StrategyKind) -> Vec<EngineResult<PlanOutcome>> {
        let config = self.config.strategy(strategy.as_str());
        self.plan_batch_with_config(jobs, strategy, &config)
    }

    pub fn plan_batch_with_config(
        &self,
        jobs: &[Job],
        strategy: &StrategyKind,
        config: &StrategyConfig,
    ) -> Vec<EngineResult<PlanOutcome>> {
        let results: Vec<EngineResult<PlanOutcome>> = jobs
            .iter()
            .map(|job| self.retry(job, strategy, config))
            .collect();
        info!(
            jobs = jobs.len(),
            committed = results.iter().filter(|r| r.is_ok()).count(),
            "plan batch finished"
        );
        results
    }

    // ── Mutations ──────────────────────────────────────────────────

    pub fn release(&self, reservation_id: &str) -> EngineResult<Reservation> {
        Ok(self.store.release(reservation_id)?)
    }

    /// Release every reservation of a committed outcome.
    pub fn release_outcome(&self, outcome: &PlanOutcome) -> EngineResult<usize> {
        for reservation in &outcome.reservations {
            self.release(&reservation.id)?;
        }
        Ok(outcome.reservations.len())
    }

    pub fn apply_override(&self, event: OverrideEvent) -> EngineResult<OverrideOutcome> {
        Ok(self.store.apply_override(event)?)
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Archive the current snapshot. Returns its version.
    pub fn archive_snapshot(&self) -> EngineResult<u64> {
        let archive = self.archive.as_ref().ok_or(EngineError::NoArchive)?;
        let snapshot = self.store.snapshot();
        archive.put_snapshot(&snapshot)?;
        Ok(snapshot.version)
    }

    /// Save every strategy's learned state. Returns how many were saved.
    pub fn checkpoint_policies(&self) -> EngineResult<usize> {
        let archive = self.archive.as_ref().ok_or(EngineError::NoArchive)?;
        let mut saved = 0;
        for (name, strategy) in self.registry.iter() {
            if let Some(blob) = strategy.export_state()? {
                archive.put_policy_state(name, &blob)?;
                saved += 1;
            }
        }
        info!(saved, "policy state checkpointed");
        Ok(saved)
    }

    /// Load learned state saved by [`Engine::checkpoint_policies`].
    pub fn restore_policies(&self) -> EngineResult<usize> {
        let archive = self.archive.as_ref().ok_or(EngineError::NoArchive)?;
        let mut restored = 0;
        for (name, strategy) in self.registry.iter() {
            if let Some(blob) = archive.get_policy_state(name)? {
                strategy.import_state(&blob)?;
                restored += 1;
            }
        }
        info!(restored, "policy state restored");
        Ok(restored)
    }

    /// Stop accepting mutations. Snapshots stay readable.
    pub fn shutdown(&self) -> EngineResult<()> {
        self.store.shutdown()?;
        info!(version = self.store.version(), "engine shut down");
        Ok(())
    }

    fn finish_failed(&self, job: &Job, error: &EngineError, snapshot_version: u64) {
        if let Some(phase) = error.phase() {
            transition(&job.id, phase, Some(snapshot_version));
        }
    }
}

fn transition(job_id: &str, phase: PlanPhase, version: Option<u64>) {
    if phase.is_terminal() {
        info!(%job_id, %phase, ?version, "plan request finished");
    } else {
        debug!(%job_id, %phase, ?version, "plan request phase");
    }
}

fn record_failure(
    planner: &dyn PlacementStrategy,
    plan: &PlacementPlan,
    error: &EngineError,
    config: &StrategyConfig,
) {
    let node = error.failed_node().map(str::to_string);
    let feedback = match error {
        EngineError::StaleSnapshot { .. } => PlanFeedback::Stale { node },
        EngineError::PartialInfeasible { .. } => PlanFeedback::PartialInfeasible { node },
        _ => return,
    };
    planner.record_outcome(plan, &feedback, config);
}
