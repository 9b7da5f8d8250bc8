//! Reservation engine — turns a placement plan into committed holds.
//!
//! A commit is all-or-nothing per plan. Every stage is first checked against
//! the live store by [`ReservationEngine::validate`] (the same check a dry
//! run performs), then reserved stage by stage. If any stage fails, or the
//! request is cancelled part way, every hold already taken for the plan is
//! released before the error is returned.
//!
//! The live check also recomputes the path between consecutive stages, so a
//! link taken down or a federation cut after planning fails the commit.
//!
//! Failures are classified by comparing the failing node, link, or
//! federation in the live store with the snapshot the plan was computed from. Drift means the plan
//! was stale; no drift means the plan itself could not fit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use fabric_core::Resources;
use fabric_placement::PlacementPlan;
use fabric_state::{
    EntityRef, FabricStore, LinkPath, Reservation, ReserveRequest, Snapshot, StateError,
};
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};

/// Cooperative cancellation for one plan request.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct ReservationEngine {
    store: FabricStore,
}

impl ReservationEngine {
    pub fn new(store: FabricStore) -> Self {
        Self { store }
    }

    /// Check that every hold in `plan` fits the `live` store right now.
    ///
    /// Shared by dry runs and commits. `planned` is the snapshot the plan
    /// was computed from and only feeds failure classification.
    pub fn validate(
        &self,
        plan: &PlacementPlan,
        planned: &Snapshot,
        live: &Snapshot,
    ) -> EngineResult<()> {
        let mut nodes: BTreeMap<&str, Resources> = BTreeMap::new();
        let mut links: BTreeMap<&str, u64> = BTreeMap::new();
        for stage in &plan.primary {
            *nodes.entry(stage.node.as_str()).or_default() += stage.resources;
            for hop in &stage.path.hops {
                *links.entry(hop.as_str()).or_default() += stage.link_mbps;
            }
        }

        for (id, demand) in &nodes {
            let entity = EntityRef::Node(id.to_string());
            let Some(node) = live.node(id) else {
                return Err(classify(plan, planned, live, Some(entity), "unknown node".into()));
            };
            if !node.status.is_available() {
                return Err(classify(plan, planned, live, Some(entity), format!("node {id} is down")));
            }
            if !node.can_admit(demand) {
                return Err(classify(
                    plan,
                    planned,
                    live,
                    Some(entity),
                    format!("node {id} needs {demand}, has {} free", node.free()),
                ));
            }
        }
        for (id, mbps) in &links {
            let entity = EntityRef::Link(id.to_string());
            let Some(link) = live.link(id) else {
                return Err(classify(plan, planned, live, Some(entity), "unknown link".into()));
            };
            if !link.status.is_available() {
                return Err(classify(plan, planned, live, Some(entity), format!("link {id} is down")));
            }
            if link.available_mbps() < *mbps {
                return Err(classify(
                    plan,
                    planned,
                    live,
                    Some(entity),
                    format!(
                        "link {id} needs {mbps} Mbps, has {} available",
                        link.available_mbps()
                    ),
                ));
            }
        }
        for pair in plan.primary.windows(2) {
            let (from, to) = (pair[0].node.as_str(), pair[1].node.as_str());
            let path = live.path_between(from, to);
            if path.down {
                let entity = down_path_entity(live, from, to, &path);
                return Err(classify(
                    plan,
                    planned,
                    live,
                    entity,
                    format!("path {from} -> {to} is down"),
                ));
            }
        }
        Ok(())
    }

    /// Validate against the live store, then reserve every primary stage.
    pub fn commit(
        &self,
        plan: &PlacementPlan,
        planned: &Snapshot,
        ttl_ms: Option<u64>,
        cancel: &CancelToken,
    ) -> EngineResult<Vec<Reservation>> {
        self.validate(plan, planned, &self.store.snapshot())?;
        let requests: Vec<ReserveRequest> = plan
            .primary
            .iter()
            .map(|stage| stage.reserve_request(&plan.job_id, ttl_ms))
            .collect();
        self.commit_requests(plan, planned, &requests, cancel, |held| {
            debug!(job_id = %plan.job_id, reservation = %held.id, "stage reserved");
        })
    }

    /// Reserve `requests` in order, checking `cancel` before each one.
    /// `on_hold` runs after every successful reservation.
    pub(crate) fn commit_requests(
        &self,
        plan: &PlacementPlan,
        planned: &Snapshot,
        requests: &[ReserveRequest],
        cancel: &CancelToken,
        mut on_hold: impl FnMut(&Reservation),
    ) -> EngineResult<Vec<Reservation>> {
        let mut held: Vec<Reservation> = Vec::with_capacity(requests.len());
        for request in requests {
            if cancel.is_cancelled() {
                self.rollback(&plan.job_id, &held);
                return Err(EngineError::Cancelled(plan.job_id.clone()));
            }
            match self.store.try_reserve(request) {
                Ok(reservation) => {
                    on_hold(&reservation);
                    held.push(reservation);
                }
                Err(e) => {
                    self.rollback(&plan.job_id, &held);
                    return Err(match e {
                        StateError::NotFound(what) => classify(
                            plan,
                            planned,
                            &self.store.snapshot(),
                            None,
                            format!("not found: {what}"),
                        ),
                        e if e.is_capacity() => classify(
                            plan,
                            planned,
                            &self.store.snapshot(),
                            e.entity(),
                            e.to_string(),
                        ),
                        e => e.into(),
                    });
                }
            }
        }
        info!(
            job_id = %plan.job_id,
            reservations = held.len(),
            version = self.store.version(),
            "plan committed"
        );
        Ok(held)
    }

    /// Release holds taken for a plan, newest first.
    pub fn rollback(&self, job_id: &str, held: &[Reservation]) {
        if held.is_empty() {
            return;
        }
        for reservation in held.iter().rev() {
            if let Err(e) = self.store.release(&reservation.id) {
                error!(%job_id, reservation = %reservation.id, error = %e, "rollback release failed");
            }
        }
        warn!(%job_id, released = held.len(), "commit rolled back");
    }
}

/// Decide between a stale snapshot and a plan that could not fit.
pub(crate) fn classify(
    plan: &PlacementPlan,
    planned: &Snapshot,
    live: &Snapshot,
    entity: Option<EntityRef>,
    reason: String,
) -> EngineError {
    let stale = entity.as_ref().is_some_and(|e| drifted(e, planned, live));
    debug!(job_id = %plan.job_id, ?entity, stale, %reason, "commit failure classified");
    if stale {
        EngineError::StaleSnapshot {
            job_id: plan.job_id.clone(),
            snapshot_version: planned.version,
            entity,
            reason,
        }
    } else {
        EngineError::PartialInfeasible {
            job_id: plan.job_id.clone(),
            entity,
            reason,
        }
    }
}

/// What to blame for a down path: a down hop first, then whichever
/// endpoint federation carries the cut.
fn down_path_entity(live: &Snapshot, from: &str, to: &str, path: &LinkPath) -> Option<EntityRef> {
    let down_hop = path
        .hops
        .iter()
        .find(|hop| live.link(hop).is_none_or(|l| !l.status.is_available()));
    if let Some(hop) = down_hop {
        return Some(EntityRef::Link(hop.clone()));
    }
    let (a, b) = (live.federation_of(from)?, live.federation_of(to)?);
    let cut = |x: &str, y: &str| {
        live.federations
            .get(x)
            .is_some_and(|f| f.isolated || f.partitioned_from.contains(y))
    };
    if cut(a, b) {
        Some(EntityRef::Federation(a.to_string()))
    } else if cut(b, a) {
        Some(EntityRef::Federation(b.to_string()))
    } else {
        None
    }
}

/// Whether an entity's health, derate, limit, partition state, or
/// allocation by others changed since `planned`.
fn drifted(entity: &EntityRef, planned: &Snapshot, live: &Snapshot) -> bool {
    match entity {
        EntityRef::Node(id) => match (planned.node(id), live.node(id)) {
            (Some(p), Some(l)) => {
                p.status != l.status
                    || p.thermal_derate != l.thermal_derate
                    || p.allocated != l.allocated
            }
            _ => true,
        },
        EntityRef::Link(id) => match (planned.link(id), live.link(id)) {
            (Some(p), Some(l)) => {
                p.status != l.status
                    || p.bandwidth_limit_mbps != l.bandwidth_limit_mbps
                    || p.allocated_mbps != l.allocated_mbps
            }
            _ => true,
        },
        EntityRef::Federation(id) => match (planned.federations.get(id), live.federations.get(id)) {
            (Some(p), Some(l)) => p.isolated != l.isolated || p.partitioned_from != l.partitioned_from,
            _ => true,
        },
    }
}
