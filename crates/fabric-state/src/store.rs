//! FabricStore — the single mutable source of truth for the fabric.
//!
//! All mutations take one exclusive lock, re-check the capacity invariant
//! for the entities they touched, and publish a fresh [`Snapshot`] before the
//! lock is released. Readers only ever clone the published `Arc<Snapshot>`,
//! so planning never blocks writers and never sees a half-applied change.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use fabric_core::{
    LinkId, NetworkDefaults, NodeId, ReservationId, Resources, epoch_millis,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::descriptor::FabricDescriptor;
use crate::error::{EntityRef, StateError, StateResult};
use crate::overrides::{
    FieldKey, FieldValue, FieldWrite, OverrideEvent, OverrideOutcome, OverrideReport, Stamp,
    TopologyView, export_event,
};
use crate::snapshot::Snapshot;
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreOptions {
    pub network: NetworkDefaults,
    /// Released reservations retained for lookup.
    pub released_history: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            network: NetworkDefaults::default(),
            released_history: 1024,
        }
    }
}

/// Result of a full invariant audit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub version: u64,
    pub nodes: usize,
    pub links: usize,
    pub reservations: usize,
}

/// Thread-safe handle to the live fabric. Cheap to clone.
#[derive(Clone)]
pub struct FabricStore {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<FabricState>,
    published: RwLock<Arc<Snapshot>>,
    version: AtomicU64,
}

struct FabricState {
    version: u64,
    nodes: BTreeMap<NodeId, Node>,
    links: BTreeMap<LinkId, Link>,
    federations: BTreeMap<String, Federation>,
    reservations: BTreeMap<ReservationId, Reservation>,
    released: VecDeque<Reservation>,
    released_cap: usize,
    next_reservation: u64,
    next_event: u64,
    fields: BTreeMap<FieldKey, Stamp>,
    network: NetworkDefaults,
    closed: bool,
}

impl FabricStore {
    /// Build the store from a validated descriptor and publish version 1.
    pub fn init(descriptor: &FabricDescriptor, options: StoreOptions) -> StateResult<Self> {
        let topo = descriptor.build(&options.network)?;
        let state = FabricState {
            version: 1,
            nodes: topo.nodes,
            links: topo.links,
            federations: topo.federations,
            reservations: BTreeMap::new(),
            released: VecDeque::new(),
            released_cap: options.released_history,
            next_reservation: 1,
            next_event: 1,
            fields: BTreeMap::new(),
            network: options.network,
            closed: false,
        };
        let snapshot = Arc::new(state.snapshot());
        info!(
            nodes = state.nodes.len(),
            links = state.links.len(),
            federations = state.federations.len(),
            "fabric store initialized"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                published: RwLock::new(snapshot),
                version: AtomicU64::new(1),
            }),
        })
    }

    /// Stop accepting mutations. Snapshots stay readable.
    pub fn shutdown(&self) -> StateResult<()> {
        let mut state = self.lock()?;
        if !state.closed {
            state.closed = true;
            info!(version = state.version, "fabric store shut down");
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        let guard = self
            .inner
            .published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Version of the latest published snapshot.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    // ── Overrides ──────────────────────────────────────────────────

    /// Apply one (possibly grouped) override event atomically.
    pub fn apply_override(&self, event: OverrideEvent) -> StateResult<OverrideOutcome> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let event = state.normalize(event);
        let changed = state.apply_event(&event)?;
        if changed {
            self.publish(&mut state);
            info!(event_id = %event.id, version = state.version, "override applied");
        } else {
            debug!(event_id = %event.id, "override superseded or already in place");
        }
        Ok(OverrideOutcome {
            event_id: event.id,
            changed,
            version: state.version,
        })
    }

    /// Apply a batch in stamp order under a single publish. Invalid events
    /// are reported and dropped without affecting the rest.
    pub fn apply_overrides(&self, events: Vec<OverrideEvent>) -> StateResult<OverrideReport> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let mut events: Vec<OverrideEvent> =
            events.into_iter().map(|e| state.normalize(e)).collect();
        events.sort_by_key(OverrideEvent::stamp);

        let mut report = OverrideReport::default();
        for event in events {
            match state.apply_event(&event) {
                Ok(true) => report.applied.push(event.id),
                Ok(false) => report.unchanged.push(event.id),
                Err(StateError::InvalidOverride { event_id, reason }) => {
                    report.rejected.push((event_id, reason))
                }
                Err(e) => return Err(e),
            }
        }
        if !report.applied.is_empty() {
            self.publish(&mut state);
            info!(
                applied = report.applied.len(),
                rejected = report.rejected.len(),
                version = state.version,
                "override batch applied"
            );
        }
        report.version = state.version;
        Ok(report)
    }

    /// Current non-default override state as replayable events.
    pub fn override_state(&self) -> StateResult<Vec<OverrideEvent>> {
        let state = self.lock()?;
        let mut events: Vec<OverrideEvent> = state
            .fields
            .iter()
            .filter_map(|(key, stamp)| {
                state
                    .current_value(key)
                    .map(|value| export_event(key, value, stamp))
            })
            .collect();
        events.sort_by_key(OverrideEvent::stamp);
        Ok(events)
    }

    // ── Reservations ───────────────────────────────────────────────

    /// Atomically check and allocate every hold in `request`.
    ///
    /// Either all holds are applied or none. Never admits an amount that
    /// would push a node or link past its admissible capacity.
    pub fn try_reserve(&self, request: &ReserveRequest) -> StateResult<Reservation> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let reservation = state.reserve(request, epoch_millis())?;
        self.publish(&mut state);
        debug!(
            reservation = %reservation.id,
            job_id = %reservation.job_id,
            version = state.version,
            "reservation committed"
        );
        Ok(reservation)
    }

    /// Free a reservation's holds. Unknown or already released ids are
    /// `NotFound`.
    pub fn release(&self, id: &str) -> StateResult<Reservation> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let released = state.release(id)?;
        self.publish(&mut state);
        debug!(reservation = %id, version = state.version, "reservation released");
        Ok(released)
    }

    /// Release every reservation whose TTL has passed at `now_ms`.
    pub fn release_expired(&self, now_ms: u64) -> StateResult<Vec<ReservationId>> {
        let mut state = self.lock()?;
        state.ensure_open()?;
        let expired: Vec<ReservationId> = state
            .reservations
            .values()
            .filter(|r| r.is_expired(now_ms))
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            state.release(id)?;
        }
        if !expired.is_empty() {
            self.publish(&mut state);
            info!(count = expired.len(), version = state.version, "expired reservations released");
        }
        Ok(expired)
    }

    /// Active or recently released reservation by id.
    pub fn reservation(&self, id: &str) -> StateResult<Option<Reservation>> {
        let state = self.lock()?;
        Ok(state
            .reservations
            .get(id)
            .or_else(|| state.released.iter().find(|r| r.id == id))
            .cloned())
    }

    pub fn node(&self, id: &str) -> StateResult<Option<Node>> {
        Ok(self.lock()?.nodes.get(id).cloned())
    }

    pub fn link(&self, id: &str) -> StateResult<Option<Link>> {
        Ok(self.lock()?.links.get(id).cloned())
    }

    /// Verify the capacity invariant over every node and link.
    ///
    /// A violation is an internal bug and panics.
    pub fn audit(&self) -> StateResult<AuditReport> {
        let state = self.lock()?;
        for id in state.nodes.keys() {
            state.verify_node(id);
        }
        for id in state.links.keys() {
            state.verify_link(id);
        }
        Ok(AuditReport {
            version: state.version,
            nodes: state.nodes.len(),
            links: state.links.len(),
            reservations: state.reservations.len(),
        })
    }

    // ── Internals ──────────────────────────────────────────────────

    fn lock(&self) -> StateResult<MutexGuard<'_, FabricState>> {
        self.inner.state.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Bump the version and publish. Must be called with the state lock held.
    fn publish(&self, state: &mut FabricState) {
        state.version += 1;
        let snapshot = Arc::new(state.snapshot());
        let mut published = self
            .inner
            .published
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *published = snapshot;
        self.inner.version.store(state.version, Ordering::Release);
    }
}

impl FabricState {
    fn ensure_open(&self) -> StateResult<()> {
        if self.closed {
            Err(StateError::Closed)
        } else {
            Ok(())
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: self.version,
            taken_at_ms: epoch_millis(),
            nodes: self.nodes.clone(),
            links: self.links.clone(),
            federations: self.federations.clone(),
            reservations: self.reservations.clone(),
            network: self.network.clone(),
        }
    }

    fn view(&self) -> TopologyView<'_> {
        TopologyView {
            nodes: &self.nodes,
            links: &self.links,
            federations: &self.federations,
        }
    }

    fn normalize(&mut self, mut event: OverrideEvent) -> OverrideEvent {
        if event.id.trim().is_empty() {
            event.id = format!("ovr-{:07}", self.next_event);
            self.next_event += 1;
        }
        if event.timestamp_ms == 0 {
            event.timestamp_ms = epoch_millis();
        }
        event
    }

    /// Validate and merge one event. Returns whether any value changed.
    fn apply_event(&mut self, event: &OverrideEvent) -> StateResult<bool> {
        let writes = self.view().expand(&event.action).map_err(|reason| {
            warn!(event_id = %event.id, %reason, "override rejected");
            StateError::InvalidOverride {
                event_id: event.id.clone(),
                reason,
            }
        })?;
        let stamp = event.stamp();
        let mut changed = false;
        for FieldWrite { key, value } in writes {
            if self.fields.get(&key).is_some_and(|current| *current >= stamp) {
                continue;
            }
            changed |= self.set_value(&key, value);
            self.fields.insert(key, stamp.clone());
        }
        Ok(changed)
    }

    fn set_value(&mut self, key: &FieldKey, value: FieldValue) -> bool {
        fn assign<T: PartialEq>(slot: &mut T, value: T) -> bool {
            if *slot == value {
                false
            } else {
                *slot = value;
                true
            }
        }

        match (key, value) {
            (FieldKey::NodeStatus(id), FieldValue::Status(s)) => {
                self.nodes.get_mut(id).is_some_and(|n| assign(&mut n.status, s))
            }
            (FieldKey::NodeDerate(id), FieldValue::Number(v)) => self
                .nodes
                .get_mut(id)
                .is_some_and(|n| assign(&mut n.thermal_derate, v)),
            (FieldKey::LinkStatus(id), FieldValue::Status(s)) => {
                self.links.get_mut(id).is_some_and(|l| assign(&mut l.status, s))
            }
            (FieldKey::LinkLatency(id), FieldValue::Number(v)) => self
                .links
                .get_mut(id)
                .is_some_and(|l| assign(&mut l.latency_ms, v)),
            (FieldKey::LinkJitter(id), FieldValue::Number(v)) => self
                .links
                .get_mut(id)
                .is_some_and(|l| assign(&mut l.jitter_ms, v)),
            (FieldKey::LinkLoss(id), FieldValue::Number(v)) => self
                .links
                .get_mut(id)
                .is_some_and(|l| assign(&mut l.loss_pct, v)),
            (FieldKey::LinkLimit(id), FieldValue::Limit(v)) => self
                .links
                .get_mut(id)
                .is_some_and(|l| assign(&mut l.bandwidth_limit_mbps, v)),
            (FieldKey::FederationIsolated(id), FieldValue::Flag(v)) => self
                .federations
                .get_mut(id)
                .is_some_and(|f| assign(&mut f.isolated, v)),
            (FieldKey::FederationPartition(a, b), FieldValue::Flag(cut)) => {
                let mut changed = false;
                for (x, y) in [(a, b), (b, a)] {
                    if let Some(fed) = self.federations.get_mut(x) {
                        changed |= if cut {
                            fed.partitioned_from.insert(y.clone())
                        } else {
                            fed.partitioned_from.remove(y)
                        };
                    }
                }
                changed
            }
            _ => false,
        }
    }

    fn current_value(&self, key: &FieldKey) -> Option<FieldValue> {
        Some(match key {
            FieldKey::NodeStatus(id) => FieldValue::Status(self.nodes.get(id)?.status),
            FieldKey::NodeDerate(id) => FieldValue::Number(self.nodes.get(id)?.thermal_derate),
            FieldKey::LinkStatus(id) => FieldValue::Status(self.links.get(id)?.status),
            FieldKey::LinkLatency(id) => FieldValue::Number(self.links.get(id)?.latency_ms),
            FieldKey::LinkJitter(id) => FieldValue::Number(self.links.get(id)?.jitter_ms),
            FieldKey::LinkLoss(id) => FieldValue::Number(self.links.get(id)?.loss_pct),
            FieldKey::LinkLimit(id) => FieldValue::Limit(self.links.get(id)?.bandwidth_limit_mbps),
            FieldKey::FederationIsolated(id) => FieldValue::Flag(self.federations.get(id)?.isolated),
            FieldKey::FederationPartition(a, _) if !self.federations.contains_key(a) => return None,
            FieldKey::FederationPartition(a, b) => FieldValue::Flag(
                self.federations
                    .get(a)
                    .is_some_and(|f| f.partitioned_from.contains(b)),
            ),
        })
    }

    fn reserve(&mut self, request: &ReserveRequest, now_ms: u64) -> StateResult<Reservation> {
        if request.nodes.is_empty() && request.links.is_empty() {
            return Err(StateError::InvalidRequest(format!(
                "reservation for job {} holds nothing",
                request.job_id
            )));
        }

        let mut node_totals: BTreeMap<&str, Resources> = BTreeMap::new();
        for hold in &request.nodes {
            let total = node_totals.entry(hold.node.as_str()).or_default();
            *total = total.checked_add(&hold.amount).ok_or_else(|| {
                StateError::InvalidRequest(format!("amount overflow on node {}", hold.node))
            })?;
        }
        let mut link_totals: BTreeMap<&str, u64> = BTreeMap::new();
        for hold in &request.links {
            let total = link_totals.entry(hold.link.as_str()).or_default();
            *total = total.checked_add(hold.mbps).ok_or_else(|| {
                StateError::InvalidRequest(format!("bandwidth overflow on link {}", hold.link))
            })?;
        }

        // Check everything before touching anything.
        for (&id, amount) in &node_totals {
            let node = self
                .nodes
                .get(id)
                .ok_or_else(|| StateError::NotFound(format!("node {id}")))?;
            if !node.status.is_available() {
                return Err(StateError::Unavailable(EntityRef::Node(id.to_string())));
            }
            if !node.can_admit(amount) {
                return Err(StateError::InsufficientNodeCapacity {
                    node: id.to_string(),
                    requested: *amount,
                    available: node.free(),
                });
            }
        }
        for (&id, &mbps) in &link_totals {
            let link = self
                .links
                .get(id)
                .ok_or_else(|| StateError::NotFound(format!("link {id}")))?;
            if !link.status.is_available() {
                return Err(StateError::Unavailable(EntityRef::Link(id.to_string())));
            }
            if mbps > link.available_mbps() {
                return Err(StateError::InsufficientLinkBandwidth {
                    link: id.to_string(),
                    requested_mbps: mbps,
                    available_mbps: link.available_mbps(),
                });
            }
        }

        let mut node_holds = Vec::with_capacity(node_totals.len());
        for (&id, amount) in &node_totals {
            if let Some(node) = self.nodes.get_mut(id) {
                node.allocated += *amount;
            }
            node_holds.push(NodeHold {
                node: id.to_string(),
                amount: *amount,
            });
        }
        let mut link_holds = Vec::with_capacity(link_totals.len());
        for (&id, &mbps) in &link_totals {
            if let Some(link) = self.links.get_mut(id) {
                link.allocated_mbps += mbps;
            }
            link_holds.push(LinkHold {
                link: id.to_string(),
                mbps,
            });
        }

        let id = format!("res-{:07}", self.next_reservation);
        self.next_reservation += 1;
        let reservation = Reservation {
            id: id.clone(),
            job_id: request.job_id.clone(),
            stage_id: request.stage_id.clone(),
            nodes: node_holds,
            links: link_holds,
            created_at_ms: now_ms,
            expires_at_ms: request.ttl_ms.map(|ttl| now_ms.saturating_add(ttl)),
            status: ReservationStatus::Active,
        };
        self.reservations.insert(id, reservation.clone());
        self.verify_holds(&reservation);
        Ok(reservation)
    }

    fn release(&mut self, id: &str) -> StateResult<Reservation> {
        let mut reservation = self
            .reservations
            .remove(id)
            .ok_or_else(|| StateError::NotFound(format!("reservation {id}")))?;
        for hold in &reservation.nodes {
            if let Some(node) = self.nodes.get_mut(&hold.node) {
                match node.allocated.checked_sub(&hold.amount) {
                    Some(rest) => node.allocated = rest,
                    None => invariant_violation(&format!(
                        "release of {id} underflows node {}",
                        hold.node
                    )),
                }
            }
        }
        for hold in &reservation.links {
            if let Some(link) = self.links.get_mut(&hold.link) {
                match link.allocated_mbps.checked_sub(hold.mbps) {
                    Some(rest) => link.allocated_mbps = rest,
                    None => invariant_violation(&format!(
                        "release of {id} underflows link {}",
                        hold.link
                    )),
                }
            }
        }
        reservation.status = ReservationStatus::Released;
        self.verify_holds(&reservation);
        if self.released_cap > 0 {
            if self.released.len() >= self.released_cap {
                self.released.pop_front();
            }
            self.released.push_back(reservation.clone());
        }
        Ok(reservation)
    }

    fn verify_holds(&self, reservation: &Reservation) {
        for hold in &reservation.nodes {
            self.verify_node(&hold.node);
        }
        for hold in &reservation.links {
            self.verify_link(&hold.link);
        }
    }

    fn verify_node(&self, id: &str) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        let held: Resources = self
            .reservations
            .values()
            .flat_map(|r| r.nodes.iter())
            .filter(|h| h.node == id)
            .map(|h| h.amount)
            .sum();
        if !node.allocated.fits_within(&node.capacity) || node.allocated != held {
            error!(
                node = %id,
                allocated = %node.allocated,
                capacity = %node.capacity,
                held = %held,
                "node capacity invariant violated"
            );
            invariant_violation(&format!("node {id}"));
        }
    }

    fn verify_link(&self, id: &str) {
        let Some(link) = self.links.get(id) else {
            return;
        };
        let held: u64 = self
            .reservations
            .values()
            .flat_map(|r| r.links.iter())
            .filter(|h| h.link == id)
            .map(|h| h.mbps)
            .sum();
        if link.allocated_mbps > link.bandwidth_mbps || link.allocated_mbps != held {
            error!(
                link = %id,
                allocated_mbps = link.allocated_mbps,
                bandwidth_mbps = link.bandwidth_mbps,
                held_mbps = held,
                "link capacity invariant violated"
            );
            invariant_violation(&format!("link {id}"));
        }
    }
}

fn invariant_violation(what: &str) -> ! {
    error!(%what, "internal consistency failure");
    panic!("fabric capacity invariant violated: {what}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{LinkDescriptor, NodeDescriptor};
    use crate::overrides::OverrideAction;
    use fabric_core::HealthStatus;

    fn test_descriptor() -> FabricDescriptor {
        FabricDescriptor {
            nodes: vec![
                NodeDescriptor::new("n1", "east", 10.0, 16.0),
                NodeDescriptor::new("n2", "east", 10.0, 16.0),
                NodeDescriptor::new("n3", "west", 10.0, 16.0),
            ],
            links: vec![LinkDescriptor::new("n1", "n2", 1.0, 1000.0)],
        }
    }

    fn test_store() -> FabricStore {
        FabricStore::init(&test_descriptor(), StoreOptions::default()).unwrap()
    }

    fn cpu(cores: u64) -> Resources {
        Resources::new(cores * 1000, 0, 0)
    }

    fn node_event(id: &str, ts: u64, node: &str, status: HealthStatus) -> OverrideEvent {
        OverrideEvent::new(
            id,
            ts,
            OverrideAction::Node {
                node: node.into(),
                status: Some(status),
                thermal_derate: None,
            },
        )
    }

    #[test]
    fn init_publishes_version_one() {
        let store = test_store();
        let snap = store.snapshot();
        assert_eq!(snap.version, 1);
        assert_eq!(store.version(), 1);
        assert_eq!(snap.nodes.len(), 3);
        assert_eq!(snap.federations["east"].nodes.len(), 2);
    }

    #[test]
    fn reserve_and_release_reconcile() {
        let store = test_store();
        let r = store
            .try_reserve(&ReserveRequest::new("job").node("n1", cpu(6)).link("n1|n2", 100))
            .unwrap();
        assert_eq!(r.id, "res-0000001");
        assert_eq!(store.version(), 2);

        let snap = store.snapshot();
        assert_eq!(snap.nodes["n1"].allocated, cpu(6));
        assert_eq!(snap.links["n1|n2"].allocated_mbps, 100);
        assert!(snap.reservations.contains_key(&r.id));

        let released = store.release(&r.id).unwrap();
        assert_eq!(released.status, ReservationStatus::Released);
        assert_eq!(store.version(), 3);
        assert_eq!(store.snapshot().nodes["n1"].allocated, Resources::ZERO);
        assert_eq!(
            store.reservation(&r.id).unwrap().unwrap().status,
            ReservationStatus::Released
        );
        store.audit().unwrap();
    }

    #[test]
    fn insufficient_capacity_leaves_state_untouched() {
        let store = test_store();
        store.try_reserve(&ReserveRequest::new("a").node("n1", cpu(6))).unwrap();
        let err = store
            .try_reserve(&ReserveRequest::new("b").node("n2", cpu(1)).node("n1", cpu(6)))
            .unwrap_err();
        assert!(matches!(err, StateError::InsufficientNodeCapacity { ref node, .. } if node == "n1"));
        assert!(err.is_capacity());
        assert_eq!(store.version(), 2);
        assert_eq!(store.snapshot().nodes["n2"].allocated, Resources::ZERO);
    }

    #[test]
    fn holds_on_the_same_node_are_summed() {
        let store = test_store();
        let err = store
            .try_reserve(&ReserveRequest::new("a").node("n1", cpu(6)).node("n1", cpu(6)))
            .unwrap_err();
        assert!(matches!(err, StateError::InsufficientNodeCapacity { .. }));
        let r = store
            .try_reserve(&ReserveRequest::new("a").node("n1", cpu(4)).node("n1", cpu(6)))
            .unwrap();
        assert_eq!(r.nodes.len(), 1);
        assert_eq!(r.nodes[0].amount, cpu(10));
    }

    #[test]
    fn release_unknown_is_not_found() {
        let store = test_store();
        assert!(matches!(store.release("res-9999999"), Err(StateError::NotFound(_))));
        let r = store.try_reserve(&ReserveRequest::new("a").node("n1", cpu(1))).unwrap();
        store.release(&r.id).unwrap();
        assert!(matches!(store.release(&r.id), Err(StateError::NotFound(_))));
        assert_eq!(store.version(), 3);
    }

    #[test]
    fn empty_request_is_invalid() {
        let store = test_store();
        assert!(matches!(
            store.try_reserve(&ReserveRequest::new("a")),
            Err(StateError::InvalidRequest(_))
        ));
    }

    #[test]
    fn down_node_is_unavailable() {
        let store = test_store();
        store.apply_override(node_event("e1", 10, "n1", HealthStatus::Down)).unwrap();
        let err = store.try_reserve(&ReserveRequest::new("a").node("n1", cpu(1))).unwrap_err();
        assert!(matches!(err, StateError::Unavailable(EntityRef::Node(ref n)) if n == "n1"));
    }

    #[test]
    fn override_is_idempotent() {
        let store = test_store();
        let first = store.apply_override(node_event("e1", 10, "n1", HealthStatus::Down)).unwrap();
        assert!(first.changed);
        assert_eq!(first.version, 2);
        let again = store.apply_override(node_event("e1", 10, "n1", HealthStatus::Down)).unwrap();
        assert!(!again.changed);
        assert_eq!(store.version(), 2);
    }

    #[test]
    fn older_override_does_not_win() {
        let store = test_store();
        store.apply_override(node_event("late", 20, "n1", HealthStatus::Down)).unwrap();
        let early = store.apply_override(node_event("early", 10, "n1", HealthStatus::Up)).unwrap();
        assert!(!early.changed);
        assert_eq!(store.snapshot().nodes["n1"].status, HealthStatus::Down);
    }

    #[test]
    fn equal_timestamps_break_ties_by_seq() {
        let store = test_store();
        store
            .apply_override(node_event("b", 10, "n1", HealthStatus::Down).with_seq(2))
            .unwrap();
        store
            .apply_override(node_event("a", 10, "n1", HealthStatus::Degraded).with_seq(1))
            .unwrap();
        assert_eq!(store.snapshot().nodes["n1"].status, HealthStatus::Down);
    }

    #[test]
    fn invalid_group_applies_nothing() {
        let store = test_store();
        let event = OverrideEvent::new(
            "g",
            10,
            OverrideAction::Group {
                actions: vec![
                    OverrideAction::FederationBlackout {
                        federation: "east".into(),
                    },
                    OverrideAction::Node {
                        node: "ghost".into(),
                        status: Some(HealthStatus::Down),
                        thermal_derate: None,
                    },
                ],
            },
        );
        let err = store.apply_override(event).unwrap_err();
        assert!(matches!(err, StateError::InvalidOverride { ref event_id, .. } if event_id == "g"));
        assert_eq!(store.version(), 1);
        assert_eq!(store.snapshot().nodes["n1"].status, HealthStatus::Up);
    }

    #[test]
    fn blackout_is_one_version() {
        let store = test_store();
        store
            .apply_override(OverrideEvent::new(
                "b",
                10,
                OverrideAction::FederationBlackout {
                    federation: "east".into(),
                },
            ))
            .unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.version, 2);
        assert_eq!(snap.nodes["n1"].status, HealthStatus::Down);
        assert_eq!(snap.nodes["n2"].status, HealthStatus::Down);
        assert_eq!(snap.nodes["n3"].status, HealthStatus::Up);

        store
            .apply_override(OverrideEvent::new(
                "r",
                20,
                OverrideAction::FederationRecover {
                    federation: "east".into(),
                },
            ))
            .unwrap();
        assert_eq!(store.snapshot().nodes["n1"].status, HealthStatus::Up);
    }

    #[test]
    fn later_action_in_group_wins() {
        let store = test_store();
        store
            .apply_override(OverrideEvent::new(
                "g",
                10,
                OverrideAction::Group {
                    actions: vec![
                        OverrideAction::FederationBlackout {
                            federation: "east".into(),
                        },
                        OverrideAction::Node {
                            node: "n2".into(),
                            status: Some(HealthStatus::Degraded),
                            thermal_derate: None,
                        },
                    ],
                },
            ))
            .unwrap();
        let snap = store.snapshot();
        assert_eq!(snap.nodes["n1"].status, HealthStatus::Down);
        assert_eq!(snap.nodes["n2"].status, HealthStatus::Degraded);
    }

    #[test]
    fn partition_is_symmetric_and_heals() {
        let store = test_store();
        store
            .apply_override(OverrideEvent::new(
                "p",
                10,
                OverrideAction::FederationPartition {
                    a: "west".into(),
                    b: "east".into(),
                },
            ))
            .unwrap();
        let snap = store.snapshot();
        assert!(snap.partitioned("east", "west"));
        assert!(snap.federations["east"].partitioned_from.contains("west"));
        assert!(snap.path_between("n1", "n3").down);

        store
            .apply_override(OverrideEvent::new(
                "h",
                20,
                OverrideAction::FederationHeal {
                    a: "east".into(),
                    b: "west".into(),
                },
            ))
            .unwrap();
        assert!(!store.snapshot().partitioned("east", "west"));
    }

    #[test]
    fn link_throttle_limits_reservations() {
        let store = test_store();
        store
            .apply_override(OverrideEvent::new(
                "t",
                10,
                OverrideAction::Link {
                    link: "n2|n1".into(),
                    status: None,
                    latency_ms: Some(9.0),
                    jitter_ms: None,
                    loss_pct: None,
                    bandwidth_limit_mbps: Some(50),
                },
            ))
            .unwrap();
        let err = store
            .try_reserve(&ReserveRequest::new("a").link("n1|n2", 60))
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::InsufficientLinkBandwidth { available_mbps: 50, .. }
        ));
        assert_eq!(store.snapshot().links["n1|n2"].latency_ms, 9.0);
    }

    #[test]
    fn derate_below_allocation_keeps_invariant() {
        let store = test_store();
        store.try_reserve(&ReserveRequest::new("a").node("n1", cpu(8))).unwrap();
        store
            .apply_override(OverrideEvent::new(
                "hot",
                10,
                OverrideAction::Node {
                    node: "n1".into(),
                    status: None,
                    thermal_derate: Some(0.5),
                },
            ))
            .unwrap();
        let node = store.node("n1").unwrap().unwrap();
        assert_eq!(node.free(), Resources::new(0, 16384, 0));
        assert!(!node.can_admit(&cpu(1)));
        store.audit().unwrap();
    }

    #[test]
    fn batch_applies_in_stamp_order_with_one_publish() {
        let store = test_store();
        let report = store
            .apply_overrides(vec![
                node_event("second", 20, "n1", HealthStatus::Up),
                node_event("first", 10, "n1", HealthStatus::Down),
                node_event("bad", 15, "ghost", HealthStatus::Down),
            ])
            .unwrap();
        assert_eq!(report.applied, vec!["first".to_string(), "second".to_string()]);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.version, 2);
        assert_eq!(store.snapshot().nodes["n1"].status, HealthStatus::Up);
    }

    #[test]
    fn missing_id_and_timestamp_are_filled() {
        let store = test_store();
        let outcome = store.apply_override(node_event("", 0, "n2", HealthStatus::Degraded)).unwrap();
        assert!(outcome.event_id.starts_with("ovr-"));
        let events = store.override_state().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].timestamp_ms > 0);
    }

    #[test]
    fn expired_reservations_are_released() {
        let store = test_store();
        let short = store
            .try_reserve(&ReserveRequest::new("a").node("n1", cpu(2)).ttl(Some(1_000)))
            .unwrap();
        let forever = store.try_reserve(&ReserveRequest::new("b").node("n1", cpu(2))).unwrap();
        let expires = short.expires_at_ms.unwrap();

        assert!(store.release_expired(expires - 1).unwrap().is_empty());
        let released = store.release_expired(expires).unwrap();
        assert_eq!(released, vec![short.id.clone()]);
        let snap = store.snapshot();
        assert_eq!(snap.nodes["n1"].allocated, cpu(2));
        assert!(snap.reservations.contains_key(&forever.id));
    }

    #[test]
    fn override_state_replays_into_fresh_store() {
        let store = test_store();
        store
            .apply_override(OverrideEvent::new(
                "p",
                10,
                OverrideAction::FederationPartition {
                    a: "east".into(),
                    b: "west".into(),
                },
            ))
            .unwrap();
        store.apply_override(node_event("d", 11, "n2", HealthStatus::Down)).unwrap();
        store
            .apply_override(OverrideEvent::new(
                "l",
                12,
                OverrideAction::Link {
                    link: "n1|n2".into(),
                    status: None,
                    latency_ms: None,
                    jitter_ms: None,
                    loss_pct: Some(3.0),
                    bandwidth_limit_mbps: None,
                },
            ))
            .unwrap();

        let events = store.override_state().unwrap();
        let fresh = test_store();
        fresh.apply_overrides(events.clone()).unwrap();
        let (a, b) = (store.snapshot(), fresh.snapshot());
        assert_eq!(a.nodes, b.nodes);
        assert_eq!(a.links, b.links);
        assert_eq!(a.federations, b.federations);

        // Replaying into the source store is a no-op.
        let before = store.version();
        let report = store.apply_overrides(events).unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(store.version(), before);
    }

    #[test]
    fn shutdown_rejects_mutations() {
        let store = test_store();
        store.shutdown().unwrap();
        assert!(store.is_closed());
        assert!(matches!(
            store.try_reserve(&ReserveRequest::new("a").node("n1", cpu(1))),
            Err(StateError::Closed)
        ));
        assert_eq!(store.snapshot().version, 1);
    }

    #[test]
    fn concurrent_reservations_never_overcommit() {
        let store = test_store();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let mut ok = 0;
                    for j in 0..20 {
                        let req = ReserveRequest::new(format!("job-{i}-{j}")).node("n1", cpu(1));
                        if store.try_reserve(&req).is_ok() {
                            ok += 1;
                        }
                    }
                    ok
                })
            })
            .collect();
        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 10);
        assert_eq!(store.snapshot().nodes["n1"].allocated, cpu(10));
        store.audit().unwrap();
    }
}
