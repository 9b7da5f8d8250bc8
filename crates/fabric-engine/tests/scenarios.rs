//! End-to-end planning scenarios across store, strategies, and commit.

use std::sync::Arc;

use fabric_core::{EngineConfig, HealthStatus, Resources, StrategyConfig};
use fabric_engine::{CancelToken, Engine, EngineError, PlanPhase};
use fabric_placement::{
    AdaptivePlanner, CostModel, GreedyPlanner, Job, JobConstraints, PlacementPlan,
    PlacementStrategy, Stage, StrategyKind, StrategyRegistry,
};
use fabric_state::{
    FabricDescriptor, LinkDescriptor, LinkPath, NodeDescriptor, OverrideAction, OverrideEvent,
    Snapshot, SnapshotArchive,
};

fn cores(c: u64) -> Resources {
    Resources::new(c * 1000, 0, 0)
}

fn flat(nodes: usize, cores_per_node: f64) -> FabricDescriptor {
    FabricDescriptor {
        nodes: (1..=nodes)
            .map(|i| NodeDescriptor::new(format!("n{i}"), "f", cores_per_node, 64.0))
            .collect(),
        links: vec![],
    }
}

fn two_federations() -> FabricDescriptor {
    FabricDescriptor {
        nodes: vec![
            NodeDescriptor::new("e1", "east", 8.0, 32.0),
            NodeDescriptor::new("e2", "east", 8.0, 32.0),
            NodeDescriptor::new("w1", "west", 8.0, 32.0),
            NodeDescriptor::new("w2", "west", 8.0, 32.0),
        ],
        links: vec![
            LinkDescriptor::new("e1", "e2", 1.0, 1000.0),
            LinkDescriptor::new("w1", "w2", 1.0, 1000.0),
            LinkDescriptor::new("east", "west", 25.0, 400.0),
        ],
    }
}

fn engine(desc: &FabricDescriptor) -> Engine {
    Engine::from_descriptor(desc, EngineConfig::default()).unwrap()
}

fn node_status(id: &str, status: HealthStatus, ts: u64) -> OverrideEvent {
    OverrideEvent::new(
        format!("{id}-{ts}"),
        ts,
        OverrideAction::Node {
            node: id.into(),
            status: Some(status),
            thermal_derate: None,
        },
    )
}

// ── Commit path ────────────────────────────────────────────────────

#[test]
fn versions_advance_with_each_commit() {
    let engine = engine(&flat(3, 10.0));
    let v0 = engine.get_snapshot().version;
    let a = engine.plan(&Job::single("a", cores(6)), &StrategyKind::Greedy).unwrap();
    let b = engine.plan(&Job::single("b", cores(6)), &StrategyKind::Greedy).unwrap();
    assert_eq!(a.plan.snapshot_version, v0);
    assert!(b.plan.snapshot_version > a.plan.snapshot_version);
    assert_eq!(engine.get_snapshot().reservations.len(), 2);
    engine.store().audit().unwrap();
}

#[test]
fn infeasible_job_changes_nothing() {
    let engine = engine(&flat(2, 4.0));
    let version = engine.store().version();
    let err = engine.plan(&Job::single("big", cores(5)), &StrategyKind::Greedy).unwrap_err();
    assert!(matches!(err, EngineError::Infeasible { .. }));
    assert_eq!(err.phase(), Some(PlanPhase::Infeasible));
    assert_eq!(engine.store().version(), version);
}

#[test]
fn plan_from_old_snapshot_is_stale_after_outage() {
    let engine = engine(&flat(2, 8.0));
    let old = engine.get_snapshot();
    engine
        .apply_override(node_status("n1", HealthStatus::Down, 10))
        .unwrap();

    let err = engine
        .plan_against(&Job::single("j", cores(2)), &StrategyKind::Greedy, old, &CancelToken::new())
        .unwrap_err();
    assert!(err.is_retryable());
    assert!(engine.get_snapshot().reservations.is_empty());

    // A fresh attempt avoids the downed node.
    let ok = engine.plan_with_retry(&Job::single("j", cores(2)), &StrategyKind::Greedy).unwrap();
    assert_eq!(ok.plan.nodes(), vec!["n2"]);
    assert_eq!(ok.attempts, 1);
}

#[test]
fn plan_from_old_snapshot_is_stale_after_capacity_taken() {
    let engine = engine(&flat(1, 8.0));
    let old = engine.get_snapshot();
    engine.plan(&Job::single("first", cores(6)), &StrategyKind::Greedy).unwrap();
    let err = engine
        .plan_against(&Job::single("second", cores(4)), &StrategyKind::Greedy, old, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleSnapshot { .. }));
    assert_eq!(engine.get_snapshot().reservations.len(), 1);
}

#[test]
fn plan_from_old_snapshot_is_stale_after_link_down() {
    let desc = FabricDescriptor {
        links: vec![LinkDescriptor::new("n1", "n2", 1.0, 100.0)],
        ..flat(2, 4.0)
    };
    let engine = engine(&desc);
    let job = Job::multi("j", vec![Stage::new("a", cores(3)), Stage::new("b", cores(3))]);
    let old = engine.get_snapshot();
    engine
        .apply_override(OverrideEvent::new(
            "n1|n2-down",
            10,
            OverrideAction::Link {
                link: "n1|n2".into(),
                status: Some(HealthStatus::Down),
                latency_ms: None,
                jitter_ms: None,
                loss_pct: None,
                bandwidth_limit_mbps: None,
            },
        ))
        .unwrap();
    assert!(engine.get_snapshot().path_between("n1", "n2").down);

    let err = engine
        .plan_against(&job, &StrategyKind::Greedy, old, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleSnapshot { .. }));
    assert_eq!(err.phase(), Some(PlanPhase::StaleSnapshot));
    let snap = engine.get_snapshot();
    assert!(snap.reservations.is_empty());
    assert!(snap.nodes.values().all(|n| n.allocated == Resources::ZERO));
}

#[test]
fn plan_from_old_snapshot_is_stale_after_partition() {
    // One small node per federation, so a two-stage job must cross.
    let desc = FabricDescriptor {
        nodes: vec![
            NodeDescriptor::new("e1", "east", 4.0, 16.0),
            NodeDescriptor::new("w1", "west", 4.0, 16.0),
        ],
        links: vec![LinkDescriptor::new("east", "west", 25.0, 400.0)],
    };
    let engine = engine(&desc);
    let job = Job::multi("j", vec![Stage::new("a", cores(3)), Stage::new("b", cores(3))]);
    let old = engine.get_snapshot();
    engine
        .apply_override(OverrideEvent::new(
            "cut",
            10,
            OverrideAction::FederationPartition {
                a: "east".into(),
                b: "west".into(),
            },
        ))
        .unwrap();

    let err = engine
        .plan_against(&job, &StrategyKind::Greedy, old.clone(), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleSnapshot { .. }));
    assert!(engine.get_snapshot().reservations.is_empty());

    // Dry runs share the live check.
    let dry = job.with_constraints(JobConstraints {
        dry_run: true,
        ..Default::default()
    });
    assert!(matches!(
        engine.plan_against(&dry, &StrategyKind::Greedy, old, &CancelToken::new()),
        Err(EngineError::StaleSnapshot { .. })
    ));
}

/// Always places every stage on `n1`, ignoring capacity.
struct Stubborn;

impl PlacementStrategy for Stubborn {
    fn name(&self) -> &str {
        "stubborn"
    }

    fn plan(&self, job: &Job, snapshot: &Snapshot, cost: &CostModel, config: &StrategyConfig) -> PlacementPlan {
        let stages = job.effective_stages();
        let light = Job::multi(
            job.id.clone(),
            stages.iter().map(|s| Stage::new(s.id.clone(), cores(1))).collect(),
        );
        let mut plan = GreedyPlanner::new().plan(&light, snapshot, cost, config);
        plan.strategy = "stubborn".into();
        for (assignment, stage) in plan.primary.iter_mut().zip(&stages) {
            assignment.node = "n1".into();
            assignment.federation = "f".into();
            assignment.path = LinkPath::local();
            assignment.link_mbps = 0;
            assignment.resources = stage.resources;
        }
        plan
    }
}

#[test]
fn overcommitting_plan_is_partial_infeasible_and_rolled_back() {
    let mut registry = StrategyRegistry::with_builtins();
    registry.register(Arc::new(Stubborn));
    let engine = engine(&flat(2, 10.0)).with_registry(registry);
    let job = Job::multi("j", vec![Stage::new("a", cores(6)), Stage::new("b", cores(6))]);

    let err = engine.plan(&job, &"stubborn".into()).unwrap_err();
    assert!(matches!(err, EngineError::PartialInfeasible { .. }));
    assert!(!err.is_retryable());
    let snap = engine.get_snapshot();
    assert!(snap.reservations.is_empty());
    assert_eq!(snap.node("n1").unwrap().allocated, Resources::ZERO);
}

#[test]
fn dry_run_and_commit_agree() {
    let engine = engine(&two_federations());
    let job = Job::multi(
        "etl",
        vec![Stage::new("extract", cores(2)), Stage::new("load", cores(2)).with_inbound(50, None)],
    );
    let dry_job = job.clone().with_constraints(JobConstraints {
        dry_run: true,
        ..Default::default()
    });

    let dry = engine.plan(&dry_job, &StrategyKind::Resilient).unwrap();
    assert_eq!(dry.phase, PlanPhase::DryRunOk);
    assert!(engine.get_snapshot().reservations.is_empty());

    let real = engine.plan(&job, &StrategyKind::Resilient).unwrap();
    assert_eq!(real.phase, PlanPhase::Committed);
    assert_eq!(dry.plan.nodes(), real.plan.nodes());
    assert_eq!(dry.plan.score, real.plan.score);
}

#[test]
fn cancelled_request_has_no_side_effects() {
    let engine = engine(&flat(2, 8.0));
    let cancel = CancelToken::new();
    cancel.cancel();
    let version = engine.store().version();
    let err = engine
        .plan_with_cancel(&Job::single("j", cores(1)), &StrategyKind::Greedy, &cancel)
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled(_)));
    assert_eq!(engine.store().version(), version);
}

// ── Resilient / federated ──────────────────────────────────────────

#[test]
fn fallbacks_are_planned_but_not_reserved() {
    let engine = engine(&two_federations());
    let outcome = engine
        .plan(&Job::single("j", cores(2)), &StrategyKind::Federated)
        .unwrap();
    assert_eq!(outcome.plan.fallbacks.len(), 2);
    assert_eq!(outcome.reservations.len(), 1);
    let reserved: Resources = engine
        .get_snapshot()
        .nodes
        .values()
        .map(|n| n.allocated)
        .sum();
    assert_eq!(reserved, cores(2));
}

#[test]
fn federation_blackout_moves_placement() {
    let engine = engine(&two_federations());
    let blackout = OverrideEvent::new(
        "bo",
        5,
        OverrideAction::FederationBlackout {
            federation: "east".into(),
        },
    );
    let before = engine.store().version();
    engine.apply_override(blackout).unwrap();
    let snap = engine.get_snapshot();
    assert_eq!(snap.version, before + 1);
    assert!(
        snap.federations["east"]
            .nodes
            .iter()
            .all(|n| snap.node(n).unwrap().status == HealthStatus::Down)
    );

    let outcome = engine
        .plan(&Job::single("j", cores(2)), &StrategyKind::Resilient)
        .unwrap();
    assert_eq!(outcome.plan.primary[0].federation, "west");
    assert!(outcome.plan.degraded_fallback);
}

#[test]
fn partition_forbids_cross_federation_stages() {
    let engine = engine(&two_federations());
    engine
        .apply_override(OverrideEvent::new(
            "cut",
            1,
            OverrideAction::FederationPartition {
                a: "east".into(),
                b: "west".into(),
            },
        ))
        .unwrap();
    let job = Job::multi("j", vec![Stage::new("a", cores(6)), Stage::new("b", cores(6))]);
    let outcome = engine.plan(&job, &StrategyKind::Federated).unwrap();
    let feds: Vec<&str> = outcome.plan.primary.iter().map(|s| s.federation.as_str()).collect();
    assert_eq!(feds[0], feds[1]);
}

#[test]
fn link_holds_follow_reservations() {
    let engine = engine(&two_federations());
    let job = Job::multi(
        "j",
        vec![
            Stage::new("a", cores(6)),
            Stage::new("b", cores(6)).with_inbound(100, None),
        ],
    );
    let outcome = engine.plan(&job, &StrategyKind::Greedy).unwrap();
    let hop = outcome.plan.primary[1].path.hops[0].clone();
    assert_eq!(engine.store().link(&hop).unwrap().unwrap().allocated_mbps, 100);

    assert_eq!(engine.release_outcome(&outcome).unwrap(), 2);
    assert_eq!(engine.store().link(&hop).unwrap().unwrap().allocated_mbps, 0);
    assert!(matches!(
        engine.release(&outcome.reservations[0].id),
        Err(EngineError::NotFound(_))
    ));
}

#[test]
fn per_call_config_overrides_engine_config() {
    let engine = engine(&two_federations());
    let config = StrategyConfig {
        fallbacks: 0,
        ..StrategyConfig::federated()
    };
    let outcome = engine
        .plan_with_config(&Job::single("j", cores(2)), &StrategyKind::Federated, &config)
        .unwrap();
    assert!(outcome.plan.fallbacks.is_empty());
    assert!(!outcome.plan.degraded_fallback);

    let jobs = vec![Job::single("k", cores(2))];
    let batch = engine.plan_batch_with_config(&jobs, &StrategyKind::Federated, &config);
    assert!(batch[0].as_ref().unwrap().plan.fallbacks.is_empty());
}

// ── Batches, overrides, persistence ────────────────────────────────

#[test]
fn batch_is_sequential_and_deterministic() {
    let jobs: Vec<Job> = (0..4).map(|i| Job::single(format!("j{i}"), cores(6))).collect();
    let run = || {
        let engine = engine(&flat(3, 10.0));
        engine
            .plan_batch(&jobs, &StrategyKind::Greedy)
            .into_iter()
            .map(|r| r.map(|o| o.plan.nodes().join(",")).map_err(|e| e.to_string()))
            .collect::<Vec<_>>()
    };
    let first = run();
    assert_eq!(first[0], Ok("n1".to_string()));
    assert_eq!(first[1], Ok("n2".to_string()));
    assert_eq!(first[2], Ok("n3".to_string()));
    assert!(first[3].is_err());
    assert_eq!(first, run());
}

#[test]
fn invalid_override_is_rejected() {
    let engine = engine(&flat(1, 4.0));
    let err = engine
        .apply_override(node_status("ghost", HealthStatus::Down, 1))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidOverride { .. }));
}

#[test]
fn duplicate_and_late_overrides_are_ignored() {
    let engine = engine(&flat(1, 4.0));
    engine.apply_override(node_status("n1", HealthStatus::Down, 20)).unwrap();
    let version = engine.store().version();
    let dup = engine.apply_override(node_status("n1", HealthStatus::Down, 20)).unwrap();
    let late = engine.apply_override(node_status("n1", HealthStatus::Up, 10)).unwrap();
    assert!(!dup.changed);
    assert!(!late.changed);
    assert_eq!(engine.store().version(), version);
    assert_eq!(engine.get_snapshot().node("n1").unwrap().status, HealthStatus::Down);
}

#[test]
fn policy_state_survives_checkpoint() {
    let archive = SnapshotArchive::open_in_memory().unwrap();
    let engine = engine(&flat(2, 8.0)).with_archive(archive.clone());

    let old = engine.get_snapshot();
    engine.apply_override(node_status("n1", HealthStatus::Down, 1)).unwrap();
    let err = engine
        .plan_against(&Job::single("j", cores(1)), &StrategyKind::Adaptive, old, &CancelToken::new())
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(engine.checkpoint_policies().unwrap(), 1);
    assert_eq!(engine.archive_snapshot().unwrap(), engine.store().version());

    let adaptive = Arc::new(AdaptivePlanner::new());
    let mut registry = StrategyRegistry::with_builtins();
    registry.register(adaptive.clone());
    let restored = self::engine(&flat(2, 8.0))
        .with_registry(registry)
        .with_archive(archive);
    assert_eq!(restored.restore_policies().unwrap(), 1);
    assert!(adaptive.penalty("n1") > 0.0);
}

#[test]
fn shutdown_stops_mutations_but_not_reads() {
    let engine = engine(&flat(1, 4.0));
    engine.shutdown().unwrap();
    assert!(engine.plan(&Job::single("j", cores(1)), &StrategyKind::Greedy).is_err());
    assert_eq!(engine.get_snapshot().nodes.len(), 1);
}

#[test]
fn archived_snapshot_reloads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("twin.redb");
    let version = {
        let engine = engine(&flat(2, 8.0)).with_archive(SnapshotArchive::open(&path).unwrap());
        engine.plan(&Job::single("j", cores(3)), &StrategyKind::Greedy).unwrap();
        engine.archive_snapshot().unwrap()
    };

    let archive = SnapshotArchive::open(&path).unwrap();
    let snap = archive.latest_snapshot().unwrap().unwrap();
    assert_eq!(snap.version, version);
    assert_eq!(snap.reservations.len(), 1);
    assert_eq!(snap.node("n1").unwrap().allocated, cores(3));
    assert_eq!(archive.snapshot_versions().unwrap(), vec![version]);
}
