//! Candidate enumeration, feasibility pruning, and the in-plan ledger.
//!
//! Infeasible nodes are removed before any scoring happens. The [`Ledger`]
//! tracks what earlier stages of the same plan have already claimed, so a
//! multi-stage plan never double-books a node or a link against the
//! snapshot's remaining capacity.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use fabric_core::{FederationId, LinkId, NodeId, Resources, StrategyConfig};
use fabric_state::{FederationOverview, FederationStats, LinkPath, Node, Snapshot};

use crate::cost::{CostEstimate, CostInput, CostModel};
use crate::job::{Job, Stage};
use crate::plan::{
    FallbackPlan, Feasibility, PlacementPlan, PlanMetrics, PlanScore, ScoreBreakdown,
    StageAssignment,
};

// ── Ledger ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Ledger<'a> {
    snapshot: &'a Snapshot,
    overview: FederationOverview,
    nodes: BTreeMap<NodeId, Resources>,
    links: BTreeMap<LinkId, u64>,
    federation_stages: BTreeMap<FederationId, usize>,
}

impl<'a> Ledger<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self {
            snapshot,
            overview: snapshot.federation_overview(),
            nodes: BTreeMap::new(),
            links: BTreeMap::new(),
            federation_stages: BTreeMap::new(),
        }
    }

    pub fn snapshot(&self) -> &'a Snapshot {
        self.snapshot
    }

    /// Snapshot allocation plus what this plan has claimed so far.
    pub fn allocated(&self, node: &Node) -> Resources {
        node.allocated + self.nodes.get(&node.id).copied().unwrap_or_default()
    }

    pub fn admits(&self, node: &Node, request: &Resources) -> bool {
        node.status.is_available()
            && self
                .allocated(node)
                .checked_add(request)
                .is_some_and(|total| total.fits_within(&node.admissible()))
    }

    /// Reservable bandwidth on the tightest declared hop of `path`.
    pub fn link_headroom(&self, path: &LinkPath) -> Option<u64> {
        path.hops
            .iter()
            .filter_map(|hop| {
                let link = self.snapshot.link(hop)?;
                let claimed = self.links.get(hop).copied().unwrap_or(0);
                Some(link.available_mbps().saturating_sub(claimed))
            })
            .min()
    }

    pub fn federation_stats(&self, federation: &str) -> Option<&FederationStats> {
        self.overview.get(federation)
    }

    /// Mean allocation ratio of `federation` once `extra` is added.
    pub fn projected_federation_load(&self, federation: &str, extra: &Resources) -> f64 {
        let Some(fed) = self.snapshot.federations.get(federation) else {
            return 0.0;
        };
        let members = fed.nodes.iter().filter_map(|id| self.snapshot.node(id));
        let (total, used) = members.fold((Resources::ZERO, Resources::ZERO), |(t, u), n| {
            (t + n.capacity, u + self.allocated(n))
        });
        (used + *extra).mean_utilization(&total).clamp(0.0, 1.0)
    }

    /// Stages of this plan already placed in `federation`.
    pub fn stages_in(&self, federation: &str) -> usize {
        self.federation_stages.get(federation).copied().unwrap_or(0)
    }

    pub fn record(&mut self, assignment: &StageAssignment) {
        *self.nodes.entry(assignment.node.clone()).or_default() += assignment.resources;
        if assignment.link_mbps > 0 {
            for hop in &assignment.path.hops {
                *self.links.entry(hop.clone()).or_default() += assignment.link_mbps;
            }
        }
        *self
            .federation_stages
            .entry(assignment.federation.clone())
            .or_default() += 1;
    }
}

// ── Candidates ─────────────────────────────────────────────────────

/// One stage being placed.
#[derive(Debug, Clone, Copy)]
pub struct StageRequest<'s> {
    pub job: &'s Job,
    pub stage: &'s Stage,
    pub prev_node: Option<&'s str>,
    /// Latency of the stages placed before this one.
    pub latency_so_far: f64,
}

/// A feasible node for a stage, with its cost already estimated.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub node: &'a Node,
    pub path: LinkPath,
    pub allocated: Resources,
    pub cost: CostEstimate,
    /// Federation load after placing the stage here.
    pub projected_load: f64,
}

/// Why candidates were pruned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub down: usize,
    pub federation: usize,
    pub format: usize,
    pub capacity: usize,
    pub path: usize,
    pub bandwidth: usize,
    pub latency: usize,
    pub risk: usize,
}

impl fmt::Display for PruneStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "down={} federation={} format={} capacity={} path={} bandwidth={} latency={} risk={}",
            self.down,
            self.federation,
            self.format,
            self.capacity,
            self.path,
            self.bandwidth,
            self.latency,
            self.risk
        )
    }
}

/// Every node that can legally take `req.stage`, in node-id order.
pub fn feasible_candidates<'a>(
    ledger: &Ledger<'a>,
    cost: &CostModel,
    req: &StageRequest<'_>,
) -> (Vec<Candidate<'a>>, PruneStats) {
    let snapshot = ledger.snapshot();
    let constraints = &req.job.constraints;
    let stage = req.stage;
    let mut pruned = PruneStats::default();
    let mut out = Vec::new();

    for node in snapshot.nodes.values() {
        if !node.status.is_available() {
            pruned.down += 1;
            continue;
        }
        if constraints
            .required_federation
            .as_deref()
            .is_some_and(|f| f != node.federation)
        {
            pruned.federation += 1;
            continue;
        }
        if !stage.runs_on(node) {
            pruned.format += 1;
            continue;
        }
        if !ledger.admits(node, &stage.resources) {
            pruned.capacity += 1;
            continue;
        }

        let path = match req.prev_node {
            Some(prev) => snapshot.path_between(prev, &node.id),
            None => LinkPath::local(),
        };
        if path.down {
            pruned.path += 1;
            continue;
        }
        let needed = stage.inbound_mbps();
        if needed > 0 && ledger.link_headroom(&path).is_some_and(|h| h < needed) {
            pruned.bandwidth += 1;
            continue;
        }
        if let Some(max) = stage.inbound.as_ref().and_then(|l| l.max_latency_ms) {
            if !path.is_local() && path.latency_ms > max {
                pruned.latency += 1;
                continue;
            }
        }

        let allocated = ledger.allocated(node);
        let estimate = cost.estimate(CostInput {
            node,
            allocated,
            path: &path,
            stage,
            federation_partitioned: snapshot.federation_partitioned(&node.id),
        });
        if constraints.risk_tolerance.is_some_and(|t| estimate.risk > t) {
            pruned.risk += 1;
            continue;
        }
        if constraints
            .max_latency_ms
            .is_some_and(|max| req.latency_so_far + estimate.latency_ms > max)
        {
            pruned.latency += 1;
            continue;
        }

        out.push(Candidate {
            node,
            projected_load: ledger.projected_federation_load(&node.federation, &stage.resources),
            path,
            allocated,
            cost: estimate,
        });
    }
    (out, pruned)
}

// ── Scoring helpers ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Scored<'a> {
    pub candidate: Candidate<'a>,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

impl Scored<'_> {
    pub fn into_assignment(self, stage: &Stage) -> StageAssignment {
        StageAssignment {
            stage_id: stage.id.clone(),
            node: self.candidate.node.id.clone(),
            federation: self.candidate.node.federation.clone(),
            format: stage.format_on(self.candidate.node).map(str::to_string),
            link_mbps: if self.candidate.path.hops.is_empty() {
                0
            } else {
                stage.inbound_mbps()
            },
            path: self.candidate.path,
            resources: stage.resources,
            cost: self.candidate.cost,
            score: self.score,
            breakdown: self.breakdown,
        }
    }
}

/// Lower score first; node id breaks ties.
pub fn by_score(a: &Scored<'_>, b: &Scored<'_>) -> Ordering {
    a.score
        .total_cmp(&b.score)
        .then_with(|| a.candidate.node.id.cmp(&b.candidate.node.id))
}

/// Place every stage in order, picking the best-scoring feasible node for
/// each given the stages already placed.
///
/// On failure returns a human-readable reason naming the stage.
pub fn plan_chain<'a, F>(
    job: &Job,
    ledger: &mut Ledger<'a>,
    cost: &CostModel,
    mut score: F,
) -> Result<Vec<StageAssignment>, String>
where
    F: FnMut(&Candidate<'a>, &Ledger<'a>, &StageRequest<'_>) -> (f64, ScoreBreakdown),
{
    let stages = job.effective_stages();
    let mut placed: Vec<StageAssignment> = Vec::with_capacity(stages.len());
    let mut latency = 0.0;

    for stage in &stages {
        let prev = placed.last().map(|a| a.node.clone());
        let req = StageRequest {
            job,
            stage,
            prev_node: prev.as_deref(),
            latency_so_far: latency,
        };
        let (candidates, pruned) = feasible_candidates(ledger, cost, &req);
        let best = candidates
            .into_iter()
            .map(|candidate| {
                let (score, breakdown) = score(&candidate, ledger, &req);
                Scored {
                    candidate,
                    score,
                    breakdown,
                }
            })
            .min_by(by_score);
        let Some(best) = best else {
            return Err(format!("stage {}: no feasible node ({pruned})", stage.id));
        };
        latency += best.candidate.cost.latency_ms;
        let assignment = best.into_assignment(stage);
        ledger.record(&assignment);
        placed.push(assignment);
    }
    Ok(placed)
}

/// Wrap a chain result into a plan, scoring it against the job's deadline.
#[allow(clippy::too_many_arguments)]
pub fn finish(
    job: &Job,
    strategy: &str,
    snapshot: &Snapshot,
    cost: &CostModel,
    config: &StrategyConfig,
    primary: Result<Vec<StageAssignment>, String>,
    fallbacks: Vec<FallbackPlan>,
    degraded_fallback: bool,
) -> PlacementPlan {
    let primary = match primary {
        Ok(primary) => primary,
        Err(reason) => {
            return PlacementPlan::infeasible(job.id.clone(), strategy, snapshot.version, reason);
        }
    };
    let latency: f64 = primary.iter().map(|s| s.cost.latency_ms).sum();
    let slo = job
        .deadline_ms
        .map_or(0.0, |deadline| cost.slo_penalty(deadline, latency));
    PlacementPlan {
        job_id: job.id.clone(),
        strategy: strategy.to_string(),
        snapshot_version: snapshot.version,
        score: PlanScore::from_stages(&primary, slo, config.slo_weight),
        metrics: PlanMetrics::compute(&primary, &fallbacks),
        primary,
        fallbacks,
        verdict: Feasibility::Feasible,
        degraded_fallback,
    }
}
