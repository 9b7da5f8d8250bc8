//! Jobs submitted for planning.
//!
//! A job is either a single resource request or an ordered chain of stages.
//! Each stage after the first may carry an inbound link requirement on the
//! path from the previous stage's node.

use std::collections::HashSet;
use std::path::Path;

use fabric_core::{FederationId, JobId, Resources};
use fabric_state::Node;
use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};

/// Name given to the implicit stage of a single-stage job.
pub const MAIN_STAGE: &str = "main";

fn default_size_mb() -> f64 {
    10.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    #[serde(default)]
    pub resources: Resources,
    /// Data this stage receives from the previous stage.
    #[serde(default = "default_size_mb")]
    pub size_mb: f64,
    #[serde(default)]
    pub io_bound: bool,
    /// Requirement on the path from the previous stage.
    #[serde(default)]
    pub inbound: Option<LinkRequirement>,
    /// Formats the stage can run as, most preferred first. Empty means any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_formats: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_formats: Vec<String>,
}

impl Stage {
    pub fn new(id: impl Into<String>, resources: Resources) -> Self {
        Self {
            id: id.into(),
            resources,
            size_mb: default_size_mb(),
            io_bound: false,
            inbound: None,
            allowed_formats: Vec::new(),
            disallowed_formats: Vec::new(),
        }
    }

    pub fn with_formats<A, D>(mut self, allowed: A, disallowed: D) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        D: IntoIterator,
        D::Item: Into<String>,
    {
        self.allowed_formats = allowed.into_iter().map(Into::into).collect();
        self.disallowed_formats = disallowed.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `node` can run this stage in some acceptable format.
    ///
    /// A node offering any disallowed format is rejected outright.
    pub fn runs_on(&self, node: &Node) -> bool {
        if self.disallowed_formats.iter().any(|f| node.supports_format(f)) {
            return false;
        }
        self.allowed_formats.is_empty() || self.allowed_formats.iter().any(|f| node.supports_format(f))
    }

    /// The most preferred allowed format `node` supports.
    pub fn format_on(&self, node: &Node) -> Option<&str> {
        self.allowed_formats
            .iter()
            .find(|f| node.supports_format(f))
            .map(String::as_str)
    }

    pub fn with_inbound(mut self, bandwidth_mbps: u64, max_latency_ms: Option<f64>) -> Self {
        self.inbound = Some(LinkRequirement {
            bandwidth_mbps,
            max_latency_ms,
        });
        self
    }

    pub fn with_size_mb(mut self, size_mb: f64) -> Self {
        self.size_mb = size_mb;
        self
    }

    /// Bandwidth to hold on declared links into this stage.
    pub fn inbound_mbps(&self) -> u64 {
        self.inbound.as_ref().map_or(0, |l| l.bandwidth_mbps)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRequirement {
    #[serde(default)]
    pub bandwidth_mbps: u64,
    #[serde(default)]
    pub max_latency_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConstraints {
    /// Hard end-to-end latency limit.
    pub max_latency_ms: Option<f64>,
    /// Highest acceptable per-stage risk in `[0, 1]`.
    pub risk_tolerance: Option<f64>,
    pub required_federation: Option<FederationId>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Request for single-stage jobs; ignored when `stages` is non-empty.
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub constraints: JobConstraints,
    /// Soft deadline feeding the SLO penalty.
    #[serde(default)]
    pub deadline_ms: Option<f64>,
    /// Lifetime of the committed reservations.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

impl Job {
    pub fn single(id: impl Into<JobId>, resources: Resources) -> Self {
        Self {
            id: id.into(),
            resources,
            stages: Vec::new(),
            constraints: JobConstraints::default(),
            deadline_ms: None,
            ttl_ms: None,
        }
    }

    pub fn multi(id: impl Into<JobId>, stages: Vec<Stage>) -> Self {
        Self {
            stages,
            ..Self::single(id, Resources::ZERO)
        }
    }

    pub fn with_constraints(mut self, constraints: JobConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Stages to place, in order.
    pub fn effective_stages(&self) -> Vec<Stage> {
        if self.stages.is_empty() {
            vec![Stage::new(MAIN_STAGE, self.resources)]
        } else {
            self.stages.clone()
        }
    }

    pub fn validate(&self) -> PlanResult<()> {
        if self.id.trim().is_empty() {
            return Err(PlanError::InvalidJob("job id is empty".into()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                return Err(PlanError::InvalidJob(format!("job {}: stage with empty id", self.id)));
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(PlanError::InvalidJob(format!(
                    "job {}: duplicate stage {}",
                    self.id, stage.id
                )));
            }
            if !stage.size_mb.is_finite() || stage.size_mb < 0.0 {
                return Err(PlanError::InvalidJob(format!(
                    "job {}: stage {} has negative size",
                    self.id, stage.id
                )));
            }
        }
        if let Some(tolerance) = self.constraints.risk_tolerance {
            if !(0.0..=1.0).contains(&tolerance) {
                return Err(PlanError::InvalidJob(format!(
                    "job {}: risk_tolerance out of [0, 1]",
                    self.id
                )));
            }
        }
        if self.constraints.max_latency_ms.is_some_and(|l| !l.is_finite() || l <= 0.0) {
            return Err(PlanError::InvalidJob(format!(
                "job {}: max_latency_ms must be positive",
                self.id
            )));
        }
        Ok(())
    }

    /// Load a job from `.toml` or `.json`.
    pub fn from_file(path: &Path) -> PlanResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PlanError::InvalidJob(format!("{}: {e}", path.display())))?;
        let job: Job = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| PlanError::InvalidJob(e.to_string()))?
            }
            _ => serde_json::from_str(&content).map_err(|e| PlanError::InvalidJob(e.to_string()))?,
        };
        job.validate()?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_stage_job_has_one_main_stage() {
        let job = Job::single("j1", Resources::new(2000, 0, 0));
        let stages = job.effective_stages();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].id, MAIN_STAGE);
        assert_eq!(stages[0].resources.cpu_millis, 2000);
    }

    #[test]
    fn validate_rejects_duplicate_stages() {
        let job = Job::multi(
            "j",
            vec![Stage::new("s", Resources::ZERO), Stage::new("s", Resources::ZERO)],
        );
        assert!(matches!(job.validate(), Err(PlanError::InvalidJob(_))));
    }

    #[test]
    fn validate_rejects_bad_constraints() {
        let job = Job::single("j", Resources::ZERO).with_constraints(JobConstraints {
            risk_tolerance: Some(1.5),
            ..Default::default()
        });
        assert!(job.validate().is_err());
        assert!(Job::single(" ", Resources::ZERO).validate().is_err());
    }

    fn node_with(formats: &[&str]) -> Node {
        let desc = fabric_state::FabricDescriptor {
            nodes: vec![fabric_state::NodeDescriptor::new("n", "f", 4.0, 8.0)],
            links: vec![],
        };
        let store = fabric_state::FabricStore::init(&desc, fabric_state::StoreOptions::default()).unwrap();
        let mut node = store.snapshot().node("n").unwrap().clone();
        node.profile.formats_supported = formats.iter().map(|f| f.to_string()).collect();
        node
    }

    #[test]
    fn format_filter_follows_allowed_and_disallowed() {
        let any = Stage::new("s", Resources::ZERO);
        let gpu = Stage::new("s", Resources::ZERO).with_formats(["cuda", "native"], Vec::<String>::new());
        let no_wasm = Stage::new("s", Resources::ZERO).with_formats(Vec::<String>::new(), ["wasm"]);

        let bare = node_with(&[]);
        let native = node_with(&["native"]);
        let edge = node_with(&["native", "wasm"]);

        assert!(any.runs_on(&bare));
        assert!(!gpu.runs_on(&bare));
        assert!(gpu.runs_on(&native));
        assert_eq!(gpu.format_on(&native), Some("native"));
        assert_eq!(gpu.format_on(&node_with(&["native", "cuda"])), Some("cuda"));
        assert!(no_wasm.runs_on(&native));
        assert!(!no_wasm.runs_on(&edge));
        assert_eq!(any.format_on(&native), None);
    }

    #[test]
    fn loads_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.toml");
        std::fs::write(
            &path,
            r#"
id = "etl"
deadline_ms = 500.0

[constraints]
required_federation = "east"

[[stages]]
id = "extract"
resources = { cpu_millis = 1000, memory_mb = 512 }

[[stages]]
id = "load"
size_mb = 200.0
inbound = { bandwidth_mbps = 100 }
allowed_formats = ["cuda", "native"]
disallowed_formats = ["wasm"]
"#,
        )
        .unwrap();
        let job = Job::from_file(&path).unwrap();
        assert_eq!(job.stages.len(), 2);
        assert!(job.stages[0].allowed_formats.is_empty());
        assert_eq!(job.stages[1].allowed_formats, vec!["cuda", "native"]);
        assert_eq!(job.stages[1].disallowed_formats, vec!["wasm"]);
        assert_eq!(job.stages[0].size_mb, 10.0);
        assert_eq!(job.stages[1].inbound_mbps(), 100);
        assert_eq!(job.constraints.required_federation.as_deref(), Some("east"));
    }
}
