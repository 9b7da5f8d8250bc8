//! Fabric descriptors: the validated input the store is initialized from.
//!
//! Descriptors load from TOML or JSON depending on the file extension.
//! Resource amounts are written in human units (cores, GB) and converted to
//! integer milli-units on load.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use fabric_core::{FederationId, HealthStatus, NodeId, Resources, link_key};
use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::types::*;

/// Federation used for nodes that declare none and carry no locality label.
pub const DEFAULT_FEDERATION: &str = "global";

/// Labels consulted, in order, when a node declares no federation.
const FEDERATION_LABELS: [&str; 5] = ["federation", "zone", "site", "rack", "region"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricDescriptor {
    pub nodes: Vec<NodeDescriptor>,
    pub links: Vec<LinkDescriptor>,
}

/// Resource amounts in descriptor units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceUnits {
    pub cpu_cores: f64,
    pub mem_gb: f64,
    pub gpu_vram_gb: f64,
}

impl ResourceUnits {
    pub fn to_resources(&self) -> Resources {
        Resources::from_units(self.cpu_cores, self.mem_gb, self.gpu_vram_gb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    #[serde(alias = "name")]
    pub id: NodeId,
    #[serde(default)]
    pub federation: Option<FederationId>,
    pub resources: ResourceUnits,
    #[serde(default)]
    pub status: HealthStatus,
    #[serde(default)]
    pub thermal_derate: f64,
    #[serde(default)]
    pub profile: NodeProfile,
    #[serde(default)]
    pub network: NetworkHints,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodeDescriptor {
    pub fn new(id: impl Into<NodeId>, federation: impl Into<FederationId>, cpu_cores: f64, mem_gb: f64) -> Self {
        Self {
            id: id.into(),
            federation: Some(federation.into()),
            resources: ResourceUnits {
                cpu_cores,
                mem_gb,
                gpu_vram_gb: 0.0,
            },
            status: HealthStatus::Up,
            thermal_derate: 0.0,
            profile: NodeProfile::default(),
            network: NetworkHints::default(),
            labels: BTreeMap::new(),
        }
    }

    /// Declared federation, else the first locality label, else `global`.
    pub fn federation_name(&self) -> FederationId {
        if let Some(fed) = self.federation.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
            return fed.to_string();
        }
        FEDERATION_LABELS
            .iter()
            .filter_map(|key| self.labels.get(*key))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .unwrap_or(DEFAULT_FEDERATION)
            .to_string()
    }
}

/// An undirected link between two nodes or between two federations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkDescriptor {
    pub a: String,
    pub b: String,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    #[serde(default)]
    pub loss_pct: Option<f64>,
    #[serde(default)]
    pub bandwidth_mbps: Option<f64>,
    #[serde(default)]
    pub status: HealthStatus,
}

impl LinkDescriptor {
    pub fn new(a: impl Into<String>, b: impl Into<String>, latency_ms: f64, bandwidth_mbps: f64) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            latency_ms: Some(latency_ms),
            jitter_ms: None,
            loss_pct: None,
            bandwidth_mbps: Some(bandwidth_mbps),
            status: HealthStatus::Up,
        }
    }
}

/// Topology built from a descriptor, ready to seed the store.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub nodes: BTreeMap<NodeId, Node>,
    pub links: BTreeMap<String, Link>,
    pub federations: BTreeMap<FederationId, Federation>,
}

impl FabricDescriptor {
    /// Load a descriptor from `.toml` or `.json`.
    pub fn from_file(path: &Path) -> StateResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StateError::InvalidDescriptor(format!("{}: {e}", path.display())))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| StateError::InvalidDescriptor(e.to_string())),
            _ => serde_json::from_str(&content)
                .map_err(|e| StateError::InvalidDescriptor(e.to_string())),
        }
    }

    /// Validate and build the initial topology.
    pub fn build(&self, defaults: &fabric_core::NetworkDefaults) -> StateResult<Topology> {
        let mut topo = Topology::default();

        for desc in &self.nodes {
            let id = desc.id.trim();
            if id.is_empty() {
                return Err(invalid("node with empty id"));
            }
            if id.contains('|') {
                return Err(invalid(format!("node id {id:?} contains '|'")));
            }
            if topo.nodes.contains_key(id) {
                return Err(invalid(format!("duplicate node {id}")));
            }
            if !(0.0..=1.0).contains(&desc.thermal_derate) {
                return Err(invalid(format!("node {id}: thermal_derate out of [0, 1]")));
            }
            let federation = desc.federation_name();
            topo.federations
                .entry(federation.clone())
                .or_insert_with(|| Federation {
                    id: federation.clone(),
                    ..Default::default()
                })
                .nodes
                .push(id.to_string());
            topo.nodes.insert(
                id.to_string(),
                Node {
                    id: id.to_string(),
                    federation,
                    capacity: desc.resources.to_resources(),
                    allocated: Resources::ZERO,
                    status: desc.status,
                    thermal_derate: desc.thermal_derate,
                    profile: desc.profile.clone(),
                    network: desc.network.clone(),
                    labels: desc.labels.clone(),
                },
            );
        }

        for desc in &self.links {
            let scope = if topo.nodes.contains_key(&desc.a) && topo.nodes.contains_key(&desc.b) {
                LinkScope::Node
            } else if topo.federations.contains_key(&desc.a)
                && topo.federations.contains_key(&desc.b)
            {
                LinkScope::Federation
            } else {
                return Err(invalid(format!(
                    "link {}-{} must join two nodes or two federations",
                    desc.a, desc.b
                )));
            };
            if desc.a == desc.b {
                return Err(invalid(format!("self link on {}", desc.a)));
            }
            let latency_ms = desc.latency_ms.unwrap_or(defaults.latency_ms);
            let jitter_ms = desc.jitter_ms.unwrap_or(defaults.jitter_ms);
            let loss_pct = desc.loss_pct.unwrap_or(defaults.loss_pct);
            let bandwidth = desc.bandwidth_mbps.unwrap_or(defaults.bandwidth_mbps);
            for (name, value) in [
                ("latency_ms", latency_ms),
                ("jitter_ms", jitter_ms),
                ("loss_pct", loss_pct),
                ("bandwidth_mbps", bandwidth),
            ] {
                if !value.is_finite() || value < 0.0 {
                    return Err(invalid(format!(
                        "link {}-{}: {name} must be non-negative",
                        desc.a, desc.b
                    )));
                }
            }
            if loss_pct > 100.0 {
                return Err(invalid(format!("link {}-{}: loss_pct above 100", desc.a, desc.b)));
            }
            let id = link_key(&desc.a, &desc.b);
            if topo.links.contains_key(&id) {
                return Err(invalid(format!("duplicate link {id}")));
            }
            let (a, b) = if desc.a <= desc.b {
                (desc.a.clone(), desc.b.clone())
            } else {
                (desc.b.clone(), desc.a.clone())
            };
            topo.links.insert(
                id.clone(),
                Link {
                    id,
                    a,
                    b,
                    scope,
                    latency_ms,
                    jitter_ms,
                    loss_pct,
                    bandwidth_mbps: bandwidth.round() as u64,
                    bandwidth_limit_mbps: None,
                    allocated_mbps: 0,
                    status: desc.status,
                },
            );
        }

        let node_ids: BTreeSet<&str> = topo.nodes.keys().map(String::as_str).collect();
        if let Some(clash) = topo.federations.keys().find(|f| node_ids.contains(f.as_str())) {
            return Err(invalid(format!("{clash} is both a node and a federation")));
        }

        Ok(topo)
    }
}

fn invalid(msg: impl Into<String>) -> StateError {
    StateError::InvalidDescriptor(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::NetworkDefaults;

    fn sample() -> FabricDescriptor {
        FabricDescriptor {
            nodes: vec![
                NodeDescriptor::new("n1", "east", 4.0, 8.0),
                NodeDescriptor::new("n2", "west", 2.0, 4.0),
            ],
            links: vec![LinkDescriptor::new("n2", "n1", 3.0, 500.0)],
        }
    }

    #[test]
    fn build_groups_nodes_into_federations() {
        let topo = sample().build(&NetworkDefaults::default()).unwrap();
        assert_eq!(topo.nodes["n1"].capacity, Resources::new(4000, 8192, 0));
        assert_eq!(topo.federations["east"].nodes, vec!["n1".to_string()]);
        let link = &topo.links["n1|n2"];
        assert_eq!(link.scope, LinkScope::Node);
        assert_eq!(link.bandwidth_mbps, 500);
        assert_eq!(link.jitter_ms, 0.5);
    }

    #[test]
    fn federation_derived_from_labels() {
        let mut node = NodeDescriptor::new("n1", "", 1.0, 1.0);
        assert_eq!(node.federation_name(), DEFAULT_FEDERATION);
        node.labels.insert("region".into(), "eu".into());
        assert_eq!(node.federation_name(), "eu");
        node.labels.insert("zone".into(), "eu-1a".into());
        assert_eq!(node.federation_name(), "eu-1a");
    }

    #[test]
    fn federation_links_are_recognized() {
        let mut desc = sample();
        desc.links.push(LinkDescriptor::new("east", "west", 40.0, 100.0));
        let topo = desc.build(&NetworkDefaults::default()).unwrap();
        assert_eq!(topo.links["east|west"].scope, LinkScope::Federation);
    }

    #[test]
    fn rejects_duplicates_and_bad_links() {
        let mut desc = sample();
        desc.nodes.push(NodeDescriptor::new("n1", "east", 1.0, 1.0));
        assert!(matches!(
            desc.build(&NetworkDefaults::default()),
            Err(StateError::InvalidDescriptor(_))
        ));

        let mut desc = sample();
        desc.links.push(LinkDescriptor::new("n1", "ghost", 1.0, 1.0));
        assert!(desc.build(&NetworkDefaults::default()).is_err());

        let mut desc = sample();
        desc.links[0].loss_pct = Some(-1.0);
        assert!(desc.build(&NetworkDefaults::default()).is_err());
    }

    #[test]
    fn loads_toml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("fabric.toml");
        std::fs::write(
            &toml_path,
            r#"
[[nodes]]
id = "a"
federation = "f"
resources = { cpu_cores = 2.0, mem_gb = 1.0 }

[[nodes]]
name = "b"
labels = { zone = "z" }
resources = { cpu_cores = 1.0 }
profile = { formats_supported = ["native", "cuda"], gpu_accel_score = 20.0 }
"#,
        )
        .unwrap();
        let desc = FabricDescriptor::from_file(&toml_path).unwrap();
        assert_eq!(desc.nodes.len(), 2);
        assert_eq!(desc.nodes[1].federation_name(), "z");
        assert!(desc.nodes[0].profile.formats_supported.is_empty());
        let topo = desc.build(&NetworkDefaults::default()).unwrap();
        assert!(topo.nodes["b"].supports_format("cuda"));
        assert!(!topo.nodes["b"].supports_format("wasm"));

        let json_path = dir.path().join("fabric.json");
        std::fs::write(&json_path, serde_json::to_string(&sample()).unwrap()).unwrap();
        assert_eq!(FabricDescriptor::from_file(&json_path).unwrap(), sample());
    }
}
