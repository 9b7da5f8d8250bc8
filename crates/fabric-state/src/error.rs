//! Error types for the fabric state store.

use std::fmt;

use fabric_core::{FederationId, LinkId, NodeId, Resources};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// A node, link, or federation referenced by an error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EntityRef {
    Node(NodeId),
    Link(LinkId),
    /// Cut off by an isolation or partition.
    Federation(FederationId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Node(id) => write!(f, "node {id}"),
            EntityRef::Link(id) => write!(f, "link {id}"),
            EntityRef::Federation(id) => write!(f, "federation {id}"),
        }
    }
}

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("insufficient capacity on node {node}: requested {requested}, available {available}")]
    InsufficientNodeCapacity {
        node: NodeId,
        requested: Resources,
        available: Resources,
    },

    #[error(
        "insufficient bandwidth on link {link}: requested {requested_mbps} Mbps, available {available_mbps} Mbps"
    )]
    InsufficientLinkBandwidth {
        link: LinkId,
        requested_mbps: u64,
        available_mbps: u64,
    },

    #[error("{0} is down")]
    Unavailable(EntityRef),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid override {event_id}: {reason}")]
    InvalidOverride { event_id: String, reason: String },

    #[error("invalid fabric descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid reservation request: {0}")]
    InvalidRequest(String),

    #[error("state store is shut down")]
    Closed,

    #[error("state store lock poisoned")]
    LockPoisoned,

    #[error("failed to open archive: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

impl StateError {
    /// Capacity-class failures are local to one candidate and never a
    /// request-level failure on their own.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            StateError::InsufficientNodeCapacity { .. }
                | StateError::InsufficientLinkBandwidth { .. }
                | StateError::Unavailable(_)
        )
    }

    /// The node or link a capacity-class failure refers to.
    pub fn entity(&self) -> Option<EntityRef> {
        match self {
            StateError::InsufficientNodeCapacity { node, .. } => Some(EntityRef::Node(node.clone())),
            StateError::InsufficientLinkBandwidth { link, .. } => Some(EntityRef::Link(link.clone())),
            StateError::Unavailable(entity) => Some(entity.clone()),
            _ => None,
        }
    }
}
