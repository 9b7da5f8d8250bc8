//! fabric-state — live topology and capacity store for the fabric twin.
//!
//! # Architecture
//!
//! [`FabricStore`] owns the mutable fabric: nodes, links, federations, and
//! active reservations. Every mutation (override application, reserve,
//! release) runs inside one exclusive critical section, re-checks the
//! capacity invariant for the entities it touched, and then publishes a new
//! immutable [`Snapshot`] with a version one higher than the last.
//!
//! Readers clone an `Arc<Snapshot>` and never hold the store lock while
//! planning. Override events carry `(timestamp, seq, id)` stamps and are
//! merged per field with last-writer-wins, which makes replaying an override
//! log harmless.
//!
//! [`SnapshotArchive`] is a separate redb-backed archive for explicit
//! snapshot checkpoints and opaque policy-state blobs.

pub mod archive;
pub mod descriptor;
pub mod error;
pub mod overrides;
pub mod snapshot;
pub mod store;
pub mod tables;
pub mod types;

pub use archive::SnapshotArchive;
pub use descriptor::{FabricDescriptor, LinkDescriptor, NodeDescriptor};
pub use error::{EntityRef, StateError, StateResult};
pub use overrides::{OverrideAction, OverrideEvent, OverrideOutcome, OverrideReport};
pub use snapshot::{CrossLinkStats, FederationOverview, FederationStats, LinkPath, Snapshot};
pub use store::{AuditReport, FabricStore, StoreOptions};
pub use types::*;
