//! redb table definitions for the snapshot archive.
//!
//! Values are JSON-serialized. Snapshots are keyed by version so the most
//! recent checkpoint is the last entry of the table.

use redb::TableDefinition;

/// Archived snapshots keyed by snapshot version.
pub const SNAPSHOTS: TableDefinition<u64, &[u8]> = TableDefinition::new("snapshots");

/// Opaque policy-state blobs keyed by strategy name.
pub const POLICY_STATE: TableDefinition<&str, &[u8]> = TableDefinition::new("policy_state");
