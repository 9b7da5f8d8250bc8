//! SnapshotArchive — explicit, on-request persistence backed by redb.
//!
//! Holds two things: snapshots keyed by version, and opaque policy-state
//! blobs keyed by strategy name. The live store never writes here on its
//! own; callers checkpoint when they choose to.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::snapshot::Snapshot;
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

#[derive(Clone)]
pub struct SnapshotArchive {
    db: Arc<Database>,
}

impl SnapshotArchive {
    /// Open (or create) an archive file.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let archive = Self { db: Arc::new(db) };
        archive.ensure_tables()?;
        debug!(?path, "snapshot archive opened");
        Ok(archive)
    }

    /// Ephemeral in-memory archive (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let archive = Self { db: Arc::new(db) };
        archive.ensure_tables()?;
        debug!("in-memory snapshot archive opened");
        Ok(archive)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        txn.open_table(POLICY_STATE).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Snapshots ──────────────────────────────────────────────────

    /// Store a snapshot under its version, replacing any earlier copy.
    pub fn put_snapshot(&self, snapshot: &Snapshot) -> StateResult<()> {
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
            table
                .insert(snapshot.version, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(version = snapshot.version, "snapshot archived");
        Ok(())
    }

    pub fn get_snapshot(&self, version: u64) -> StateResult<Option<Snapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        match table.get(version).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: Snapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// Highest-versioned archived snapshot.
    pub fn latest_snapshot(&self) -> StateResult<Option<Snapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        match table.last().map_err(map_err!(Read))? {
            Some((_, value)) => {
                let snapshot: Snapshot =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    pub fn snapshot_versions(&self) -> StateResult<Vec<u64>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SNAPSHOTS).map_err(map_err!(Table))?;
        let mut versions = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            versions.push(key.value());
        }
        Ok(versions)
    }

    // ── Policy state ───────────────────────────────────────────────

    /// Save an opaque policy blob. The archive never interprets it.
    pub fn put_policy_state(&self, strategy: &str, blob: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POLICY_STATE).map_err(map_err!(Table))?;
            table.insert(strategy, blob).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%strategy, bytes = blob.len(), "policy state saved");
        Ok(())
    }

    pub fn get_policy_state(&self, strategy: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POLICY_STATE).map_err(map_err!(Table))?;
        Ok(table
            .get(strategy)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{FabricDescriptor, NodeDescriptor};
    use crate::store::{FabricStore, StoreOptions};
    use crate::types::ReserveRequest;
    use fabric_core::Resources;

    fn test_store() -> FabricStore {
        let desc = FabricDescriptor {
            nodes: vec![NodeDescriptor::new("n1", "east", 4.0, 8.0)],
            links: vec![],
        };
        FabricStore::init(&desc, StoreOptions::default()).unwrap()
    }

    #[test]
    fn snapshot_put_and_get() {
        let archive = SnapshotArchive::open_in_memory().unwrap();
        let store = test_store();
        let snap = store.snapshot();
        archive.put_snapshot(&snap).unwrap();
        let loaded = archive.get_snapshot(snap.version).unwrap().unwrap();
        assert_eq!(loaded, *snap);
        assert!(archive.get_snapshot(99).unwrap().is_none());
    }

    #[test]
    fn latest_returns_highest_version() {
        let archive = SnapshotArchive::open_in_memory().unwrap();
        assert!(archive.latest_snapshot().unwrap().is_none());

        let store = test_store();
        let first = store.snapshot();
        store
            .try_reserve(&ReserveRequest::new("j").node("n1", Resources::new(1000, 0, 0)))
            .unwrap();
        let second = store.snapshot();
        archive.put_snapshot(&second).unwrap();
        archive.put_snapshot(&first).unwrap();

        assert_eq!(archive.latest_snapshot().unwrap().unwrap().version, 2);
        assert_eq!(archive.snapshot_versions().unwrap(), vec![1, 2]);
    }

    #[test]
    fn policy_state_is_opaque() {
        let archive = SnapshotArchive::open_in_memory().unwrap();
        assert!(archive.get_policy_state("adaptive").unwrap().is_none());
        archive.put_policy_state("adaptive", b"\x00\x01blob").unwrap();
        assert_eq!(
            archive.get_policy_state("adaptive").unwrap().unwrap(),
            b"\x00\x01blob".to_vec()
        );
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.redb");
        {
            let archive = SnapshotArchive::open(&path).unwrap();
            archive.put_snapshot(&test_store().snapshot()).unwrap();
            archive.put_policy_state("adaptive", b"{}").unwrap();
        }
        let archive = SnapshotArchive::open(&path).unwrap();
        assert!(archive.get_snapshot(1).unwrap().is_some());
        assert_eq!(archive.get_policy_state("adaptive").unwrap().unwrap(), b"{}".to_vec());
    }
}
