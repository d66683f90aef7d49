//! # server
//!
//! why: give single-node extent operations all-or-nothing crash recovery
//! relations: wraps extentfs-extent's ExtentStore, logs through persister.rs
//! what: TransactionalExtentServer with begin/commit and auto-bracketed ops
//!
//! Every mutation is logged inside a BEGIN/COMMIT pair. Callers may bracket
//! several mutations with explicit `begin`/`commit`; a mutation issued with
//! no open transaction gets wrapped in one of its own. Each COMMIT folds the
//! log into the checkpoint, so replay cost stays bounded by the open tail.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::info;

use extentfs_extent::{Attr, ExtentError, ExtentId, ExtentStore, ROOT_ID};

use crate::error::WalError;
use crate::persister::Persister;
use crate::record::{TxId, WalRecord};

/// A single-node extent server whose mutations survive crashes.
///
/// Recovery order on open: rebuild the store from the checkpoint image, then
/// redo the surviving log records (all from completed transactions; the
/// persister drops unfinished ones). Reads never touch the log.
pub struct TransactionalExtentServer {
    store: Mutex<ExtentStore>,
    persister: Persister,
    next_txid: AtomicU64,
    open_txn: Mutex<Option<TxId>>,
}

impl TransactionalExtentServer {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, WalError> {
        let persister = Persister::open(dir)?;
        let mut store = ExtentStore::new();

        let (creates, puts) = persister.checkpoint_image();
        for (inum, file_type) in creates {
            store.create_at(inum, file_type);
        }
        for (inum, data) in puts {
            store.put(inum, data)?;
        }

        let log = persister.log_records();
        if !log.is_empty() {
            info!(records = log.len(), "redoing completed transactions");
        }
        for record in log {
            match record {
                WalRecord::Begin { .. } | WalRecord::Commit { .. } => {}
                WalRecord::Create { file_type, inum, .. } => store.create_at(inum, file_type),
                WalRecord::Put { inum, data, .. } => store.put(inum, data)?,
                WalRecord::Remove { inum, .. } => store.remove(inum)?,
            }
        }

        let next_txid = AtomicU64::new(persister.max_txid() + 1);
        Ok(Self {
            store: Mutex::new(store),
            persister,
            next_txid,
            open_txn: Mutex::new(None),
        })
    }

    /// Start an explicit transaction. Mutations issued until the matching
    /// `commit` all land in it.
    pub fn begin(&self) -> Result<TxId, WalError> {
        let mut open = self.open_txn.lock();
        if open.is_some() {
            return Err(WalError::NestedTransaction);
        }
        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        self.persister.append(WalRecord::Begin { txid })?;
        *open = Some(txid);
        Ok(txid)
    }

    /// Commit the open transaction and fold the log into the checkpoint.
    pub fn commit(&self) -> Result<(), WalError> {
        let mut open = self.open_txn.lock();
        let txid = open.take().ok_or(WalError::NoTransaction)?;
        self.persister.append(WalRecord::Commit { txid })?;
        self.persister.checkpoint()?;
        Ok(())
    }

    // Mutations validate, log, then touch the store, in that order: a failed
    // append must not leave the live store ahead of the durable log. with_txn
    // serializes mutations, so a validated id cannot change underneath the
    // append.

    pub fn create(&self, file_type: u32) -> Result<ExtentId, WalError> {
        self.with_txn(|txid| {
            let id = self.store.lock().next_id();
            self.persister
                .append(WalRecord::Create { txid, file_type, inum: id })?;
            self.store.lock().create_at(id, file_type);
            Ok(id)
        })
    }

    pub fn put(&self, id: ExtentId, data: Vec<u8>) -> Result<(), WalError> {
        self.with_txn(|txid| {
            if !self.store.lock().contains(id) {
                return Err(ExtentError::NotFound(id).into());
            }
            self.persister
                .append(WalRecord::Put { txid, inum: id, data: data.clone() })?;
            self.store.lock().put(id, data)?;
            Ok(())
        })
    }

    pub fn remove(&self, id: ExtentId) -> Result<(), WalError> {
        self.with_txn(|txid| {
            if id == ROOT_ID {
                return Err(ExtentError::Permanent(id).into());
            }
            if !self.store.lock().contains(id) {
                return Err(ExtentError::NotFound(id).into());
            }
            self.persister.append(WalRecord::Remove { txid, inum: id })?;
            self.store.lock().remove(id)?;
            Ok(())
        })
    }

    pub fn get(&self, id: ExtentId) -> Result<Vec<u8>, WalError> {
        Ok(self.store.lock().get(id)?)
    }

    pub fn getattr(&self, id: ExtentId) -> Result<Attr, WalError> {
        Ok(self.store.lock().getattr(id)?)
    }

    /// Run `op` inside the open transaction if there is one, otherwise inside
    /// a fresh single-op transaction that commits (and checkpoints) on the
    /// way out. The open-transaction lock is held across the whole operation
    /// so concurrent callers cannot interleave records.
    fn with_txn<T>(&self, op: impl FnOnce(TxId) -> Result<T, WalError>) -> Result<T, WalError> {
        let open = self.open_txn.lock();
        if let Some(txid) = *open {
            return op(txid);
        }
        let txid = self.next_txid.fetch_add(1, Ordering::SeqCst);
        self.persister.append(WalRecord::Begin { txid })?;
        let out = op(txid)?;
        self.persister.append(WalRecord::Commit { txid })?;
        self.persister.checkpoint()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extentfs_extent::{ExtentError, TYPE_FILE};
    use tempfile::tempdir;

    #[test]
    fn auto_bracketed_put_survives_reopen() {
        let dir = tempdir().unwrap();
        let id;
        {
            let server = TransactionalExtentServer::open(dir.path()).unwrap();
            id = server.create(TYPE_FILE).unwrap();
            server.put(id, b"persisted".to_vec()).unwrap();
        }
        let server = TransactionalExtentServer::open(dir.path()).unwrap();
        assert_eq!(server.get(id).unwrap(), b"persisted".to_vec());
    }

    #[test]
    fn nested_begin_is_rejected() {
        let dir = tempdir().unwrap();
        let server = TransactionalExtentServer::open(dir.path()).unwrap();
        server.begin().unwrap();
        assert!(matches!(server.begin(), Err(WalError::NestedTransaction)));
    }

    #[test]
    fn commit_without_begin_is_rejected() {
        let dir = tempdir().unwrap();
        let server = TransactionalExtentServer::open(dir.path()).unwrap();
        assert!(matches!(server.commit(), Err(WalError::NoTransaction)));
    }

    #[test]
    fn failed_mutation_surfaces_the_store_error() {
        let dir = tempdir().unwrap();
        let server = TransactionalExtentServer::open(dir.path()).unwrap();
        let err = server.put(99, b"nobody home".to_vec()).unwrap_err();
        assert!(matches!(err, WalError::Extent(ExtentError::NotFound(99))));
    }

    #[test]
    fn failed_mutations_leave_no_trace_after_reopen() {
        let dir = tempdir().unwrap();
        let id;
        {
            let server = TransactionalExtentServer::open(dir.path()).unwrap();
            id = server.create(TYPE_FILE).unwrap();
            assert!(matches!(
                server.put(9, b"nobody home".to_vec()),
                Err(WalError::Extent(ExtentError::NotFound(9)))
            ));
            assert!(matches!(
                server.remove(9),
                Err(WalError::Extent(ExtentError::NotFound(9)))
            ));
            assert!(matches!(
                server.remove(ROOT_ID),
                Err(WalError::Extent(ExtentError::Permanent(ROOT_ID)))
            ));
            server.put(id, b"kept".to_vec()).unwrap();
        }
        // the rejected operations logged nothing, so recovery replays cleanly
        let server = TransactionalExtentServer::open(dir.path()).unwrap();
        assert_eq!(server.get(id).unwrap(), b"kept".to_vec());
        assert!(matches!(
            server.get(9),
            Err(WalError::Extent(ExtentError::NotFound(9)))
        ));
        assert!(server.getattr(ROOT_ID).is_ok());
    }

    #[test]
    fn rejected_op_does_not_poison_an_open_transaction() {
        let dir = tempdir().unwrap();
        let id;
        {
            let server = TransactionalExtentServer::open(dir.path()).unwrap();
            server.begin().unwrap();
            assert!(server.put(42, b"missing".to_vec()).is_err());
            id = server.create(TYPE_FILE).unwrap();
            server.put(id, b"after the failure".to_vec()).unwrap();
            server.commit().unwrap();
        }
        let server = TransactionalExtentServer::open(dir.path()).unwrap();
        assert_eq!(server.get(id).unwrap(), b"after the failure".to_vec());
    }

    #[test]
    fn each_transaction_gets_a_fresh_txid() {
        let dir = tempdir().unwrap();
        let server = TransactionalExtentServer::open(dir.path()).unwrap();
        let first = server.begin().unwrap();
        server.create(TYPE_FILE).unwrap();
        server.commit().unwrap();
        let second = server.begin().unwrap();
        assert!(second > first);
    }
}
