//! # persister
//!
//! why: keep the operation log and its folded checkpoint durable across crashes
//! relations: server.rs appends records through here and folds on every commit;
//!            record.rs defines the on-disk form
//! what: Persister over logdata.bin + checkpoint.bin, fold/truncate logic
//!
//! `logdata.bin` is an append-only stream of records. `checkpoint.bin` is the
//! folded per-inode latest state, rewritten in full on every fold and ordered
//! by inode number with CREATE before PUT. Both rewrites go through a temp
//! file and an atomic rename.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

use extentfs_extent::{ExtentId, ROOT_ID};

use crate::error::WalError;
use crate::record::{TxId, WalRecord};

const LOG_FILE: &str = "logdata.bin";
const CHECKPOINT_FILE: &str = "checkpoint.bin";

struct Inner {
    /// Records not yet folded into the checkpoint, in log order.
    records: Vec<WalRecord>,
    /// Folded CREATE slot per inode: the file type it was created with.
    checkpoint_create: BTreeMap<ExtentId, u32>,
    /// Folded PUT slot per inode: the latest contents.
    checkpoint_put: BTreeMap<ExtentId, Vec<u8>>,
}

/// Durable write-ahead log plus checkpoint for the transactional server.
///
/// All mutation goes through the internal lock; the owning server serializes
/// transactions above this layer, so the lock only guards against readers
/// racing a fold.
pub struct Persister {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl Persister {
    /// Open the persister rooted at `dir`, loading the checkpoint and any
    /// surviving log records. Records belonging to transactions without a
    /// COMMIT are discarded here and the log file rewritten without them, so
    /// everything left is safe to redo.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, WalError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let (checkpoint_create, checkpoint_put) = load_checkpoint(&dir.join(CHECKPOINT_FILE))?;
        let mut records = load_log(&dir.join(LOG_FILE))?;

        let committed: HashSet<TxId> = records
            .iter()
            .filter_map(|r| match r {
                WalRecord::Commit { txid } => Some(*txid),
                _ => None,
            })
            .collect();
        let before = records.len();
        records.retain(|r| committed.contains(&r.txid()));
        if records.len() != before {
            warn!(
                dropped = before - records.len(),
                "discarding records from unfinished transactions"
            );
            rewrite_log(&dir.join(LOG_FILE), &records)?;
        }

        Ok(Self {
            dir,
            inner: Mutex::new(Inner { records, checkpoint_create, checkpoint_put }),
        })
    }

    /// Append one record to the log and sync it before returning.
    pub fn append(&self, record: WalRecord) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(LOG_FILE))?;
        record.write_to(&mut file)?;
        file.sync_all()?;
        inner.records.push(record);
        Ok(())
    }

    /// Fold every completed transaction into the checkpoint tables, rewrite
    /// `checkpoint.bin` in full, and truncate the log down to the records of
    /// still-open transactions.
    pub fn checkpoint(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();

        let committed: HashSet<TxId> = inner
            .records
            .iter()
            .filter_map(|r| match r {
                WalRecord::Commit { txid } => Some(*txid),
                _ => None,
            })
            .collect();

        let records = std::mem::take(&mut inner.records);
        let mut remaining = Vec::new();
        for record in records {
            if !committed.contains(&record.txid()) {
                remaining.push(record);
                continue;
            }
            match record {
                WalRecord::Begin { .. } | WalRecord::Commit { .. } => {}
                WalRecord::Create { file_type, inum, .. } => {
                    inner.checkpoint_create.insert(inum, file_type);
                }
                WalRecord::Put { inum, data, .. } => {
                    if inum != ROOT_ID && !inner.checkpoint_create.contains_key(&inum) {
                        return Err(WalError::MissingCreate { inum });
                    }
                    inner.checkpoint_put.insert(inum, data);
                }
                WalRecord::Remove { inum, .. } => {
                    inner.checkpoint_create.remove(&inum);
                    inner.checkpoint_put.remove(&inum);
                }
            }
        }

        write_checkpoint(
            &self.dir.join(CHECKPOINT_FILE),
            &inner.checkpoint_create,
            &inner.checkpoint_put,
        )?;
        rewrite_log(&self.dir.join(LOG_FILE), &remaining)?;
        inner.records = remaining;
        Ok(())
    }

    /// Folded per-inode state: (create slots, put slots).
    pub fn checkpoint_image(&self) -> (BTreeMap<ExtentId, u32>, BTreeMap<ExtentId, Vec<u8>>) {
        let inner = self.inner.lock();
        (inner.checkpoint_create.clone(), inner.checkpoint_put.clone())
    }

    /// Records still in the log, in append order.
    pub fn log_records(&self) -> Vec<WalRecord> {
        self.inner.lock().records.clone()
    }

    /// Highest transaction id appearing in the surviving log, 0 if none.
    pub fn max_txid(&self) -> TxId {
        self.inner
            .lock()
            .records
            .iter()
            .map(|r| r.txid())
            .max()
            .unwrap_or(0)
    }
}

fn load_log(path: &Path) -> Result<Vec<WalRecord>, WalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    loop {
        match WalRecord::read_from(&mut reader) {
            Ok(Some(record)) => records.push(record),
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                // torn final write; everything before it is intact
                warn!(loaded = records.len(), "log ends mid-record, dropping the torn tail");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(records)
}

fn load_checkpoint(
    path: &Path,
) -> Result<(BTreeMap<ExtentId, u32>, BTreeMap<ExtentId, Vec<u8>>), WalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok((BTreeMap::new(), BTreeMap::new()))
        }
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut creates = BTreeMap::new();
    let mut puts = BTreeMap::new();
    // the checkpoint is rewritten atomically, so unlike the log a short read
    // here is corruption rather than a torn tail
    while let Some(record) = WalRecord::read_from(&mut reader)? {
        match record {
            WalRecord::Create { file_type, inum, .. } => {
                creates.insert(inum, file_type);
            }
            WalRecord::Put { inum, data, .. } => {
                puts.insert(inum, data);
            }
            other => {
                return Err(WalError::Corrupt(format!(
                    "unexpected record in checkpoint: {other:?}"
                )))
            }
        }
    }
    Ok((creates, puts))
}

fn write_checkpoint(
    path: &Path,
    creates: &BTreeMap<ExtentId, u32>,
    puts: &BTreeMap<ExtentId, Vec<u8>>,
) -> Result<(), WalError> {
    let mut ids: BTreeSet<ExtentId> = creates.keys().copied().collect();
    ids.extend(puts.keys().copied());

    let mut buf = Vec::new();
    for id in ids {
        if let Some(file_type) = creates.get(&id) {
            WalRecord::Create { txid: 0, file_type: *file_type, inum: id }.write_to(&mut buf)?;
        }
        if let Some(data) = puts.get(&id) {
            WalRecord::Put { txid: 0, inum: id, data: data.clone() }.write_to(&mut buf)?;
        }
    }
    atomic_write(path, &buf)?;
    Ok(())
}

fn rewrite_log(path: &Path, records: &[WalRecord]) -> Result<(), WalError> {
    let mut buf = Vec::new();
    for record in records {
        record.write_to(&mut buf)?;
    }
    atomic_write(path, &buf)?;
    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}
