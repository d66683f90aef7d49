//! # extentfs-raft-storage
//!
//! why: provide durable persistence for raft state using plain files
//! relations: implements the RaftStorage trait from extentfs-raft
//! what: FileStorage (metadata.log + log.log), MemStorage for testing
//!
//! file formats:
//! - `metadata.log`: one text line `"<term> <voted_for>"`, -1 for no vote,
//!   rewritten atomically on every change
//! - `log.log`: append-only little-endian records of
//!   `(term: i32, index: i32, cmd_len: i32, cmd_bytes)`; on restore, gaps in
//!   the index sequence are padded with sentinel entries and a later record
//!   for an index wins over an earlier one

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use extentfs_raft::{LogEntry, NodeId, RaftStorage};

const METADATA_FILE: &str = "metadata.log";
const LOG_FILE: &str = "log.log";

/// fold a stream of persisted records into the in-memory log vector,
/// sentinel at index 0, gaps padded, last record for an index winning
fn fold_records(records: impl IntoIterator<Item = LogEntry>) -> Vec<LogEntry> {
    let mut log = vec![LogEntry::sentinel()];
    for entry in records {
        let idx = entry.index as usize;
        while log.len() <= idx {
            let pad = log.len() as u64;
            let mut sentinel = LogEntry::sentinel();
            sentinel.index = pad;
            log.push(sentinel);
        }
        log[idx] = entry;
    }
    log
}

// -- file storage implementation --

/// file-based raft storage rooted at a directory
///
/// the metadata write is atomic (temp file + rename); log writes are straight
/// appends synced before returning, so an acknowledged entry survives a crash
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// create a storage at the given directory, creating it if needed
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn write_entry(out: &mut impl Write, entry: &LogEntry) -> io::Result<()> {
        out.write_i32::<LittleEndian>(entry.term as i32)?;
        out.write_i32::<LittleEndian>(entry.index as i32)?;
        out.write_i32::<LittleEndian>(entry.command.len() as i32)?;
        out.write_all(&entry.command)?;
        Ok(())
    }

    fn read_records(&self) -> io::Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let mut reader = BufReader::new(File::open(&path)?);
        loop {
            let term = match reader.read_i32::<LittleEndian>() {
                Ok(t) => t,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let index = reader.read_i32::<LittleEndian>()?;
            let len = reader.read_i32::<LittleEndian>()?;
            if len < 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("negative command length {len} in log"),
                ));
            }
            let mut command = vec![0u8; len as usize];
            reader.read_exact(&mut command)?;
            records.push(LogEntry::new(term as u64, index as u64, command));
        }
        Ok(records)
    }

    /// rewrite the whole log file from the given records, atomically
    fn rewrite_log(&self, records: &[LogEntry]) -> io::Result<()> {
        let temp_path = self.dir.join("log.tmp");
        let mut file = File::create(&temp_path)?;
        for entry in records {
            Self::write_entry(&mut file, entry)?;
        }
        file.sync_all()?;
        fs::rename(&temp_path, self.log_path())?;
        Ok(())
    }
}

impl RaftStorage for FileStorage {
    fn save_metadata(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        let voted = voted_for.map(|v| v as i64).unwrap_or(-1);
        let line = format!("{term} {voted}\n");

        // atomic write: temp file then rename
        let temp_path = self.dir.join("metadata.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, self.metadata_path())?;
        Ok(())
    }

    fn load_metadata(&self) -> io::Result<(u64, Option<NodeId>)> {
        let path = self.metadata_path();
        if !path.exists() {
            return Ok((0, None)); // default for new nodes
        }
        let contents = fs::read_to_string(&path)?;
        let mut parts = contents.split_whitespace();
        let term: u64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad term in metadata"))?;
        let voted: i64 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad vote in metadata"))?;
        let voted_for = if voted < 0 { None } else { Some(voted as NodeId) };
        Ok((term, voted_for))
    }

    fn append_entry(&mut self, entry: &LogEntry) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        Self::write_entry(&mut file, entry)?;
        file.sync_all()?;
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        let mut records = self.read_records()?;
        records.retain(|e| e.index < index);
        self.rewrite_log(&records)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(fold_records(self.read_records()?))
    }
}

// -- in-memory storage implementation --

/// in-memory raft storage for tests
///
/// keeps the same record-stream semantics as FileStorage, without a disk
#[derive(Default)]
pub struct MemStorage {
    term: u64,
    voted_for: Option<NodeId>,
    records: Vec<LogEntry>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftStorage for MemStorage {
    fn save_metadata(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_metadata(&self) -> io::Result<(u64, Option<NodeId>)> {
        Ok((self.term, self.voted_for))
    }

    fn append_entry(&mut self, entry: &LogEntry) -> io::Result<()> {
        self.records.push(entry.clone());
        Ok(())
    }

    fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        self.records.retain(|e| e.index < index);
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(fold_records(self.records.iter().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mem_storage_persists_metadata() {
        let mut storage = MemStorage::new();
        storage.save_metadata(5, Some(2)).unwrap();
        assert_eq!(storage.load_metadata().unwrap(), (5, Some(2)));
    }

    #[test]
    fn file_storage_round_trips_metadata() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_metadata(7, Some(3)).unwrap();
        assert_eq!(storage.load_metadata().unwrap(), (7, Some(3)));

        storage.save_metadata(8, None).unwrap();
        assert_eq!(storage.load_metadata().unwrap(), (8, None));
    }

    #[test]
    fn load_log_always_has_sentinel() {
        let storage = MemStorage::new();
        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 1);
        assert!(log[0].is_sentinel());
    }

    #[test]
    fn later_record_for_same_index_wins() {
        let mut storage = MemStorage::new();
        storage.append_entry(&LogEntry::new(1, 1, b"old".to_vec())).unwrap();
        storage.append_entry(&LogEntry::new(2, 1, b"new".to_vec())).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log[1].term, 2);
        assert_eq!(log[1].command, b"new".to_vec());
    }
}
