//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: used by node.rs for replication, persisted via extentfs-raft-storage
//! what: LogEntry struct, index-0 sentinel entry

use serde::{Deserialize, Serialize};

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed)
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Vec<u8>,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Vec<u8>) -> Self {
        Self { term, index, command }
    }

    /// The permanent entry at index 0. It carries term 0, an empty command,
    /// and is never applied to the state machine.
    pub fn sentinel() -> Self {
        Self::new(0, 0, Vec::new())
    }

    /// Whether this entry is the index-0 sentinel or a padding entry
    /// reconstructed for a gap in the persisted log.
    pub fn is_sentinel(&self) -> bool {
        self.term == 0 && self.command.is_empty()
    }
}
