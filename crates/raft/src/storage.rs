//! # storage
//!
//! why: declare what the consensus core needs from durable storage
//! relations: implemented by extentfs-raft-storage, consumed by server.rs
//! what: RaftStorage trait

use std::io;

use crate::log::LogEntry;
use crate::node::NodeId;

/// Durable persistence of consensus state.
///
/// The runtime calls `save_metadata` before any vote grant or term bump is
/// acted on, and `append_entry` before any new entry is acknowledged - to the
/// client on the leader, or to the leader on a follower. Both are synchronous;
/// a write that has not returned Ok has not happened.
pub trait RaftStorage: Send {
    /// Overwrite the persisted `(current_term, voted_for)` pair.
    fn save_metadata(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()>;

    /// Load the persisted term and vote. Defaults to `(0, None)` for a node
    /// that has never run.
    fn load_metadata(&self) -> io::Result<(u64, Option<NodeId>)>;

    /// Append one entry to the durable log.
    fn append_entry(&mut self, entry: &LogEntry) -> io::Result<()>;

    /// Remove every entry with index >= `index`, durably, so a replay cannot
    /// resurrect a conflicting suffix.
    fn truncate_from(&mut self, index: u64) -> io::Result<()>;

    /// Rebuild the full log for startup, including the index-0 sentinel.
    /// Gaps in the persisted indices are padded with sentinel entries.
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;
}
