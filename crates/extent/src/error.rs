//! # error
//!
//! why: typed failures for the extent layer, separate from consensus errors
//! relations: returned by store.rs, command.rs, server.rs
//! what: ExtentError enum

use thiserror::Error;

use crate::store::ExtentId;

#[derive(Debug, Error)]
pub enum ExtentError {
    /// No extent with this id exists (never created, or removed).
    #[error("no extent with id {0}")]
    NotFound(ExtentId),

    /// The root directory extent cannot be removed.
    #[error("extent {0} is permanent")]
    Permanent(ExtentId),

    /// Command rejected by consensus; retry against the current leader.
    #[error("not the leader")]
    NotLeader,

    /// The command was accepted but its application was not observed in time.
    /// The operation may still complete; the caller decides whether to retry.
    #[error("timed out waiting for command {index} to apply")]
    ApplyTimeout { index: u64 },

    /// A command payload could not be decoded.
    #[error("bad command encoding: {0}")]
    Codec(String),

    /// Consensus failed for a reason other than leadership.
    #[error(transparent)]
    Raft(#[from] extentfs_raft::RaftError),
}
