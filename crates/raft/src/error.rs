//! # error
//!
//! why: give every consensus failure mode a typed, non-fatal representation
//! relations: NotLeader/Io from server.rs, Unreachable from transport.rs;
//!            StaleTerm/LogMismatch name the in-band protocol rejections
//! what: RaftError enum

use thiserror::Error;

use crate::node::NodeId;

/// Errors surfaced by the consensus layer.
///
/// None of these are fatal to the node: a rejected command is retried by the
/// caller against the real leader, and a dropped rpc is retried by the next
/// heartbeat or replication tick.
#[derive(Debug, Error)]
pub enum RaftError {
    /// Command rejected, this node is not the leader. The caller should
    /// rediscover the leader and retry there.
    #[error("not the leader")]
    NotLeader,

    /// An rpc carried a lower term than the receiver's. Between peers this
    /// travels in-band as a refused reply (`vote_granted`/`success` false);
    /// the variant exists for transports and callers that surface the
    /// rejection as an error.
    #[error("stale term {seen} (current term is {current})")]
    StaleTerm { seen: u64, current: u64 },

    /// The receiver's log had no matching entry at prev_log_index. Travels
    /// in-band as a refused append-entries reply, like [`RaftError::StaleTerm`].
    #[error("log mismatch at index {index}")]
    LogMismatch { index: u64 },

    /// Peer could not be reached. Dropped silently by the background loops.
    #[error("peer {0} unreachable")]
    Unreachable(NodeId),

    /// Durable storage failed underneath the node.
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_renders_its_context() {
        let cases = [
            (RaftError::NotLeader, "not the leader"),
            (
                RaftError::StaleTerm { seen: 3, current: 5 },
                "stale term 3 (current term is 5)",
            ),
            (RaftError::LogMismatch { index: 9 }, "log mismatch at index 9"),
            (RaftError::Unreachable(2), "peer 2 unreachable"),
        ];
        for (err, rendered) in cases {
            assert_eq!(err.to_string(), rendered);
        }
    }
}
