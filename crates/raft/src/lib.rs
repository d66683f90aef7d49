//! # extentfs-raft
//!
//! why: implement the raft consensus core that replicates extent commands
//! relations: persisted via extentfs-raft-storage, applied via extentfs-extent
//! what: node state machine, rpc messages, threaded runtime, transport seam

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod pool;
pub mod server;
pub mod state_machine;
pub mod storage;
pub mod transport;

pub use config::RaftConfig;
pub use error::RaftError;
pub use log::LogEntry;
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
    InstallSnapshotResponse, VoteRequest, VoteResponse,
};
pub use node::{AppendEffects, NodeId, NodeState, RaftNode};
pub use pool::WorkerPool;
pub use server::{NodeStatus, RaftServer};
pub use state_machine::StateMachine;
pub use storage::RaftStorage;
pub use transport::{LocalNetwork, RaftService, Transport};
