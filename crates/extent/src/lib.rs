//! # extentfs-extent
//!
//! why: store the extents themselves and replicate mutations through raft
//! relations: plugs into extentfs-raft as its state machine; reused by
//!            extentfs-wal for the single-node transactional variant
//! what: ExtentStore, binary command codec, state machine, replicated server

pub mod command;
pub mod error;
pub mod server;
pub mod state_machine;
pub mod store;

pub use command::Command;
pub use error::ExtentError;
pub use server::ReplicatedExtentServer;
pub use state_machine::{ApplyResult, ExtentStateMachine};
pub use store::{Attr, ExtentId, ExtentStore, ROOT_ID, TYPE_DIR, TYPE_FILE};
