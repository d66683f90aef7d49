//! # state_machine
//!
//! why: decouple the consensus core from what committed commands mean
//! relations: implemented by extentfs-extent, called by the apply loop in server.rs
//! what: StateMachine trait

use crate::log::LogEntry;

/// The replicated state machine fed by the apply loop.
///
/// `apply` is called exactly once per committed index, in strictly increasing
/// index order, from a single thread. The sentinel entry at index 0 is never
/// passed in.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, entry: &LogEntry);
}
