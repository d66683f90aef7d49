//! # server
//!
//! why: expose the extent protocol on top of the replicated log
//! relations: submits commands through extentfs-raft's RaftServer, blocks on
//!            the result futures fulfilled by state_machine.rs
//! what: ReplicatedExtentServer with create/put/get/getattr/remove

use std::sync::Arc;
use std::time::Duration;

use extentfs_raft::RaftServer;

use crate::command::Command;
use crate::error::ExtentError;
use crate::state_machine::{ApplyResult, ExtentStateMachine};
use crate::store::{Attr, ExtentId};

const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// The extent protocol served by one raft cluster member.
///
/// Every operation - reads included - rides the replicated log so all
/// replicas observe the same sequence. A call on a non-leader fails fast with
/// [`ExtentError::NotLeader`]; the caller retries against another node.
pub struct ReplicatedExtentServer {
    raft: Arc<RaftServer<ExtentStateMachine>>,
    state_machine: Arc<ExtentStateMachine>,
    apply_timeout: Duration,
}

impl ReplicatedExtentServer {
    pub fn new(
        raft: Arc<RaftServer<ExtentStateMachine>>,
        state_machine: Arc<ExtentStateMachine>,
    ) -> Self {
        Self { raft, state_machine, apply_timeout: DEFAULT_APPLY_TIMEOUT }
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn create(&self, file_type: u32) -> Result<ExtentId, ExtentError> {
        Ok(self.submit(Command::Create { file_type })?.id)
    }

    pub fn put(&self, id: ExtentId, data: Vec<u8>) -> Result<(), ExtentError> {
        self.submit(Command::Put { id, data })?;
        Ok(())
    }

    pub fn get(&self, id: ExtentId) -> Result<Vec<u8>, ExtentError> {
        Ok(self.submit(Command::Get { id })?.buf)
    }

    pub fn getattr(&self, id: ExtentId) -> Result<Attr, ExtentError> {
        Ok(self.submit(Command::GetAttr { id })?.attr)
    }

    pub fn remove(&self, id: ExtentId) -> Result<(), ExtentError> {
        self.submit(Command::Remove { id })?;
        Ok(())
    }

    /// Append the command to the leader's log, then block until the apply
    /// loop has run it and read out its result.
    fn submit(&self, cmd: Command) -> Result<ApplyResult, ExtentError> {
        let encoded = cmd.encode();
        self.state_machine
            .submit_and_wait(self.apply_timeout, || self.raft.new_command(encoded))
    }
}
