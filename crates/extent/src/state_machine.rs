//! # state_machine
//!
//! why: turn committed raft entries into extent-store mutations and wake the
//!      caller that submitted each command
//! relations: implements StateMachine from extentfs-raft over store.rs;
//!            server.rs submits commands through submit_and_wait
//! what: ExtentStateMachine, per-index waiters fulfilled by the apply loop

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{trace, warn};

use extentfs_raft::{LogEntry, RaftError, StateMachine};

use crate::command::Command;
use crate::error::ExtentError;
use crate::store::{Attr, ExtentId, ExtentStore};

/// What applying one command produced. Fields are meaningful per command:
/// CREATE fills `id`, GET fills `buf`, GETATTR fills `attr`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyResult {
    pub id: ExtentId,
    pub buf: Vec<u8>,
    pub attr: Attr,
}

/// A caller blocked on the entry at some index. The term pins which entry:
/// if a different leader overwrites the index, the waiter must not receive
/// the replacement's result.
struct Waiter {
    term: u64,
    sender: Sender<ApplyResult>,
}

/// The replicated state machine over the extent store.
///
/// The apply loop is the single writer of the store; rpc-serving threads only
/// touch the waiter table. A waiter exists only for a command submitted on
/// this node: entries applied with nobody registered (every entry on a
/// follower, the whole log on restart) leave nothing behind.
pub struct ExtentStateMachine {
    store: Mutex<ExtentStore>,
    waiters: Mutex<HashMap<u64, Waiter>>,
}

impl Default for ExtentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentStateMachine {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(ExtentStore::new()),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Run a read against the underlying store without going through the log.
    /// Used by tests and local inspection only; replicated reads go through
    /// GET/GETATTR commands so every replica answers identically.
    pub fn with_store<T>(&self, f: impl FnOnce(&ExtentStore) -> T) -> T {
        f(&self.store.lock())
    }

    /// Run `submit` (typically `new_command` on the local raft node) and
    /// block until the apply loop has run the resulting entry.
    ///
    /// The waiter is registered under the same lock the apply loop takes to
    /// deliver results, so the apply of this index cannot slip in between
    /// submission and registration.
    pub fn submit_and_wait(
        &self,
        timeout: Duration,
        submit: impl FnOnce() -> Result<(u64, u64), RaftError>,
    ) -> Result<ApplyResult, ExtentError> {
        let (index, receiver) = {
            let mut waiters = self.waiters.lock();
            let (term, index) = submit().map_err(|e| match e {
                RaftError::NotLeader => ExtentError::NotLeader,
                other => ExtentError::Raft(other),
            })?;
            let (sender, receiver) = bounded(1);
            waiters.insert(index, Waiter { term, sender });
            (index, receiver)
        };
        receiver.recv_timeout(timeout).map_err(|_| {
            self.waiters.lock().remove(&index);
            ExtentError::ApplyTimeout { index }
        })
    }

    fn fulfill(&self, entry_term: u64, index: u64, result: ApplyResult) {
        if let Some(waiter) = self.waiters.lock().remove(&index) {
            if waiter.term == entry_term {
                // receiver may have timed out and gone away; that is fine
                let _ = waiter.sender.send(result);
            }
            // term mismatch: another leader overwrote this index, and the
            // waiter's command will never apply here
        }
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }

    fn apply_command(&self, cmd: Command) -> ApplyResult {
        let mut result = ApplyResult::default();
        let mut store = self.store.lock();
        match cmd {
            Command::None => {}
            Command::Create { file_type } => {
                result.id = store.create(file_type);
            }
            Command::Put { id, data } => {
                if let Err(e) = store.put(id, data) {
                    warn!(id, error = %e, "PUT on missing extent ignored");
                }
            }
            Command::Get { id } => {
                result.buf = store.get(id).unwrap_or_default();
            }
            Command::GetAttr { id } => {
                result.attr = store.getattr(id).unwrap_or_default();
            }
            Command::Remove { id } => {
                if let Err(e) = store.remove(id) {
                    warn!(id, error = %e, "REMOVE on missing extent ignored");
                }
            }
        }
        result
    }
}

impl StateMachine for ExtentStateMachine {
    fn apply(&self, entry: &LogEntry) {
        if entry.command.is_empty() {
            // padding entry restored from a sparse log; nothing to do
            return;
        }
        let cmd = match Command::decode(&entry.command) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(index = entry.index, error = %e, "undecodable command skipped");
                return;
            }
        };
        trace!(index = entry.index, ?cmd, "applying command");
        let result = self.apply_command(cmd);
        self.fulfill(entry.term, entry.index, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TYPE_FILE;
    use std::sync::Arc;
    use std::thread;

    fn entry(index: u64, cmd: &Command) -> LogEntry {
        LogEntry::new(1, index, cmd.encode())
    }

    /// Submit at `index` and apply the matching entry from another thread,
    /// the way the apply loop would.
    fn run(sm: &Arc<ExtentStateMachine>, index: u64, cmd: Command) -> ApplyResult {
        let applier = {
            let sm = Arc::clone(sm);
            let e = entry(index, &cmd);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                sm.apply(&e);
            })
        };
        let out = sm
            .submit_and_wait(Duration::from_secs(5), || Ok((1, index)))
            .unwrap();
        applier.join().unwrap();
        out
    }

    #[test]
    fn create_then_get_through_the_log() {
        let sm = Arc::new(ExtentStateMachine::new());
        let created = run(&sm, 1, Command::Create { file_type: TYPE_FILE });
        assert_eq!(created.id, 2);

        run(&sm, 2, Command::Put { id: created.id, data: b"data".to_vec() });
        let got = run(&sm, 3, Command::Get { id: created.id });
        assert_eq!(got.buf, b"data".to_vec());
    }

    #[test]
    fn wait_times_out_when_nothing_applies() {
        let sm = ExtentStateMachine::new();
        let err = sm.submit_and_wait(Duration::from_millis(10), || Ok((1, 42)));
        assert!(matches!(err, Err(ExtentError::ApplyTimeout { index: 42 })));
        // the timed-out waiter is evicted
        assert_eq!(sm.waiter_count(), 0);
    }

    #[test]
    fn failed_submission_registers_no_waiter() {
        let sm = ExtentStateMachine::new();
        let err = sm.submit_and_wait(Duration::from_millis(10), || Err(RaftError::NotLeader));
        assert!(matches!(err, Err(ExtentError::NotLeader)));
        assert_eq!(sm.waiter_count(), 0);
    }

    #[test]
    fn applies_with_no_waiter_retain_nothing() {
        // the follower/restart path: a long stretch of entries nobody is
        // blocked on must not accumulate state in the waiter table
        let sm = ExtentStateMachine::new();
        for i in 1..=1000 {
            sm.apply(&entry(i, &Command::Create { file_type: TYPE_FILE }));
        }
        assert_eq!(sm.waiter_count(), 0);
        assert!(sm.with_store(|s| s.contains(1001)));
    }

    #[test]
    fn superseded_entry_does_not_answer_the_waiter() {
        // submitted under term 1, but a term-2 leader overwrote the index
        let sm = Arc::new(ExtentStateMachine::new());
        let applier = {
            let sm = Arc::clone(&sm);
            let e = LogEntry::new(2, 1, Command::Create { file_type: TYPE_FILE }.encode());
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                sm.apply(&e);
            })
        };
        let err = sm.submit_and_wait(Duration::from_millis(200), || Ok((1, 1)));
        assert!(matches!(err, Err(ExtentError::ApplyTimeout { index: 1 })));
        applier.join().unwrap();
    }

    #[test]
    fn padding_entries_are_ignored() {
        let sm = ExtentStateMachine::new();
        sm.apply(&LogEntry::sentinel());
        assert!(sm.with_store(|s| s.contains(1)));
    }
}
