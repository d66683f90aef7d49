//! # pool
//!
//! why: keep blocking rpc round-trips off the lock-holding threads
//! relations: used by server.rs to fan out vote and append-entries calls
//! what: WorkerPool, a fixed set of threads draining a job channel

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded pool of worker threads for outbound rpc dispatch.
///
/// Jobs are fire-and-forget: the submitting thread never waits on them, and
/// replies are handled by whichever worker ran the call.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn a pool with `size` worker threads.
    pub fn new(size: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("raft-worker-{i}"))
                .spawn(move || {
                    // the loop ends when every sender is dropped
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("spawn worker thread");
            workers.push(handle);
        }
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job. Silently dropped if the pool is already shut down.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(Box::new(job));
        }
    }

    /// Stop accepting jobs, drain the queue, and join every worker.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn pool_runs_submitted_jobs() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let c = counter.clone();
            pool.execute(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn execute_after_shutdown_is_a_noop() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        pool.execute(|| panic!("must not run"));
    }
}
