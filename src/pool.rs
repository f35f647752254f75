// --- Shared worker pool with drain-to-quiescence ---

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::{Context, Result};
use log::{debug, error};

/// Fixed-size worker pool that executes submitted tasks and can be drained.
///
/// Tasks run on long-lived rayon workers. A pending counter tracks every
/// accepted task from submission to completion, so `wait_quiescent` can
/// block until all work accepted before the call has finished. Task
/// failures and panics are logged at the worker boundary and never
/// propagate; one bad input file must not take the pipeline down.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    state: Arc<PoolState>,
}

struct PoolState {
    pending: Mutex<u64>,
    drained: Condvar,
    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("pipeline-worker-{}", i))
            .panic_handler(|_| error!("worker task panicked"))
            .build()
            .context("Failed to build worker pool")?;
        Ok(Self {
            pool,
            state: Arc::new(PoolState {
                pending: Mutex::new(0),
                drained: Condvar::new(),
                running: AtomicBool::new(true),
            }),
        })
    }

    /// Submits a task without blocking. After `shutdown` this is a no-op.
    ///
    /// The task's `Err` outcome is logged, not returned; callers that need
    /// a result hand ownership of it to the task (e.g. through a channel).
    pub fn submit<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        if !self.state.running.load(Ordering::Acquire) {
            debug!("pool is stopped, task rejected");
            return;
        }
        {
            let mut pending = self.state.pending.lock().unwrap();
            *pending += 1;
        }
        let state = Arc::clone(&self.state);
        self.pool.spawn(move || {
            // Queued tasks that missed the shutdown are skipped, but still
            // decrement the counter so waiters are released.
            if state.running.load(Ordering::Acquire) {
                match panic::catch_unwind(AssertUnwindSafe(task)) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!("task failed: {:#}", err),
                    Err(_) => error!("task panicked"),
                }
            }
            let mut pending = state.pending.lock().unwrap();
            *pending -= 1;
            if *pending == 0 {
                state.drained.notify_all();
            }
        });
    }

    /// Blocks until every task accepted before this call has completed.
    pub fn wait_quiescent(&self) {
        let mut pending = self.state.pending.lock().unwrap();
        while *pending > 0 {
            pending = self.state.drained.wait(pending).unwrap();
        }
    }

    /// Refuses new work and waits for in-flight tasks. Queued tasks that
    /// have not started are skipped. Workers are joined when the pool is
    /// dropped.
    pub fn shutdown(&self) {
        self.state.running.store(false, Ordering::Release);
        self.wait_quiescent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_all_submitted_tasks() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        pool.wait_quiescent();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn failed_and_panicking_tasks_do_not_poison_the_pool() {
        let pool = WorkerPool::new(2).unwrap();
        pool.submit(|| Err(anyhow::anyhow!("deliberate failure")));
        pool.submit(|| panic!("deliberate panic"));
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        pool.wait_quiescent();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn submit_after_shutdown_is_a_no_op() {
        let pool = WorkerPool::new(2).unwrap();
        pool.shutdown();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        pool.wait_quiescent();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn wait_quiescent_with_no_tasks_returns_immediately() {
        let pool = WorkerPool::new(1).unwrap();
        pool.wait_quiescent();
    }
}
