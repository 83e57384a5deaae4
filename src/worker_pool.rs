//! A fixed-size pool of worker threads fed by one FIFO queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};

use log::{debug, error};
use threadpool::ThreadPool;

use crate::error::{PoolError, panic_message};

/// Resolves to the result of one submitted task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: mpsc::Receiver<Result<T, PoolError>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task has run. A panicking task yields [`PoolError::TaskPanicked`].
    pub fn wait(self) -> Result<T, PoolError> {
        match self.rx.recv() {
            Ok(r) => r,
            Err(_) => Err(PoolError::Disconnected),
        }
    }
}

/// Worker threads drawing tasks from a shared queue in submission order.
///
/// Shutting down closes the queue: tasks that were already submitted still run, then the
/// workers exit. Nothing that was accepted is dropped.
#[derive(Debug)]
pub struct WorkerPool {
    pool: Mutex<Option<ThreadPool>>,
    size: usize,
}

impl WorkerPool {
    /// Starts `workers` threads (at least one).
    pub fn new(workers: usize) -> Self {
        let size = workers.max(1);
        let pool = threadpool::Builder::new()
            .num_threads(size)
            .thread_name("mcts-worker".to_string())
            .build();
        debug!("worker pool started with {size} threads");

        Self {
            pool: Mutex::new(Some(pool)),
            size,
        }
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.size
    }

    /// Enqueues `task` and returns a handle resolving to its result.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        let pool = pool.as_ref().ok_or(PoolError::AlreadyShutdown)?;
        pool.execute(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task))
                .map_err(|payload| PoolError::TaskPanicked(panic_message(&*payload)));
            // The caller may have dropped its handle.
            let _ = tx.send(result);
        });
        Ok(TaskHandle { rx })
    }

    /// Stops accepting tasks and waits until every queued task has run.
    ///
    /// Must not be called from inside a task. Calling it twice is a no-op.
    pub fn shutdown(&self) {
        let pool = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pool) = pool else {
            return;
        };
        pool.join();
        if pool.panic_count() > 0 {
            error!("{} worker threads panicked outside of a task", pool.panic_count());
        }
        debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
