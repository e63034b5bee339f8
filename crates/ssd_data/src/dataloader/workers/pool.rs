//! Worker pool for parallel batch loading.
//!
//! Each worker owns a bounded task channel and the main thread routes every
//! task to a specific worker, so assignment is deterministic. All workers
//! share one bounded output channel.
//!
//! # Key features
//! - Bounded channels keep memory at `O(num_workers x buffer_size)` batches
//! - Workers stop when the pool is dropped
//! - Thread-local worker ids for log fields and error context

use anyhow::{ensure, Context, Result};
use crossbeam_channel::{bounded, Receiver, SendError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::dataloader::common::thread::WORKER_ID;

/// Thread pool with per-worker task channels.
///
/// - Task channels: main thread -> worker `i`
/// - Output channel: workers -> main thread
/// - Shutdown flag: checked by workers between tasks
///
/// # Type Parameters
/// - `Task`: Work items sent to workers
/// - `Output`: Results returned from workers
pub(crate) struct WorkerPool<Task, Output> {
    workers: Vec<thread::JoinHandle<()>>,
    task_txs: Vec<Sender<Task>>,
    pub(crate) output_rx: Receiver<Output>,
    shutdown: Arc<AtomicBool>,
}

impl<Task, Output> WorkerPool<Task, Output>
where
    Task: Send + 'static,
    Output: Send + 'static,
{
    /// Spawns `num_workers` threads named `{name}-{id}`, each running
    /// `worker_fn` over its own task receiver.
    ///
    /// Every task channel holds `buffer_size` tasks and the output channel
    /// holds `buffer_size * num_workers` results, so a caller that keeps at
    /// most that many tasks in flight never blocks a worker on send.
    pub(crate) fn new<F>(
        name: &str,
        num_workers: usize,
        buffer_size: usize,
        worker_fn: F,
    ) -> Result<Self>
    where
        F: Fn(Receiver<Task>, Sender<Output>, Arc<AtomicBool>) + Send + Sync + 'static,
    {
        ensure!(
            num_workers > 0,
            "Cannot create WorkerPool with 0 workers. \
            Either set num_workers > 0 or use single-threaded mode."
        );
        ensure!(
            buffer_size > 0,
            "Cannot create WorkerPool with buffer_size 0. \
            Buffer size must be > 0 to prevent deadlocks."
        );

        let (output_tx, output_rx) = bounded(buffer_size * num_workers);
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker_fn = Arc::new(worker_fn);

        let mut workers = Vec::with_capacity(num_workers);
        let mut task_txs = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let (task_tx, task_rx) = bounded(buffer_size);
            let output_tx = output_tx.clone();
            let shutdown = shutdown.clone();
            let worker_fn = worker_fn.clone();

            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || {
                    WORKER_ID.with(|id| id.set(worker_id));
                    worker_fn(task_rx, output_tx, shutdown);
                })
                .with_context(|| format!("Failed to spawn worker thread {}", worker_id))?;

            workers.push(handle);
            task_txs.push(task_tx);
        }

        tracing::debug!(name, num_workers, buffer_size, "Started worker pool");

        Ok(Self {
            workers,
            task_txs,
            output_rx,
            shutdown,
        })
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.task_txs.len()
    }

    /// Routes `task` to worker `worker_id`. Blocks while that worker's queue is full.
    pub(crate) fn send_to(&self, worker_id: usize, task: Task) -> Result<()> {
        self.task_txs[worker_id]
            .send(task)
            .map_err(|SendError(_)| anyhow::anyhow!("Worker {} has stopped", worker_id))
    }
}

impl<Task, Output> Drop for WorkerPool<Task, Output> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        // Closing the task channels wakes workers blocked on recv
        self.task_txs.clear();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::warn!("A loader worker panicked before shutdown");
            }
        }
    }
}
