//! Worker management for parallel data loading.
//!
//! - `pool`: generic worker pool with per-worker task channels
//! - this module: the batch task protocol and the routine every worker
//!   (and the single-threaded path) runs to turn indices into a `MiniBatch`

pub(crate) mod pool;

use crate::collator::Collator;
use crate::dataloader::common::seed::sample_rng;
use crate::dataloader::common::thread::current_worker_id;
use crate::dataset::Dataset;
use crate::minibatch::MiniBatch;
use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use self::pool::WorkerPool;

/// One batch of work: position in the epoch plus the dataset indices to load.
#[derive(Debug)]
pub(crate) struct BatchTask {
    pub(crate) batch_index: usize,
    pub(crate) indices: Vec<usize>,
    pub(crate) epoch: usize,
}

/// Result tagged with the batch position so the iterator can restore order.
pub(crate) type BatchOutput = (usize, Result<MiniBatch>);

/// Seed material and flags a batch needs besides its indices.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchContext {
    pub(crate) seed: u64,
    pub(crate) pin_memory: bool,
}

/// Loads `indices`, each with its own `(seed, epoch, index)` RNG, and collates them.
pub(crate) fn load_batch<D, C>(
    dataset: &D,
    collator: &C,
    indices: &[usize],
    epoch: usize,
    ctx: BatchContext,
) -> Result<MiniBatch>
where
    D: Dataset + ?Sized,
    C: Collator,
{
    let samples = indices
        .iter()
        .map(|&index| {
            let mut rng = sample_rng(ctx.seed, epoch, index);
            dataset
                .get(index, &mut rng)
                .with_context(|| format!("Failed to load sample {}", index))
        })
        .collect::<Result<Vec<_>>>()?;

    let batch = collator
        .collate(&samples)
        .with_context(|| format!("Collation failed for {} samples", samples.len()))?;

    if ctx.pin_memory {
        batch.pin_memory()
    } else {
        Ok(batch)
    }
}

/// Spawns `num_workers` batch loaders sharing `dataset` through `Arc`.
pub(crate) fn spawn_batch_workers<D, C>(
    dataset: Arc<D>,
    collator: C,
    num_workers: usize,
    prefetch_factor: usize,
    ctx: BatchContext,
) -> Result<WorkerPool<BatchTask, BatchOutput>>
where
    D: Dataset + ?Sized + 'static,
    C: Collator + Send + Sync + 'static,
{
    WorkerPool::new(
        "dataloader-worker",
        num_workers,
        prefetch_factor,
        move |task_rx: Receiver<BatchTask>, output_tx, shutdown| {
            while let Ok(task) = task_rx.recv() {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let result = load_batch(&*dataset, &collator, &task.indices, task.epoch, ctx)
                    .with_context(|| {
                        format!(
                            "Worker {} failed on batch {}",
                            current_worker_id(),
                            task.batch_index
                        )
                    });
                if output_tx.send((task.batch_index, result)).is_err() {
                    break;
                }
            }
        },
    )
}
