//! src/dataloader/iterator.rs
//!
//! Iterator implementations for DataLoader.
//!
//! - `SingleThreaded`: loads each batch on the caller's thread when asked
//! - `MultiWorker`: a fresh worker pool per epoch; batches are assigned
//!   round-robin, up to `num_workers x prefetch_factor` stay in flight, and
//!   results are reordered so they come out in sampler order
//!
//! Both variants run the same `load_batch` routine with the same per-sample
//! seeds, so the worker count never changes what a batch contains.

use crate::collator::Collator;
use crate::dataset::Dataset;
use crate::minibatch::MiniBatch;
use crate::sampler::Sampler;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::RecvTimeoutError;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::loader::DataLoader;
use super::workers::pool::WorkerPool;
use super::workers::{load_batch, spawn_batch_workers, BatchContext, BatchOutput, BatchTask};

type BatchIndices<'a> = Box<dyn Iterator<Item = Vec<usize>> + Send + 'a>;

/// Iterator over the batches of one epoch.
///
/// Created by calling `dataloader.iter()`.
pub struct DataLoaderIter<'a, D: ?Sized, C> {
    epoch: usize,
    inner: IteratorImpl<'a, D, C>,
}

enum IteratorImpl<'a, D: ?Sized, C> {
    SingleThreaded {
        dataset: &'a D,
        collator: &'a C,
        batch_indices: BatchIndices<'a>,
        ctx: BatchContext,
    },

    /// State tracking:
    /// - `next_to_send`: batch number of the next task, also picks its worker
    /// - `next_to_yield`: batch number the caller receives next
    /// - `reorder`: results that arrived ahead of `next_to_yield`
    /// - `stalled`: set after a timeout or a lost worker; the epoch ends there
    MultiWorker {
        pool: WorkerPool<BatchTask, BatchOutput>,
        batch_indices: BatchIndices<'a>,
        timeout: Duration,
        max_in_flight: usize,
        next_to_send: usize,
        next_to_yield: usize,
        reorder: HashMap<usize, Result<MiniBatch>>,
        stalled: bool,
    },
}

impl<D, C> DataLoader<D, C>
where
    D: Dataset + ?Sized + 'static,
    C: Collator + Clone + Send + Sync + 'static,
{
    /// Starts the next epoch and returns an iterator over its batches.
    ///
    /// Every call advances the epoch counter, which reseeds shuffling samplers
    /// and the per-sample transform RNG.
    pub fn iter(&self) -> Result<DataLoaderIter<'_, D, C>> {
        let epoch = self.current_epoch.fetch_add(1, Ordering::SeqCst);
        let batch_indices = self.batch_sampler.iter(epoch);
        let ctx = BatchContext {
            seed: self.config.seed,
            pin_memory: self.config.pin_memory,
        };

        let inner = if self.config.num_workers == 0 {
            IteratorImpl::SingleThreaded {
                dataset: &*self.dataset,
                collator: &self.collator,
                batch_indices,
                ctx,
            }
        } else {
            let pool = spawn_batch_workers(
                self.dataset.clone(),
                self.collator.clone(),
                self.config.num_workers,
                self.config.prefetch_factor,
                ctx,
            )
            .context("Failed to start loader workers")?;

            IteratorImpl::MultiWorker {
                max_in_flight: self.config.num_workers * self.config.prefetch_factor,
                pool,
                batch_indices,
                timeout: self.config.timeout,
                next_to_send: 0,
                next_to_yield: 0,
                reorder: HashMap::new(),
                stalled: false,
            }
        };

        tracing::debug!(epoch, num_workers = self.config.num_workers, "Starting epoch");
        Ok(DataLoaderIter { epoch, inner })
    }
}

impl<D: ?Sized, C> DataLoaderIter<'_, D, C> {
    /// Epoch this iterator is producing.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl<D, C> Iterator for DataLoaderIter<'_, D, C>
where
    D: Dataset + ?Sized,
    C: Collator,
{
    type Item = Result<MiniBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let epoch = self.epoch;
        match &mut self.inner {
            IteratorImpl::SingleThreaded {
                dataset,
                collator,
                batch_indices,
                ctx,
            } => {
                let indices = batch_indices.next()?;
                Some(load_batch(*dataset, *collator, &indices, epoch, *ctx))
            }

            IteratorImpl::MultiWorker {
                pool,
                batch_indices,
                timeout,
                max_in_flight,
                next_to_send,
                next_to_yield,
                reorder,
                stalled,
            } => {
                if *stalled {
                    return None;
                }

                // Keep the pipeline full
                while *next_to_send - *next_to_yield < *max_in_flight {
                    let Some(indices) = batch_indices.next() else {
                        break;
                    };
                    let worker = *next_to_send % pool.num_workers();
                    let task = BatchTask {
                        batch_index: *next_to_send,
                        indices,
                        epoch,
                    };
                    if let Err(e) = pool.send_to(worker, task) {
                        *stalled = true;
                        return Some(Err(e.context(format!(
                            "Failed to send batch {} to worker {}",
                            *next_to_send, worker
                        ))));
                    }
                    *next_to_send += 1;
                }

                if *next_to_yield == *next_to_send {
                    return None;
                }

                if let Some(result) = reorder.remove(&*next_to_yield) {
                    *next_to_yield += 1;
                    return Some(result);
                }

                loop {
                    match pool.output_rx.recv_timeout(*timeout) {
                        Ok((batch_index, result)) if batch_index == *next_to_yield => {
                            *next_to_yield += 1;
                            return Some(result);
                        }
                        Ok((batch_index, result)) => {
                            reorder.insert(batch_index, result);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            *stalled = true;
                            tracing::warn!(
                                batch = *next_to_yield,
                                in_flight = *next_to_send - *next_to_yield,
                                "Timed out waiting for loader workers"
                            );
                            return Some(Err(anyhow!(
                                "Failed to receive batch {} from workers after {:?} \
                                (in flight: {}, possible deadlock or slow transform)",
                                *next_to_yield,
                                timeout,
                                *next_to_send - *next_to_yield
                            )));
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            *stalled = true;
                            return Some(Err(anyhow!(
                                "Loader workers exited before batch {} was produced",
                                *next_to_yield
                            )));
                        }
                    }
                }
            }
        }
    }
}
