//! src/dataloader/loader.rs
//!
//! DataLoader constructors.
//!
//! # Constructor Overview
//!
//! ### Automatic sampling
//! DataLoader creates the sampler from `config.shuffle`:
//! - `shuffle = false`: SequentialSampler
//! - `shuffle = true`: RandomSampler seeded with `config.seed`
//!
//! **Methods:** `new()`, `with_collator()`
//!
//! ### Custom sampling
//! The caller provides an index sampler (for example a `DistributedSampler`)
//! and the DataLoader wraps it in a `BatchSampler` using the configured
//! `batch_size` and `drop_last`.
//!
//! **Methods:** `with_sampler()`, `with_sampler_and_collator()`
//!
//! # Seed Coordination
//!
//! `config.seed` drives both the automatic RandomSampler and the per-sample
//! transform RNG. A custom sampler carries its own seed; pass the same value
//! to both so that one number reproduces a run.

use crate::collator::{Collator, StackCollator};
use crate::dataset::Dataset;
use crate::sampler::{BatchSampler, BoxedSampler, RandomSampler, Sampler, SequentialSampler};
use anyhow::{bail, ensure, Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::config::DataLoaderConfig;

/// Batches samples out of a [`Dataset`], on the caller's thread or on a pool
/// of worker threads.
///
/// # Thread safety:
/// - `DataLoader` is `Send + Sync`; the epoch counter is atomic.
/// - Iterators borrow the loader and are used on a single thread.
///
/// # Type parameters:
/// - `D`: Dataset type, shared with workers through `Arc`
/// - `C`: Collator type (defaults to StackCollator)
pub struct DataLoader<D: ?Sized, C = StackCollator> {
    pub(crate) dataset: Arc<D>,
    pub(crate) collator: C,
    pub(crate) config: DataLoaderConfig,
    pub(crate) batch_sampler: BatchSampler<BoxedSampler>,
    pub(crate) current_epoch: AtomicUsize,
}

impl<D> DataLoader<D, StackCollator>
where
    D: Dataset + ?Sized + 'static,
{
    /// Creates a DataLoader with the default StackCollator that picks its
    /// own sampler from `config.shuffle`.
    ///
    /// # Example
    /// ```ignore
    /// let config = DataLoaderConfig::builder(42)
    ///     .batch_size(32)
    ///     .shuffle(true)
    ///     .build();
    /// let dataloader = DataLoader::new(Arc::new(dataset), config)?;
    /// ```
    pub fn new(dataset: Arc<D>, config: DataLoaderConfig) -> Result<Self> {
        Self::with_collator(dataset, config, StackCollator)
    }

    /// Creates a DataLoader over a caller-chosen index sampler.
    ///
    /// # Errors
    /// `config.shuffle = true`: shuffling belongs to the sampler.
    pub fn with_sampler(dataset: Arc<D>, sampler: BoxedSampler, config: DataLoaderConfig) -> Result<Self> {
        Self::with_sampler_and_collator(dataset, sampler, config, StackCollator)
    }
}

impl<D, C> DataLoader<D, C>
where
    D: Dataset + ?Sized + 'static,
    C: Collator + Clone + Send + Sync + 'static,
{
    pub fn with_collator(dataset: Arc<D>, config: DataLoaderConfig, collator: C) -> Result<Self> {
        let sampler: BoxedSampler = if config.shuffle {
            Box::new(RandomSampler::new(dataset.len(), false, None, config.seed)?)
        } else {
            Box::new(SequentialSampler::new(dataset.len()))
        };
        Self::build(dataset, sampler, config, collator)
    }

    pub fn with_sampler_and_collator(
        dataset: Arc<D>,
        sampler: BoxedSampler,
        config: DataLoaderConfig,
        collator: C,
    ) -> Result<Self> {
        if config.shuffle {
            bail!(
                "Cannot specify shuffle = true when providing a custom sampler.\n\
                Either:\n\
                1. Use DataLoader::new() with shuffle = true to let DataLoader manage sampling\n\
                2. Use DataLoader::with_sampler() with shuffle = false and shuffle in the sampler"
            );
        }
        Self::build(dataset, sampler, config, collator)
    }

    fn build(dataset: Arc<D>, sampler: BoxedSampler, config: DataLoaderConfig, collator: C) -> Result<Self> {
        ensure!(config.batch_size > 0, "Batch size must be greater than 0");
        ensure!(
            config.prefetch_factor > 0 || config.num_workers == 0,
            "Prefetch factor must be > 0 when using {} workers",
            config.num_workers
        );

        let batch_sampler = BatchSampler::new(sampler, config.batch_size, config.drop_last)
            .context("Failed to wrap sampler with BatchSampler")?;

        tracing::debug!(
            samples = dataset.len(),
            batches = batch_sampler.len(),
            batch_size = config.batch_size,
            num_workers = config.num_workers,
            shuffle = config.shuffle,
            "Created DataLoader"
        );

        Ok(Self {
            dataset,
            collator,
            config,
            batch_sampler,
            current_epoch: AtomicUsize::new(0),
        })
    }

    /// Number of batches one epoch yields.
    pub fn len(&self) -> usize {
        self.batch_sampler.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dataset(&self) -> &Arc<D> {
        &self.dataset
    }

    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Epoch the next `iter()` call will run.
    pub fn epoch(&self) -> usize {
        self.current_epoch.load(Ordering::SeqCst)
    }

    /// Overrides the epoch counter, e.g. when resuming from a checkpoint.
    pub fn set_epoch(&self, epoch: usize) {
        self.current_epoch.store(epoch, Ordering::SeqCst);
    }
}
