use anyhow::{ensure, Result};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// A `Sampler` decides which dataset indices an epoch visits, and in which order.
///
/// - `iter(epoch)`: the sequence for that epoch. Shuffling samplers seed their
///   RNG with `base_seed + epoch`, so every epoch is reshuffled while the same
///   `(base_seed, epoch)` always replays the same order.
/// - `len()`: number of items `iter` yields per epoch.
///
/// Implementations must be `Send + Sync` so a sampler can be owned by a
/// loader that is moved across threads.
pub trait Sampler: Send + Sync {
    type Item: Send + Sync;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + Send + '_>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Index sampler behind a trait object, as chosen at runtime by
/// [`select_sampler`](crate::loaders::select_sampler).
pub type BoxedSampler = Box<dyn Sampler<Item = usize>>;

impl<T: Send + Sync> Sampler for Box<dyn Sampler<Item = T>> {
    type Item = T;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = T> + Send + '_> {
        (**self).iter(epoch)
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

#[inline]
fn epoch_rng(base_seed: u64, epoch: usize) -> StdRng {
    StdRng::seed_from_u64(base_seed.wrapping_add(epoch as u64))
}

// ============================================================================
// SequentialSampler
// ============================================================================

/// Yields `0, 1, ..., dataset_size - 1` every epoch.
///
/// # Examples
/// ```ignore
/// let sampler = SequentialSampler::new(5);
/// let indices: Vec<_> = sampler.iter(0).collect();
/// assert_eq!(indices, vec![0, 1, 2, 3, 4]);
/// ```
#[derive(Debug, Clone)]
pub struct SequentialSampler {
    dataset_size: usize,
}

impl SequentialSampler {
    pub fn new(dataset_size: usize) -> Self {
        Self { dataset_size }
    }
}

impl Sampler for SequentialSampler {
    type Item = usize;

    fn iter(&self, _epoch: usize) -> Box<dyn Iterator<Item = usize> + Send + '_> {
        Box::new(0..self.dataset_size)
    }

    fn len(&self) -> usize {
        self.dataset_size
    }
}

// ============================================================================
// RandomSampler
// ============================================================================

/// Random uniform sampling over `0..dataset_size`, with optional replacement.
///
/// # Arguments:
/// - `dataset_size`: Total number of samples in a dataset.
/// - `replacement`: If `true`, each draw is independent and indices may repeat;
///                  If `false`, each index appears at most once.
/// - `num_samples`: Number of draws per epoch (defaults to `dataset_size`).
///                  Without replacement it must not exceed `dataset_size`.
/// - `base_seed`: Base RNG seed; epoch `e` uses `base_seed + e`.
///
/// # Example usage
/// ```ignore
/// let sampler = RandomSampler::new(118_287, false, None, 42)?;
/// ```
#[derive(Debug, Clone)]
pub struct RandomSampler {
    dataset_size: usize,
    replacement: bool,
    num_samples: usize,
    base_seed: u64,
}

impl RandomSampler {
    pub fn new(
        dataset_size: usize,
        replacement: bool,
        num_samples: Option<usize>,
        base_seed: u64,
    ) -> Result<Self> {
        let num_samples = num_samples.unwrap_or(dataset_size);
        ensure!(
            num_samples > 0,
            "num_samples must be a positive integer value, but got num_samples={}",
            num_samples
        );
        if !replacement {
            ensure!(
                num_samples <= dataset_size,
                "num_samples ({}) exceeds dataset size ({}) without replacement",
                num_samples,
                dataset_size
            );
        }
        Ok(Self {
            dataset_size,
            replacement,
            num_samples,
            base_seed,
        })
    }
}

impl Sampler for RandomSampler {
    type Item = usize;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send + '_> {
        let mut rng = epoch_rng(self.base_seed, epoch);
        if self.replacement {
            Box::new((0..self.num_samples).map(move |_| rng.random_range(0..self.dataset_size)))
        } else {
            let mut indices: Vec<_> = (0..self.dataset_size).collect();
            indices.shuffle(&mut rng);
            indices.truncate(self.num_samples);
            Box::new(indices.into_iter())
        }
    }

    fn len(&self) -> usize {
        self.num_samples
    }
}

// ============================================================================
// DistributedSampler
// ============================================================================

/// Partitions a dataset's indices across `num_replicas` training processes.
///
/// # Arguments:
/// - `dataset_size`: Total number of samples in dataset.
/// - `num_replicas`: Number of processes (one per accelerator).
/// - `rank`: This process' id, `0 <= rank < num_replicas`.
/// - `shuffle`: Whether to shuffle before partitioning.
/// - `drop_last`: If true, indices beyond the largest multiple of
///                `num_replicas` are dropped. If false, the list is padded by
///                cycling from the front so every rank gets the same count.
/// - `base_seed`: Shared by all ranks so they agree on the permutation.
///
/// # Allocation
/// For 10 samples across 3 ranks (no shuffle):
/// ```text
/// drop_last=true (truncate to 9 samples)
///   Rank 0: [0, 3, 6]
///   Rank 1: [1, 4, 7]
///   Rank 2: [2, 5, 8]
///
/// drop_last=false (pad to 12 samples)
///   Rank 0: [0, 3, 6, 9]
///   Rank 1: [1, 4, 7, 0]
///   Rank 2: [2, 5, 8, 1]
/// ```
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    dataset_size: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    drop_last: bool,
    base_seed: u64,
}

impl DistributedSampler {
    pub fn new(
        dataset_size: usize,
        num_replicas: usize,
        rank: usize,
        shuffle: bool,
        drop_last: bool,
        base_seed: u64,
    ) -> Result<Self> {
        ensure!(dataset_size > 0, "Dataset size must not be empty");
        ensure!(num_replicas > 0, "Number of replicas must be > 0");
        ensure!(
            rank < num_replicas,
            "Invalid rank {rank}, rank should be in the interval [0, {}]",
            num_replicas - 1
        );
        Ok(Self {
            dataset_size,
            num_replicas,
            rank,
            shuffle,
            drop_last,
            base_seed,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    /// Number of indices across all ranks after padding or truncation.
    fn total_size(&self) -> usize {
        if self.drop_last {
            self.dataset_size - (self.dataset_size % self.num_replicas)
        } else {
            self.dataset_size.div_ceil(self.num_replicas) * self.num_replicas
        }
    }
}

impl Sampler for DistributedSampler {
    type Item = usize;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = usize> + Send + '_> {
        let mut indices: Vec<usize> = (0..self.dataset_size).collect();
        if self.shuffle {
            indices.shuffle(&mut epoch_rng(self.base_seed, epoch));
        }

        let total_size = self.total_size();
        if self.drop_last {
            indices.truncate(total_size);
        } else if total_size > indices.len() {
            let padding: Vec<_> = indices
                .iter()
                .cycle()
                .take(total_size - indices.len())
                .copied()
                .collect();
            indices.extend(padding);
        }

        // Every rank takes each `num_replicas`-th index starting at its own rank.
        Box::new(
            indices
                .into_iter()
                .skip(self.rank)
                .step_by(self.num_replicas),
        )
    }

    fn len(&self) -> usize {
        self.total_size() / self.num_replicas
    }
}

// ============================================================================
// BatchSampler
// ============================================================================

/// Groups the items of another sampler into mini-batches.
///
/// If `drop_last` is `true`, a final mini-batch smaller than `batch_size`
/// is discarded.
///
/// # Example
/// ```ignore
/// let batch_sampler = BatchSampler::new(SequentialSampler::new(1000), 32, false)?;
/// for mini_batch in batch_sampler.iter(0) {
///     // 31 batches of 32 indices, then one of 8
/// }
/// ```
#[derive(Debug, Clone)]
pub struct BatchSampler<S> {
    sampler: S,
    batch_size: usize,
    drop_last: bool,
}

impl<S: Sampler> BatchSampler<S> {
    pub fn new(sampler: S, batch_size: usize, drop_last: bool) -> Result<Self> {
        ensure!(
            batch_size > 0,
            "batch_size must be > 0, but got batch_size={}",
            batch_size
        );
        Ok(Self {
            sampler,
            batch_size,
            drop_last,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn inner(&self) -> &S {
        &self.sampler
    }
}

impl<S: Sampler> Sampler for BatchSampler<S> {
    type Item = Vec<S::Item>;

    fn iter(&self, epoch: usize) -> Box<dyn Iterator<Item = Self::Item> + Send + '_> {
        let mut sampler_iter = self.sampler.iter(epoch);
        let batch_size = self.batch_size;
        let drop_last = self.drop_last;

        Box::new(std::iter::from_fn(move || {
            let mini_batch: Vec<_> = sampler_iter.by_ref().take(batch_size).collect();
            if mini_batch.len() == batch_size || (!drop_last && !mini_batch.is_empty()) {
                Some(mini_batch)
            } else {
                None
            }
        }))
    }

    fn len(&self) -> usize {
        if self.drop_last {
            self.sampler.len() / self.batch_size
        } else {
            self.sampler.len().div_ceil(self.batch_size)
        }
    }
}
