//! src/dataloader/config.rs
//!
//! Configuration for DataLoader behaviour.
//!
//! Example:
//! ```ignore
//! let config = DataLoaderConfig::builder(seed)
//!     .batch_size(32)
//!     .num_workers(4)
//!     .prefetch_factor(2)
//!     .pin_memory(true)
//!     .build();
//! ```
//!
//! # Performance considerations:
//! - `num_workers`: More workers improve decode/augment throughput but each
//!   keeps `prefetch_factor` batches alive.
//! - `prefetch_factor`: Higher values reduce GPU starvation but use more memory.

use std::time::Duration;

/// Default time to wait for a batch before reporting a stalled worker.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Configuration for DataLoader
#[derive(Debug, Clone)]
pub struct DataLoaderConfig {
    /// Number of samples per batch (default 1)
    pub batch_size: usize,
    /// Number of parallel workers (0 = load on the caller's thread)
    pub num_workers: usize,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Whether to reshuffle the dataset every epoch.
    /// Mutually exclusive with providing a sampler.
    pub shuffle: bool,
    /// Seeds shuffling and the per-sample transform RNG
    pub seed: u64,
    /// Number of batches kept in flight per worker (must be > 0 when using workers)
    pub prefetch_factor: usize,
    /// Maximum time to wait for the next batch from workers.
    /// If exceeded, the iterator yields an error.
    pub timeout: Duration,
    /// Copy batches into page-locked host memory when CUDA is available
    pub pin_memory: bool,
}

impl DataLoaderConfig {
    /// Starts a builder. The seed has no default: every stochastic part of
    /// loading derives from it.
    pub fn builder(seed: u64) -> DataLoaderConfigBuilder {
        DataLoaderConfigBuilder {
            config: DataLoaderConfig {
                batch_size: 1,
                num_workers: 0,
                drop_last: false,
                shuffle: false,
                seed,
                prefetch_factor: 2,
                timeout: DEFAULT_TIMEOUT,
                pin_memory: false,
            },
        }
    }
}

/// Builder for DataLoaderConfig with method chaining
#[derive(Debug)]
pub struct DataLoaderConfigBuilder {
    config: DataLoaderConfig,
}

impl DataLoaderConfigBuilder {
    /// Set the batch size (must be > 0)
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn num_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = workers;
        self
    }

    pub fn drop_last(mut self, drop: bool) -> Self {
        self.config.drop_last = drop;
        self
    }

    /// Set whether to shuffle dataset every epoch
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.config.shuffle = shuffle;
        self
    }

    /// Set the prefetch factor.
    /// Higher values help prevent GPU starvation but use more memory.
    pub fn prefetch_factor(mut self, factor: usize) -> Self {
        self.config.prefetch_factor = factor;
        self
    }

    /// Set the timeout for receiving a batch.
    ///
    /// - Too low: May fail batches during legitimate heavy decoding
    /// - Too high: Delays detection of stuck workers.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn pin_memory(mut self, pin: bool) -> Self {
        self.config.pin_memory = pin;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> DataLoaderConfig {
        self.config
    }
}
