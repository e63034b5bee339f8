//! src/dataloader/mod.rs
//!
//! This module implements the in-process `DataLoader`.
//!
//! The `DataLoader` coordinates the `Dataset`, `Sampler`, and `Collator` to
//! turn COCO images into training batches, optionally on a pool of worker
//! threads.
//!
//! # Architecture Overview
//!
//! ```text
//!                  ┌──────────────┐
//!                  │   Sampler    │ (Sequential / Random / Distributed)
//!                  └──────┬───────┘
//!                         │ index order for epoch e
//!                         ↓
//!                  ┌──────────────┐
//!                  │ BatchSampler │ (groups indices, drop_last)
//!                  └──────┬───────┘
//!                         │ Vec<usize> per batch
//!                         ↓
//!                  ┌──────────────┐
//!                  │  DataLoader  │ ←───── DataLoaderConfig
//!                  └──────┬───────┘
//!                         │ round-robin tasks
//!                         ↓
//!                   [Worker Threads] (optional)
//!                         │ Dataset::get(index, rng(seed, e, index))
//!                         ↓
//!                    ┌──────────┐
//!                    │ Collator │ (stacks fixed-size tensors)
//!                    └────┬─────┘
//!                         ↓
//!                   ┌───────────┐
//!                   │ MiniBatch │ (optionally pinned)
//!                   └───────────┘
//! ```
//!
//! # Module Structure
//!
//! ```text
//! src/dataloader/
//! ├── mod.rs        # Public API exports + architecture docs
//! ├── config.rs     # DataLoaderConfig and builder
//! ├── loader.rs     # DataLoader struct and constructors
//! ├── iterator.rs   # DataLoaderIter: single-threaded and multi-worker
//! ├── workers/
//! │   ├── mod.rs    # Batch task protocol and the shared load routine
//! │   └── pool.rs   # Generic `WorkerPool<Task, Output>`
//! └── common/
//!     ├── seed.rs   # Per-sample RNG derivation
//!     └── thread.rs # Thread-local worker ID
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! let config = DataLoaderConfig::builder(seed)
//!     .batch_size(32)
//!     .num_workers(4)
//!     .shuffle(true)
//!     .build();
//! let dataloader = DataLoader::new(Arc::new(dataset), config)?;
//!
//! for epoch in 0..epochs {
//!     for batch in dataloader.iter()? {
//!         let batch: MiniBatch = batch?;
//!         let images = batch.get("image")?;
//!     }
//! }
//! ```
//!
//! # Memory Usage
//! - Single-threaded: O(batch_size)
//! - Multi-threaded: O(num_workers x prefetch_factor x batch_size)

mod common;
mod config;
mod iterator;
mod loader;
mod workers;

pub use common::seed::{sample_rng, sample_seed};
pub use common::thread::{current_worker_id, WORKER_ID};
pub use config::{DataLoaderConfig, DataLoaderConfigBuilder, DEFAULT_TIMEOUT};
pub use iterator::DataLoaderIter;
pub use loader::DataLoader;

pub(crate) use workers::pool::WorkerPool;
