//! src/pipeline/mod.rs
//!
//! Pipeline-style training backend.
//!
//! Where the [`DataLoader`](crate::dataloader::DataLoader) walks a sampler
//! epoch by epoch, the pipeline reads its shard of COCO train cyclically on
//! its own threads and the [`PipelineIterator`] cuts that stream into
//! epochs of a fixed size.
//!
//! ```text
//! ShardReader ──indices──▶ [coco-pipeline-N threads] ──MiniBatch──▶ CocoPipeline
//!   (shard = device_id)      decode, SSD train transform,             │ share/release
//!                            fp16 / layout                            ▼
//!                                                            PipelineIterator ──▶ Accelerator
//! ```

mod coco;
mod iterator;
mod reader;

pub use coco::{CocoPipeline, CocoPipelineConfig};
pub use iterator::PipelineIterator;
pub use reader::ShardReader;

use std::fmt;

/// Device class the pipeline's batches are delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accelerator {
    /// CUDA device `local_rank`.
    Gpu,
    /// Cambricon MLU; libtorch has no device for it, so batches stay on the host.
    Mlu,
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accelerator::Gpu => write!(f, "gpu"),
            Accelerator::Mlu => write!(f, "mlu"),
        }
    }
}
