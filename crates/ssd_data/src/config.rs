//! Run configuration consumed by the loader assemblers in [`crate::loaders`].
//!
//! The JSON field names match the training script's arguments:
//!
//! ```json
//! {
//!   "data": "/coco",
//!   "distributed": false,
//!   "data_backend": "pytorch",
//!   "batch_size": 32,
//!   "eval_batch_size": 32,
//!   "num_workers": 4,
//!   "local_rank": 0,
//!   "N_gpu": 1,
//!   "pyamp": false,
//!   "seed": 42,
//!   "sampler_seed": 0
//! }
//! ```

use crate::error::DataError;
use crate::pipeline::Accelerator;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Number of images in COCO train2017 that carry at least one annotation.
pub const COCO_TRAIN_IMAGES: usize = 118_287;

/// Which machinery produces training batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DataBackend {
    /// Worker threads inside this process (`"pytorch"`).
    #[default]
    InProcess,
    /// Staged decode pipeline delivering to an accelerator
    /// (`"dali-gpu"`, `"dali-mlu"`).
    Pipeline(Accelerator),
}

impl DataBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataBackend::InProcess => "pytorch",
            DataBackend::Pipeline(Accelerator::Gpu) => "dali-gpu",
            DataBackend::Pipeline(Accelerator::Mlu) => "dali-mlu",
        }
    }
}

impl FromStr for DataBackend {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pytorch" => Ok(DataBackend::InProcess),
            "dali-gpu" => Ok(DataBackend::Pipeline(Accelerator::Gpu)),
            "dali-mlu" => Ok(DataBackend::Pipeline(Accelerator::Mlu)),
            other => Err(DataError::UnsupportedBackend(other.to_string())),
        }
    }
}

impl TryFrom<String> for DataBackend {
    type Error = DataError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DataBackend> for String {
    fn from(backend: DataBackend) -> Self {
        backend.as_str().to_string()
    }
}

impl fmt::Display for DataBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_prefetch_factor() -> usize {
    2
}

fn default_pipeline_epoch_size() -> usize {
    COCO_TRAIN_IMAGES
}

/// Data-loading section of a training run's configuration.
///
/// Immutable once built; the assemblers only read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    /// COCO root holding `annotations/`, `train2017/` and `val2017/`.
    pub data: PathBuf,
    #[serde(default)]
    pub distributed: bool,
    #[serde(default)]
    pub data_backend: DataBackend,
    pub batch_size: usize,
    pub eval_batch_size: usize,
    #[serde(default)]
    pub num_workers: usize,
    /// Device ordinal and shard id of this process.
    #[serde(default)]
    pub local_rank: usize,
    /// Number of shards (processes) in distributed training.
    #[serde(rename = "N_gpu", default = "default_one")]
    pub n_gpu: usize,
    /// Emit reduced-precision (f16) images from the pipeline backend.
    #[serde(default)]
    pub pyamp: bool,
    /// Seed of this process: transform RNG streams and pipeline reads.
    /// Distributed ranks may each use their own.
    pub seed: u64,
    /// Seed of the distributed sampler's permutation. Every rank must use
    /// the same value or the shards overlap.
    #[serde(default)]
    pub sampler_seed: u64,
    #[serde(default = "default_true")]
    pub pin_memory: bool,
    #[serde(default = "default_prefetch_factor")]
    pub prefetch_factor: usize,
    /// Images per pipeline epoch across all shards.
    #[serde(default = "default_pipeline_epoch_size")]
    pub pipeline_epoch_size: usize,
}

impl DataConfig {
    pub fn builder(data: impl Into<PathBuf>, seed: u64) -> DataConfigBuilder {
        DataConfigBuilder {
            config: DataConfig {
                data: data.into(),
                distributed: false,
                data_backend: DataBackend::InProcess,
                batch_size: 32,
                eval_batch_size: 32,
                num_workers: 0,
                local_rank: 0,
                n_gpu: 1,
                pyamp: false,
                seed,
                sampler_seed: 0,
                pin_memory: true,
                prefetch_factor: default_prefetch_factor(),
                pipeline_epoch_size: COCO_TRAIN_IMAGES,
            },
        }
    }

    /// Reads and validates a JSON configuration file.
    ///
    /// # Errors
    /// [`DataError::NotFound`] for a missing file, [`DataError::MalformedConfig`]
    /// when it cannot be read, parsed or validated, and
    /// [`DataError::UnsupportedBackend`] for an unknown `data_backend`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                DataError::NotFound {
                    path: path.to_path_buf(),
                    source,
                }
            } else {
                DataError::MalformedConfig(format!("{}: {}", path.display(), source))
            }
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: DataConfig = serde_json::from_str(text).map_err(|e| {
            // serde wraps `try_from` failures into its own message; surface the
            // declared kind for an unknown backend instead.
            unsupported_backend(text).unwrap_or_else(|| DataError::MalformedConfig(e.to_string()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the assemblers rely on.
    pub fn validate(&self) -> Result<(), DataError> {
        let fail = |msg: String| Err(DataError::MalformedConfig(msg));
        if self.batch_size == 0 || self.eval_batch_size == 0 {
            return fail("batch_size and eval_batch_size must be > 0".to_string());
        }
        if self.n_gpu == 0 {
            return fail("N_gpu must be > 0".to_string());
        }
        if self.local_rank >= self.n_gpu {
            return fail(format!(
                "local_rank {} must be < N_gpu {}",
                self.local_rank, self.n_gpu
            ));
        }
        if self.num_workers > 0 && self.prefetch_factor == 0 {
            return fail("prefetch_factor must be > 0 when using workers".to_string());
        }
        if self.pipeline_epoch_size == 0 {
            return fail("pipeline_epoch_size must be > 0".to_string());
        }
        Ok(())
    }
}

fn unsupported_backend(text: &str) -> Option<DataError> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let backend = value.get("data_backend")?.as_str()?;
    backend.parse::<DataBackend>().err()
}

/// Builder for [`DataConfig`] with method chaining.
#[derive(Debug)]
pub struct DataConfigBuilder {
    config: DataConfig,
}

impl DataConfigBuilder {
    pub fn distributed(mut self, distributed: bool) -> Self {
        self.config.distributed = distributed;
        self
    }

    pub fn data_backend(mut self, backend: DataBackend) -> Self {
        self.config.data_backend = backend;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn eval_batch_size(mut self, size: usize) -> Self {
        self.config.eval_batch_size = size;
        self
    }

    pub fn num_workers(mut self, workers: usize) -> Self {
        self.config.num_workers = workers;
        self
    }

    /// Set this process's rank and the number of shards.
    pub fn shard(mut self, local_rank: usize, n_gpu: usize) -> Self {
        self.config.local_rank = local_rank;
        self.config.n_gpu = n_gpu;
        self
    }

    pub fn sampler_seed(mut self, seed: u64) -> Self {
        self.config.sampler_seed = seed;
        self
    }

    pub fn pyamp(mut self, pyamp: bool) -> Self {
        self.config.pyamp = pyamp;
        self
    }

    pub fn pin_memory(mut self, pin: bool) -> Self {
        self.config.pin_memory = pin;
        self
    }

    pub fn prefetch_factor(mut self, factor: usize) -> Self {
        self.config.prefetch_factor = factor;
        self
    }

    pub fn pipeline_epoch_size(mut self, size: usize) -> Self {
        self.config.pipeline_epoch_size = size;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<DataConfig, DataError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
