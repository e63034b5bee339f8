//! Staged decode + augment + encode pipeline over one shard of COCO train.
//!
//! Lifecycle:
//!
//! ```text
//!  Configured ──build()──▶ Built ──schedule_run()──▶ (run queued on a worker)
//!                            ▲                              │
//!                            │                      share_outputs()
//!                    release_outputs()                      │
//!                            │                              ▼
//!                            └──────────────────────── Sharing
//! ```
//!
//! `schedule_run` may be called again while outputs are shared, up to the
//! prefetch queue depth per worker. Any other order is a
//! [`DataError::PipelineState`].

use crate::boxes::DefaultBoxes;
use crate::coco::CocoDetection;
use crate::collator::{Collator, StackCollator};
use crate::dataloader::sample_rng;
use crate::dataloader::DEFAULT_TIMEOUT;
use crate::dataset::Dataset;
use crate::error::DataError;
use crate::minibatch::MiniBatch;
use crate::sample::keys;
use crate::transforms::{Mode, SsdTransform};
use anyhow::{anyhow, ensure, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tch::{Kind, Tensor};

use super::reader::ShardReader;
use crate::dataloader::WorkerPool;

/// Construction parameters of a [`CocoPipeline`].
#[derive(Debug, Clone)]
pub struct CocoPipelineConfig {
    pub batch_size: usize,
    /// Folder holding the images, e.g. `{root}/train2017`.
    pub file_root: PathBuf,
    pub annotations_file: PathBuf,
    pub default_boxes: Arc<DefaultBoxes>,
    /// Shard this pipeline reads; also the accelerator ordinal.
    pub device_id: usize,
    pub num_shards: usize,
    /// Cast images to f16.
    pub output_fp16: bool,
    /// Emit images as `[B, H, W, C]` instead of `[B, C, H, W]`.
    pub output_nhwc: bool,
    /// Pad images to 4 channels with zeros.
    pub pad_output: bool,
    pub num_threads: usize,
    pub seed: u64,
    /// Runs that may be queued per worker thread.
    pub prefetch_queue_depth: usize,
    pub random_shuffle: bool,
    pub timeout: Duration,
}

impl CocoPipelineConfig {
    /// Defaults used by SSD training: NCHW f32 output, no padding, two runs
    /// queued per thread, shuffled reads.
    pub fn new(
        file_root: impl Into<PathBuf>,
        annotations_file: impl Into<PathBuf>,
        default_boxes: Arc<DefaultBoxes>,
        batch_size: usize,
        seed: u64,
    ) -> Self {
        Self {
            batch_size,
            file_root: file_root.into(),
            annotations_file: annotations_file.into(),
            default_boxes,
            device_id: 0,
            num_shards: 1,
            output_fp16: false,
            output_nhwc: false,
            pad_output: false,
            num_threads: 1,
            seed,
            prefetch_queue_depth: 2,
            random_shuffle: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

struct RunTask {
    run: u64,
    items: Vec<(usize, usize)>,
}

type RunOutput = (u64, Result<MiniBatch>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Configured,
    Built,
    Sharing,
}

impl Stage {
    fn name(self) -> &'static str {
        match self {
            Stage::Configured => "configured",
            Stage::Built => "built",
            Stage::Sharing => "sharing",
        }
    }
}

struct Running {
    pool: WorkerPool<RunTask, RunOutput>,
    reader: ShardReader,
    dataset_len: usize,
}

/// Sharded COCO training pipeline running the SSD train transform on
/// `num_threads` worker threads.
///
/// Outputs stay in host memory; [`PipelineIterator`](super::PipelineIterator)
/// moves them to the accelerator.
pub struct CocoPipeline {
    config: CocoPipelineConfig,
    stage: Stage,
    running: Option<Running>,
    next_run: u64,
    next_share: u64,
    reorder: HashMap<u64, Result<MiniBatch>>,
    shared: Option<MiniBatch>,
}

impl std::fmt::Debug for CocoPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CocoPipeline")
            .field("config", &self.config)
            .field("stage", &self.stage)
            .field("scheduled", &(self.next_run - self.next_share))
            .finish()
    }
}

impl CocoPipeline {
    pub fn new(config: CocoPipelineConfig) -> Self {
        Self {
            config,
            stage: Stage::Configured,
            running: None,
            next_run: 0,
            next_share: 0,
            reorder: HashMap::new(),
            shared: None,
        }
    }

    pub fn config(&self) -> &CocoPipelineConfig {
        &self.config
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Images in this pipeline's shard, once built.
    pub fn shard_len(&self) -> Option<usize> {
        self.running.as_ref().map(|r| r.reader.shard_len())
    }

    /// Images in the whole annotation file that have at least one box, once built.
    pub fn dataset_len(&self) -> Option<usize> {
        self.running.as_ref().map(|r| r.dataset_len)
    }

    fn stage_error(&self, stage: &'static str) -> anyhow::Error {
        DataError::PipelineState {
            stage,
            state: self.stage.name(),
        }
        .into()
    }

    fn max_scheduled(&self) -> u64 {
        (self.config.num_threads * self.config.prefetch_queue_depth) as u64
    }

    /// Validates the configuration, parses the annotation file and starts
    /// the worker threads.
    pub fn build(&mut self) -> Result<()> {
        if self.stage != Stage::Configured {
            return Err(self.stage_error("build"));
        }
        let cfg = &self.config;
        ensure!(cfg.batch_size > 0, "batch_size must be > 0");
        ensure!(cfg.num_threads > 0, "num_threads must be > 0");
        ensure!(cfg.prefetch_queue_depth > 0, "prefetch_queue_depth must be > 0");
        ensure!(cfg.num_shards > 0, "num_shards must be > 0");
        ensure!(
            cfg.device_id < cfg.num_shards,
            "device_id {} must be < num_shards {}",
            cfg.device_id,
            cfg.num_shards
        );

        let transform = SsdTransform::new(Arc::clone(&cfg.default_boxes), Mode::Train)?;
        let dataset = Arc::new(
            CocoDetection::new(cfg.file_root.clone(), &cfg.annotations_file, transform)
                .context("Failed to index pipeline dataset")?,
        );
        let dataset_len = dataset.len();
        let reader = ShardReader::new(
            dataset_len,
            cfg.num_shards,
            cfg.device_id,
            cfg.random_shuffle,
            cfg.seed,
        )?;

        let post = PostProcess {
            fp16: cfg.output_fp16,
            nhwc: cfg.output_nhwc,
            pad: cfg.pad_output,
        };
        let seed = cfg.seed;
        let pool = WorkerPool::new(
            "coco-pipeline",
            cfg.num_threads,
            cfg.prefetch_queue_depth,
            move |task_rx: Receiver<RunTask>, output_tx, shutdown| {
                while let Ok(task) = task_rx.recv() {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let result = run_batch(&*dataset, &task.items, seed, post)
                        .with_context(|| format!("Pipeline run {} failed", task.run));
                    if output_tx.send((task.run, result)).is_err() {
                        break;
                    }
                }
            },
        )?;

        tracing::info!(
            shard = cfg.device_id,
            num_shards = cfg.num_shards,
            shard_images = reader.shard_len(),
            dataset_images = dataset_len,
            num_threads = cfg.num_threads,
            "Built COCO pipeline"
        );

        self.running = Some(Running {
            pool,
            reader,
            dataset_len,
        });
        self.stage = Stage::Built;
        Ok(())
    }

    /// Queues one batch for the worker threads.
    pub fn schedule_run(&mut self) -> Result<()> {
        if self.stage == Stage::Configured || self.next_run - self.next_share >= self.max_scheduled() {
            return Err(self.stage_error("schedule_run"));
        }
        let batch_size = self.config.batch_size;
        let run = self.next_run;
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| anyhow!("Pipeline has no workers"))?;
        let items = running.reader.next_batch(batch_size);
        let worker = (run % running.pool.num_workers() as u64) as usize;
        running.pool.send_to(worker, RunTask { run, items })?;
        self.next_run += 1;
        Ok(())
    }

    /// Runs scheduled but not yet shared.
    pub fn pending_runs(&self) -> usize {
        (self.next_run - self.next_share) as usize
    }

    /// Blocks until the oldest scheduled run completes and exposes its batch.
    ///
    /// A run that failed is consumed: its error is returned and the next call
    /// moves on to the following run. A run that is merely late (timeout)
    /// stays pending.
    pub fn share_outputs(&mut self) -> Result<&MiniBatch> {
        if self.stage != Stage::Built || self.next_share == self.next_run {
            return Err(self.stage_error("share_outputs"));
        }
        let outcome = self.receive(self.next_share)?;
        self.next_share += 1;
        let batch = outcome?;
        self.stage = Stage::Sharing;
        Ok(self.shared.insert(batch))
    }

    /// Drops the batch exposed by `share_outputs`.
    pub fn release_outputs(&mut self) -> Result<()> {
        if self.stage != Stage::Sharing {
            return Err(self.stage_error("release_outputs"));
        }
        self.shared = None;
        self.stage = Stage::Built;
        Ok(())
    }

    /// The outer error means the run has not arrived; the inner one is the
    /// run's own failure.
    fn receive(&mut self, run: u64) -> Result<Result<MiniBatch>> {
        if let Some(result) = self.reorder.remove(&run) {
            return Ok(result);
        }
        let timeout = self.config.timeout;
        let running = self
            .running
            .as_ref()
            .ok_or_else(|| anyhow!("Pipeline has no workers"))?;
        loop {
            match running.pool.output_rx.recv_timeout(timeout) {
                Ok((done, result)) if done == run => return Ok(result),
                Ok((done, result)) => {
                    self.reorder.insert(done, result);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(anyhow!("Pipeline run {} not ready after {:?}", run, timeout))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("Pipeline workers exited before run {}", run))
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PostProcess {
    fp16: bool,
    nhwc: bool,
    pad: bool,
}

impl PostProcess {
    fn apply(self, images: Tensor) -> Tensor {
        let images = if self.pad {
            let size = images.size();
            let zeros = Tensor::zeros([size[0], 1, size[2], size[3]], (images.kind(), images.device()));
            Tensor::cat(&[images, zeros], 1)
        } else {
            images
        };
        let images = if self.nhwc {
            images.permute([0, 2, 3, 1]).contiguous()
        } else {
            images
        };
        if self.fp16 {
            images.to_kind(Kind::Half)
        } else {
            images
        }
    }
}

fn run_batch<D: Dataset + ?Sized>(dataset: &D, items: &[(usize, usize)], seed: u64, post: PostProcess) -> Result<MiniBatch> {
    let samples = items
        .iter()
        .map(|&(index, pass)| {
            let mut rng = sample_rng(seed, pass, index);
            dataset
                .get(index, &mut rng)
                .with_context(|| format!("Failed to load sample {}", index))
        })
        .collect::<Result<Vec<_>>>()?;
    StackCollator
        .collate(&samples)?
        .map_feature(keys::IMAGE, |images| Ok(post.apply(images)))
}
