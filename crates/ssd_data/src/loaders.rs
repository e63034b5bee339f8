//! Assembles the training and evaluation data sources of an SSD300 COCO run
//! from a [`DataConfig`].
//!
//! - [`train_loader`]: the train split behind the configured backend
//! - [`val_dataset`] + [`val_dataloader`]: the val split, in-process only
//! - [`coco_ground_truth`]: the val annotation index used for scoring
//!
//! Each call builds its components from scratch; nothing is cached between
//! calls.

use crate::boxes::DefaultBoxes;
use crate::collator::StackCollator;
use crate::coco::{locate, CocoDetection, CocoGroundTruth, CocoPaths, Split};
use crate::config::{DataBackend, DataConfig};
use crate::dataloader::{DataLoader, DataLoaderConfig, DataLoaderIter};
use crate::dataset::Dataset;
use crate::minibatch::MiniBatch;
use crate::pipeline::{Accelerator, CocoPipeline, CocoPipelineConfig, PipelineIterator};
use crate::sampler::{BoxedSampler, DistributedSampler, RandomSampler, SequentialSampler};
use crate::transforms::{build_transform, Mode, SsdTransform};
use anyhow::{Context, Result};
use std::sync::Arc;

/// What a sampler is for; decides shuffling on the single-process path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Train,
    Eval,
}

/// Picks the index sampler for a dataset of `dataset_len` items.
///
/// | distributed | role  | sampler                                   |
/// |-------------|-------|-------------------------------------------|
/// | no          | train | `RandomSampler`, reshuffled every epoch    |
/// | no          | eval  | `SequentialSampler`                        |
/// | yes         | any   | `DistributedSampler`, shuffled, padded     |
///
/// The distributed sampler always shuffles, evaluation included; there is no
/// switch to turn that off. It is seeded with `sampler_seed`, shared by all
/// ranks, so every rank strides the same permutation even when the
/// process-local `seed` differs per rank.
pub fn select_sampler(dataset_len: usize, config: &DataConfig, role: Role) -> Result<BoxedSampler> {
    let sampler: BoxedSampler = if config.distributed {
        Box::new(DistributedSampler::new(
            dataset_len,
            config.n_gpu,
            config.local_rank,
            true,
            false,
            config.sampler_seed,
        )?)
    } else {
        match role {
            Role::Train => Box::new(RandomSampler::new(dataset_len, false, None, config.seed)?),
            Role::Eval => Box::new(SequentialSampler::new(dataset_len)),
        }
    };
    tracing::debug!(
        dataset_len,
        distributed = config.distributed,
        ?role,
        per_epoch = sampler.len(),
        "Selected sampler"
    );
    Ok(sampler)
}

fn loader_config(config: &DataConfig, batch_size: usize) -> DataLoaderConfig {
    DataLoaderConfig::builder(config.seed)
        .batch_size(batch_size)
        .num_workers(config.num_workers)
        .prefetch_factor(config.prefetch_factor)
        .pin_memory(config.pin_memory)
        .build()
}

/// Training batch source behind either backend.
pub enum TrainLoader {
    InProcess(DataLoader<CocoDetection>),
    Pipeline(PipelineIterator),
}

impl TrainLoader {
    /// Batches of the next epoch.
    ///
    /// For the pipeline backend the iterator is reset first if the previous
    /// epoch ran to completion.
    pub fn iter(&mut self) -> Result<TrainIter<'_>> {
        match self {
            TrainLoader::InProcess(loader) => Ok(TrainIter::InProcess(loader.iter()?)),
            TrainLoader::Pipeline(pipeline) => {
                if pipeline.epoch_done() {
                    pipeline.reset();
                }
                Ok(TrainIter::Pipeline(pipeline))
            }
        }
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        match self {
            TrainLoader::InProcess(loader) => loader.len(),
            TrainLoader::Pipeline(pipeline) => pipeline.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn backend(&self) -> DataBackend {
        match self {
            TrainLoader::InProcess(_) => DataBackend::InProcess,
            TrainLoader::Pipeline(pipeline) => DataBackend::Pipeline(pipeline.accelerator()),
        }
    }
}

/// One epoch of a [`TrainLoader`].
pub enum TrainIter<'a> {
    InProcess(DataLoaderIter<'a, CocoDetection, StackCollator>),
    Pipeline(&'a mut PipelineIterator),
}

impl Iterator for TrainIter<'_> {
    type Item = Result<MiniBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            TrainIter::InProcess(iter) => iter.next(),
            TrainIter::Pipeline(iter) => iter.next(),
        }
    }
}

/// Builds the training batch source for the configured backend.
///
/// # Errors
/// - [`DataError::NotFound`](crate::error::DataError::NotFound) /
///   [`DataError::MalformedAnnotation`](crate::error::DataError::MalformedAnnotation)
///   for the train annotation file
/// - [`DataError::DeviceUnavailable`](crate::error::DataError::DeviceUnavailable)
///   for a GPU pipeline without that device
pub fn train_loader(config: &DataConfig) -> Result<TrainLoader> {
    config.validate()?;
    let paths = locate(&config.data, Split::Train);

    match config.data_backend {
        DataBackend::InProcess => {
            let (_dboxes, transform) = build_transform(Mode::Train)?;
            let dataset = CocoDetection::new(&paths.image_dir, &paths.annotation_file, transform)
                .context("Failed to build COCO train dataset")?;
            let sampler = select_sampler(dataset.len(), config, Role::Train)?;
            let loader = DataLoader::with_sampler(
                Arc::new(dataset),
                sampler,
                loader_config(config, config.batch_size),
            )?;
            tracing::info!(batches = loader.len(), backend = %config.data_backend, "Built train loader");
            Ok(TrainLoader::InProcess(loader))
        }
        DataBackend::Pipeline(accelerator) => {
            let dboxes = Arc::new(DefaultBoxes::ssd300_coco()?);
            let pipeline = pipeline_iterator(config, &paths, dboxes, accelerator)?;
            tracing::info!(
                batches = pipeline.len(),
                epoch_size = pipeline.size(),
                backend = %config.data_backend,
                "Built train loader"
            );
            Ok(TrainLoader::Pipeline(pipeline))
        }
    }
}

/// Builds, warms up and wraps the COCO pipeline. Both accelerators share
/// this construction; only the iterator's output target differs.
fn pipeline_iterator(
    config: &DataConfig,
    paths: &CocoPaths,
    dboxes: Arc<DefaultBoxes>,
    accelerator: Accelerator,
) -> Result<PipelineIterator> {
    let mut pipe_config = CocoPipelineConfig::new(
        &paths.image_dir,
        &paths.annotation_file,
        dboxes,
        config.batch_size,
        config.seed,
    );
    pipe_config.device_id = config.local_rank;
    pipe_config.num_shards = config.n_gpu;
    pipe_config.output_fp16 = config.pyamp;
    pipe_config.output_nhwc = false;
    pipe_config.pad_output = false;
    pipe_config.num_threads = config.num_workers.max(1);

    let mut pipeline = CocoPipeline::new(pipe_config);
    pipeline.build().context("Failed to build COCO pipeline")?;
    pipeline.schedule_run()?;
    pipeline.share_outputs()?;
    pipeline.release_outputs()?;

    let epoch_size = config.pipeline_epoch_size.div_ceil(config.n_gpu);
    PipelineIterator::new(pipeline, epoch_size, accelerator)
}

/// Builds the evaluation dataset over `val2017` with the eval transform.
pub fn val_dataset(config: &DataConfig) -> Result<CocoDetection<SsdTransform>> {
    let paths = locate(&config.data, Split::Val);
    let (_dboxes, transform) = build_transform(Mode::Eval)?;
    CocoDetection::new(&paths.image_dir, &paths.annotation_file, transform)
        .context("Failed to build COCO val dataset")
}

/// Wraps the evaluation dataset in an in-process loader with
/// `eval_batch_size`, never shuffled except by the distributed sampler.
pub fn val_dataloader(dataset: Arc<CocoDetection>, config: &DataConfig) -> Result<DataLoader<CocoDetection>> {
    config.validate()?;
    let sampler = select_sampler(dataset.len(), config, Role::Eval)?;
    DataLoader::with_sampler(dataset, sampler, loader_config(config, config.eval_batch_size))
}

/// Loads the val annotation file into an evaluation index.
pub fn coco_ground_truth(config: &DataConfig) -> Result<CocoGroundTruth> {
    let paths = locate(&config.data, Split::Val);
    CocoGroundTruth::load(&paths.annotation_file)
}
