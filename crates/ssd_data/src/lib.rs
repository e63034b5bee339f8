pub mod boxes;
pub mod coco;
pub mod collator;
pub mod config;
pub mod dataloader;
pub mod dataset;
pub mod error;
pub mod loaders;
pub mod minibatch;
pub mod pipeline;
pub mod sample;
pub mod sampler;
pub mod transforms;

pub use boxes::DefaultBoxes;
pub use coco::{CocoDetection, CocoGroundTruth};
pub use collator::StackCollator;
pub use config::{DataBackend, DataConfig};
pub use dataloader::{DataLoader, DataLoaderConfig};
pub use dataset::Dataset;
pub use error::DataError;
pub use loaders::{
    coco_ground_truth, select_sampler, train_loader, val_dataloader, val_dataset, Role, TrainLoader,
};
pub use minibatch::MiniBatch;
pub use pipeline::{Accelerator, CocoPipeline, PipelineIterator};
pub use sample::Sample;
