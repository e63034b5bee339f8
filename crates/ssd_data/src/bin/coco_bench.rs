//! Smoke test for a data configuration: builds the train loader, the val
//! loader and the ground-truth index, pulls a few batches and logs their
//! shapes and throughput.

use anyhow::{Context, Result};
use clap::Parser;
use ssd_data::{
    coco_ground_truth, train_loader, val_dataloader, val_dataset, DataBackend, DataConfig, MiniBatch,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coco-bench", about = "Build SSD300 COCO loaders from a config file and time a few batches")]
struct Args {
    /// JSON data configuration.
    #[arg(long)]
    config: PathBuf,
    /// Override `data_backend` (pytorch, dali-gpu, dali-mlu).
    #[arg(long)]
    backend: Option<DataBackend>,
    /// Override `num_workers`.
    #[arg(long)]
    num_workers: Option<usize>,
    /// Train batches to pull.
    #[arg(long, default_value_t = 10)]
    batches: usize,
    /// Val batches to pull.
    #[arg(long, default_value_t = 2)]
    val_batches: usize,
    /// Skip loading the val annotation index.
    #[arg(long)]
    skip_ground_truth: bool,
}

fn describe(batch: &MiniBatch) -> String {
    let mut features: Vec<_> = batch.features().collect();
    features.sort_unstable();
    features
        .into_iter()
        .filter_map(|name| batch.get(name).ok().map(|t| format!("{}={:?}/{:?}", name, t.size(), t.kind())))
        .collect::<Vec<_>>()
        .join(" ")
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = DataConfig::open(&args.config)
        .with_context(|| format!("Failed to read config {}", args.config.display()))?;
    if let Some(backend) = args.backend {
        config.data_backend = backend;
    }
    if let Some(workers) = args.num_workers {
        config.num_workers = workers;
    }
    config.validate()?;

    let started = Instant::now();
    let mut train = train_loader(&config)?;
    tracing::info!(
        backend = %train.backend(),
        batches_per_epoch = train.len(),
        elapsed = ?started.elapsed(),
        "Train loader ready"
    );

    let started = Instant::now();
    let mut images = 0i64;
    for (i, batch) in train.iter()?.take(args.batches).enumerate() {
        let batch = batch.with_context(|| format!("Train batch {} failed", i))?;
        images += batch.batch_size()?;
        tracing::info!(batch = i, shapes = %describe(&batch), "Train batch");
    }
    let secs = started.elapsed().as_secs_f64();
    tracing::info!(images, secs, images_per_sec = images as f64 / secs.max(f64::EPSILON), "Train throughput");

    let dataset = Arc::new(val_dataset(&config)?);
    let val = val_dataloader(dataset, &config)?;
    tracing::info!(batches_per_epoch = val.len(), "Val loader ready");
    for (i, batch) in val.iter()?.take(args.val_batches).enumerate() {
        let batch = batch.with_context(|| format!("Val batch {} failed", i))?;
        tracing::info!(batch = i, shapes = %describe(&batch), "Val batch");
    }

    if !args.skip_ground_truth {
        let gt = coco_ground_truth(&config)?;
        tracing::info!(
            images = gt.num_images(),
            annotations = gt.num_annotations(),
            categories = gt.num_categories(),
            "Ground truth ready"
        );
    }
    Ok(())
}
