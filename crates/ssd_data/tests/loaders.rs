//! End-to-end loader assembly over a synthetic COCO tree.
//!
//! Tests cover:
//! - Locating the split files and filtering images without usable boxes
//! - Train and eval sample shapes through the in-process loader
//! - Sampler selection, including disjoint distributed shards
//! - Declared error kinds for missing or broken inputs
//! - The evaluation ground-truth index

mod common;
use common::{collect_i64, CocoFixture, CATEGORIES};

use ssd_data::{
    coco::{locate, Split},
    coco_ground_truth,
    dataset::Dataset,
    sample::keys,
    sampler::Sampler,
    select_sampler, train_loader, val_dataloader, val_dataset, DataBackend, DataConfig, DataError,
    MiniBatch, Role,
};

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

const TRAIN_IMAGES: usize = 6;
const VAL_IMAGES: usize = 5;

fn fixture() -> Result<CocoFixture> {
    CocoFixture::new(TRAIN_IMAGES, VAL_IMAGES)
}

fn declared(err: &anyhow::Error) -> Option<&DataError> {
    err.downcast_ref::<DataError>()
}

// ============================================================================
// 1. Locator and dataset
// ============================================================================

#[test]
fn test_locate_matches_fixture_layout() -> Result<()> {
    let coco = fixture()?;
    for (split, name) in [(Split::Train, "train"), (Split::Val, "val")] {
        let paths = locate(coco.root(), split);
        assert_eq!(paths.image_dir, coco.image_dir(name));
        assert_eq!(paths.annotation_file, coco.annotation_file(name));
        assert!(paths.annotation_file.is_file());
    }
    Ok(())
}

#[test]
fn test_val_dataset_skips_images_without_boxes() -> Result<()> {
    let coco = fixture()?;
    let config = DataConfig::builder(coco.root(), 0).build()?;
    let dataset = val_dataset(&config)?;

    assert_eq!(dataset.len(), VAL_IMAGES);
    assert_eq!(dataset.num_classes(), CATEGORIES.len());
    let ids: Vec<i64> = dataset.image_ids().collect();
    assert_eq!(ids, (5_000..5_000 + VAL_IMAGES as i64).collect::<Vec<_>>());

    // Contiguous labels follow category order, 0 is background.
    assert_eq!(dataset.label(18), Some(2));
    assert_eq!(dataset.category_id(3), Some(64));
    assert_eq!(dataset.label_name(0), Some("background"));
    Ok(())
}

// ============================================================================
// 2. Batches
// ============================================================================

#[test]
fn test_train_batches_carry_encoded_targets() -> Result<()> {
    let coco = fixture()?;
    let config = DataConfig::builder(coco.root(), 11)
        .batch_size(4)
        .num_workers(2)
        .build()?;
    let mut loader = train_loader(&config)?;
    assert_eq!(loader.backend(), DataBackend::InProcess);
    assert_eq!(loader.len(), 2);

    let batches: Vec<MiniBatch> = loader.iter()?.collect::<Result<_>>()?;
    assert_eq!(batches.len(), 2);

    let first = &batches[0];
    assert_eq!(first.get(keys::IMAGE)?.size(), &[4, 3, 300, 300]);
    assert_eq!(first.get(keys::BBOXES)?.size(), &[4, 8732, 4]);
    assert_eq!(first.get(keys::LABELS)?.size(), &[4, 8732]);
    assert_eq!(batches[1].batch_size()?, 2);

    let ids: HashSet<i64> = collect_i64(&batches, keys::IMAGE_ID)?.into_iter().collect();
    assert_eq!(ids, (1_000..1_000 + TRAIN_IMAGES as i64).collect());
    Ok(())
}

#[test]
fn test_val_batches_are_padded_and_ordered() -> Result<()> {
    let coco = fixture()?;
    let config = DataConfig::builder(coco.root(), 0).eval_batch_size(2).build()?;
    let loader = val_dataloader(Arc::new(val_dataset(&config)?), &config)?;
    assert_eq!(loader.len(), 3);

    let batches: Vec<MiniBatch> = loader.iter()?.collect::<Result<_>>()?;
    let first = &batches[0];
    assert_eq!(first.get(keys::IMAGE)?.size(), &[2, 3, 300, 300]);
    assert_eq!(first.get(keys::BBOXES)?.size(), &[2, 200, 4]);
    assert_eq!(first.get(keys::LABELS)?.size(), &[2, 200]);

    assert_eq!(
        collect_i64(&batches, keys::IMAGE_ID)?,
        (5_000..5_000 + VAL_IMAGES as i64).collect::<Vec<_>>()
    );

    // Image 5000 has one box of category 1 and one crowd box of category 1.
    let labels: Vec<i64> = Vec::<i64>::try_from(&first.get(keys::LABELS)?.get(0))?;
    assert_eq!(&labels[..3], &[1, 1, 0]);
    Ok(())
}

// ============================================================================
// 3. Sampler selection
// ============================================================================

#[test]
fn test_select_sampler_by_role() -> Result<()> {
    let config = DataConfig::builder("/unused", 3).build()?;

    let eval = select_sampler(7, &config, Role::Eval)?;
    assert_eq!(eval.iter(0).collect::<Vec<_>>(), (0..7).collect::<Vec<_>>());

    let train = select_sampler(7, &config, Role::Train)?;
    let mut epoch0: Vec<usize> = train.iter(0).collect();
    assert_ne!(epoch0, train.iter(1).collect::<Vec<_>>());
    epoch0.sort_unstable();
    assert_eq!(epoch0, (0..7).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_distributed_sampler_shuffles_even_for_eval() -> Result<()> {
    let config = DataConfig::builder("/unused", 3)
        .distributed(true)
        .shard(1, 2)
        .build()?;
    let sampler = select_sampler(9, &config, Role::Eval)?;
    assert_eq!(sampler.len(), 5);

    let sequential: Vec<usize> = (1..9).step_by(2).chain([0]).collect();
    let drawn: Vec<usize> = sampler.iter(0).collect();
    assert_eq!(drawn.len(), 5);
    assert_ne!(drawn, sequential);
    Ok(())
}

#[test]
fn test_rank_local_seeds_still_partition_indices() -> Result<()> {
    let ranks = 2;
    let mut seen = Vec::new();
    for rank in 0..ranks {
        let config = DataConfig::builder("/unused", 42 + rank as u64)
            .distributed(true)
            .shard(rank, ranks)
            .build()?;
        let sampler = select_sampler(20, &config, Role::Train)?;
        for epoch in 0..3 {
            seen.push((epoch, rank, sampler.iter(epoch).collect::<HashSet<_>>()));
        }
    }

    for epoch in 0..3 {
        let shards: Vec<&HashSet<usize>> = seen
            .iter()
            .filter(|(e, _, _)| *e == epoch)
            .map(|(_, _, s)| s)
            .collect();
        assert!(shards[0].is_disjoint(shards[1]), "epoch {}", epoch);
        let all: HashSet<usize> = shards[0].union(shards[1]).copied().collect();
        assert_eq!(all, (0..20).collect(), "epoch {}", epoch);
    }
    Ok(())
}

#[test]
fn test_distributed_train_shards_are_disjoint() -> Result<()> {
    let coco = fixture()?;
    let mut shards = Vec::new();
    for rank in 0..2 {
        // Each rank derives its own process seed.
        let config = DataConfig::builder(coco.root(), 21 + rank as u64)
            .distributed(true)
            .shard(rank, 2)
            .batch_size(TRAIN_IMAGES / 2)
            .build()?;
        let mut loader = train_loader(&config)?;
        assert_eq!(loader.len(), 1);
        let batches: Vec<MiniBatch> = loader.iter()?.collect::<Result<_>>()?;
        shards.push(collect_i64(&batches, keys::IMAGE_ID)?.into_iter().collect::<HashSet<_>>());
    }

    assert!(shards[0].is_disjoint(&shards[1]));
    let all: HashSet<i64> = shards[0].union(&shards[1]).copied().collect();
    assert_eq!(all, (1_000..1_000 + TRAIN_IMAGES as i64).collect());
    Ok(())
}

// ============================================================================
// 4. Errors
// ============================================================================

#[test]
fn test_missing_annotations_are_not_found() -> Result<()> {
    let empty = tempfile::tempdir()?;
    let config = DataConfig::builder(empty.path(), 0).build()?;

    let err = train_loader(&config).err().expect("no annotations");
    assert!(matches!(declared(&err), Some(DataError::NotFound { .. })), "{:#}", err);

    let err = val_dataset(&config).unwrap_err();
    assert!(matches!(declared(&err), Some(DataError::NotFound { .. })));

    let err = coco_ground_truth(&config).unwrap_err();
    assert!(matches!(declared(&err), Some(DataError::NotFound { .. })));
    Ok(())
}

#[test]
fn test_broken_annotations_are_malformed() -> Result<()> {
    let coco = fixture()?;
    std::fs::write(coco.annotation_file("train"), b"{\"images\": [")?;
    let config = DataConfig::builder(coco.root(), 0).build()?;

    let err = train_loader(&config).err().expect("truncated json");
    assert!(matches!(
        declared(&err),
        Some(DataError::MalformedAnnotation { .. })
    ));
    Ok(())
}

#[test]
fn test_unknown_backend_is_unsupported() {
    let err = DataConfig::from_json(
        r#"{"data": "/coco", "data_backend": "tensorflow",
            "batch_size": 2, "eval_batch_size": 2, "seed": 0}"#,
    )
    .unwrap_err();
    assert!(matches!(declared(&err), Some(DataError::UnsupportedBackend(name)) if name == "tensorflow"));
}

#[test]
fn test_missing_image_fails_its_batch_only() -> Result<()> {
    let coco = fixture()?;
    std::fs::remove_file(coco.image_dir("val").join(format!("{:012}.jpg", 5_002)))?;
    let config = DataConfig::builder(coco.root(), 0).eval_batch_size(1).build()?;
    let loader = val_dataloader(Arc::new(val_dataset(&config)?), &config)?;

    let results: Vec<Result<MiniBatch>> = loader.iter()?.collect();
    assert_eq!(results.len(), VAL_IMAGES);
    let failed: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_err())
        .map(|(i, _)| i)
        .collect();
    assert_eq!(failed, vec![2]);
    Ok(())
}

// ============================================================================
// 5. Ground truth
// ============================================================================

#[test]
fn test_ground_truth_indexes_every_record() -> Result<()> {
    let coco = fixture()?;
    let config = DataConfig::builder(coco.root(), 0).build()?;
    let gt = coco_ground_truth(&config)?;

    // The excluded images stay in the evaluation index.
    assert_eq!(gt.num_images(), VAL_IMAGES + 2);
    assert_eq!(gt.num_annotations(), VAL_IMAGES + VAL_IMAGES.div_ceil(2) + 1);
    assert_eq!(gt.num_categories(), CATEGORIES.len());
    assert_eq!(gt.path(), coco.annotation_file("val").as_path());

    let crowd = gt.annotation_ids(&[5_000], &[], Some(true));
    assert_eq!(crowd.len(), 1);
    let dogs = gt.image_ids_for_category(18);
    assert!(dogs.contains(&5_001));
    Ok(())
}
