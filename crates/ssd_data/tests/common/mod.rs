#![allow(dead_code)]

use ssd_data::{dataset::Dataset, error::DataError, sample::Sample};

use anyhow::Result;
use image::{Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::Rng;
use serde_json::json;
use std::path::{Path, PathBuf};
use tch::Tensor;
use tempfile::TempDir;

/// Dataset of `n` items; each sample carries its index and one draw from
/// the per-sample RNG, so tests can check both order and seeding.
pub struct IndexedNoise(pub usize);

impl Dataset for IndexedNoise {
    fn len(&self) -> usize {
        self.0
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        if index >= self.0 {
            return Err(DataError::IndexOutOfRange { index, len: self.0 }.into());
        }
        let noise: i64 = rng.random_range(0..1_000_000);
        Ok(Sample::from_single("index", Tensor::from_slice(&[index as i64]))
            .with_feature("noise", Tensor::from_slice(&[noise])))
    }
}

/// Synthetic COCO layout in a temporary directory:
///
/// ```text
/// {root}/annotations/instances_train2017.json
/// {root}/annotations/instances_val2017.json
/// {root}/train2017/*.jpg
/// {root}/val2017/*.jpg
/// ```
///
/// Every split gets `n` images with one or two valid boxes each, plus one
/// image whose only box has zero width and one image without annotations.
/// Both of those are excluded from the dataset, so `len() == n`.
pub struct CocoFixture {
    pub dir: TempDir,
}

pub const CATEGORIES: [(i64, &str); 3] = [(1, "person"), (18, "dog"), (64, "potted plant")];

impl CocoFixture {
    pub fn new(train_images: usize, val_images: usize) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("annotations"))?;
        write_split(dir.path(), "train", train_images, 1_000)?;
        write_split(dir.path(), "val", val_images, 5_000)?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn annotation_file(&self, split: &str) -> PathBuf {
        self.root()
            .join("annotations")
            .join(format!("instances_{}2017.json", split))
    }

    pub fn image_dir(&self, split: &str) -> PathBuf {
        self.root().join(format!("{}2017", split))
    }
}

fn write_split(root: &Path, split: &str, n: usize, first_id: i64) -> Result<()> {
    let image_dir = root.join(format!("{}2017", split));
    std::fs::create_dir_all(&image_dir)?;

    let mut images = Vec::new();
    let mut annotations = Vec::new();
    let mut next_ann = first_id * 10;

    // Valid images first, then the two that get excluded.
    for i in 0..n + 2 {
        let id = first_id + i as i64;
        let (width, height) = (64 + 8 * (i as u32 % 3), 48 + 4 * (i as u32 % 2));
        let file_name = format!("{:012}.jpg", id);

        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 4) as u8, (y * 5) as u8, (id % 256) as u8])
        });
        img.save(image_dir.join(&file_name))?;

        images.push(json!({"id": id, "file_name": file_name, "height": height, "width": width}));

        if i < n {
            let category = CATEGORIES[i % CATEGORIES.len()].0;
            annotations.push(json!({
                "id": next_ann, "image_id": id, "category_id": category,
                "bbox": [4.0, 6.0, 30.0, 20.0], "area": 600.0, "iscrowd": 0
            }));
            next_ann += 1;
            if i % 2 == 0 {
                annotations.push(json!({
                    "id": next_ann, "image_id": id, "category_id": CATEGORIES[0].0,
                    "bbox": [20.0, 10.0, 24.0, 30.0], "area": 720.0, "iscrowd": 1
                }));
                next_ann += 1;
            }
        } else if i == n {
            annotations.push(json!({
                "id": next_ann, "image_id": id, "category_id": CATEGORIES[1].0,
                "bbox": [10.0, 10.0, 0.0, 12.0], "area": 0.0, "iscrowd": 0
            }));
            next_ann += 1;
        }
    }

    let categories: Vec<_> = CATEGORIES
        .iter()
        .map(|(id, name)| json!({"id": id, "name": name, "supercategory": "thing"}))
        .collect();

    let file = json!({
        "info": {"description": "synthetic"},
        "images": images,
        "annotations": annotations,
        "categories": categories,
    });
    std::fs::write(
        root.join("annotations").join(format!("instances_{}2017.json", split)),
        serde_json::to_vec(&file)?,
    )?;
    Ok(())
}

/// Collects one int64 feature of every batch into a flat list.
pub fn collect_i64(batches: &[ssd_data::MiniBatch], feature: &str) -> Result<Vec<i64>> {
    let mut values = Vec::new();
    for batch in batches {
        let flat = batch.get(feature)?.flatten(0, -1);
        let chunk: Vec<i64> = Vec::<i64>::try_from(&flat)?;
        values.extend(chunk);
    }
    Ok(values)
}
