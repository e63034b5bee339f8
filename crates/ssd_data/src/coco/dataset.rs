use crate::boxes::BoxCoords;
use crate::coco::annotations::CocoFile;
use crate::dataset::Dataset;
use crate::error::DataError;
use crate::sample::Sample;
use crate::transforms::detection::{Annotated, SsdTransform};
use crate::transforms::vision::LoadImage;
use crate::transforms::Transform;
use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One image that has at least one usable box.
#[derive(Debug, Clone)]
struct ImageEntry {
    id: i64,
    file_name: String,
    /// `(height, width)` as annotated.
    size: (u32, u32),
    /// ltrb in pixels.
    boxes: Vec<[f64; 4]>,
    labels: Vec<i64>,
}

/// COCO detection dataset: one sample per annotated image.
///
/// Category ids are remapped to contiguous labels `1..=C` in the order the
/// categories appear in the file; `0` is background. Annotations whose width
/// or height is not positive are skipped, and images left without a box are
/// not part of the dataset. Sample order follows the file's `images` array.
///
/// The dataset is immutable after construction and is shared across worker
/// threads without locking.
#[derive(Debug)]
pub struct CocoDetection<T = SsdTransform> {
    image_dir: PathBuf,
    entries: Vec<ImageEntry>,
    label_map: HashMap<i64, i64>,
    /// `label_info[label]` is the category name; index 0 is "background".
    label_info: Vec<String>,
    /// `category_ids[label - 1]` is the original COCO category id.
    category_ids: Vec<i64>,
    loader: LoadImage,
    transform: T,
}

impl<T> CocoDetection<T>
where
    T: Transform<Annotated<DynamicImage>, Sample>,
{
    /// Parses `annotation_file` and indexes the images under `image_dir`.
    ///
    /// # Errors
    /// - [`DataError::NotFound`] if the annotation file does not exist
    /// - [`DataError::MalformedAnnotation`] if it does not parse, repeats an
    ///   image id, or refers to an unknown image or category
    pub fn new(image_dir: impl Into<PathBuf>, annotation_file: &Path, transform: T) -> Result<Self> {
        let coco = CocoFile::load(annotation_file)?;
        Self::from_parsed(image_dir, annotation_file, coco, transform)
    }

    /// Indexes an already parsed annotation file. `annotation_file` is only
    /// used in error messages.
    pub fn from_parsed(
        image_dir: impl Into<PathBuf>,
        annotation_file: &Path,
        coco: CocoFile,
        transform: T,
    ) -> Result<Self> {
        let malformed = |reason: String| DataError::MalformedAnnotation {
            path: annotation_file.to_path_buf(),
            reason,
        };

        let mut label_map = HashMap::with_capacity(coco.categories.len());
        let mut label_info = vec!["background".to_string()];
        let mut category_ids = Vec::with_capacity(coco.categories.len());
        for category in &coco.categories {
            let label = label_info.len() as i64;
            if label_map.insert(category.id, label).is_some() {
                return Err(malformed(format!("duplicate category id {}", category.id)).into());
            }
            label_info.push(category.name.clone());
            category_ids.push(category.id);
        }

        let mut entries = Vec::with_capacity(coco.images.len());
        let mut position = HashMap::with_capacity(coco.images.len());
        for image in coco.images {
            if image.width == 0 || image.height == 0 {
                return Err(malformed(format!("image {} has zero size", image.id)).into());
            }
            if position.insert(image.id, entries.len()).is_some() {
                return Err(malformed(format!("duplicate image record {}", image.id)).into());
            }
            entries.push(ImageEntry {
                id: image.id,
                file_name: image.file_name,
                size: (image.height, image.width),
                boxes: Vec::new(),
                labels: Vec::new(),
            });
        }

        let mut skipped = 0usize;
        for annotation in &coco.annotations {
            let label = *label_map.get(&annotation.category_id).ok_or_else(|| {
                malformed(format!(
                    "annotation {} refers to unknown category {}",
                    annotation.id, annotation.category_id
                ))
            })?;
            let slot = *position.get(&annotation.image_id).ok_or_else(|| {
                malformed(format!(
                    "annotation {} refers to unknown image {}",
                    annotation.id, annotation.image_id
                ))
            })?;

            let [x, y, w, h] = annotation.bbox;
            if w <= 0.0 || h <= 0.0 {
                skipped += 1;
                continue;
            }
            entries[slot].boxes.push([x, y, x + w, y + h]);
            entries[slot].labels.push(label);
        }

        let total = entries.len();
        entries.retain(|entry| !entry.boxes.is_empty());

        tracing::debug!(
            annotation_file = %annotation_file.display(),
            images = entries.len(),
            images_without_boxes = total - entries.len(),
            degenerate_boxes_skipped = skipped,
            classes = category_ids.len(),
            "Indexed COCO detection dataset"
        );

        Ok(Self {
            image_dir: image_dir.into(),
            entries,
            label_map,
            label_info,
            category_ids,
            loader: LoadImage::new(),
            transform,
        })
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    /// Loads image `index` with its normalised ltrb boxes, before any transform.
    ///
    /// Boxes are normalised by the decoded image size, which is also the
    /// reported `size`.
    pub fn annotated(&self, index: usize) -> Result<Annotated<DynamicImage>> {
        let entry = self.entry(index)?;
        let path = self.image_dir.join(&entry.file_name);
        let image = self
            .loader
            .load(&path)
            .with_context(|| format!("Failed to load COCO image {}", entry.id))?;

        let (width, height) = image.dimensions();
        if (height, width) != entry.size {
            tracing::debug!(
                image_id = entry.id,
                annotated = ?entry.size,
                decoded = ?(height, width),
                "Decoded size differs from annotation"
            );
        }
        let (wtot, htot) = (width as f64, height as f64);
        let boxes: Vec<BoxCoords> = entry
            .boxes
            .iter()
            .map(|&[l, t, r, b]| [(l / wtot) as f32, (t / htot) as f32, (r / wtot) as f32, (b / htot) as f32])
            .collect();

        Ok(Annotated {
            image,
            image_id: entry.id,
            size: (height, width),
            boxes,
            labels: entry.labels.clone(),
        })
    }
}

impl<T> CocoDetection<T> {
    fn entry(&self, index: usize) -> Result<&ImageEntry> {
        self.entries.get(index).ok_or_else(|| {
            DataError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            }
            .into()
        })
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// COCO image id of sample `index`.
    pub fn image_id(&self, index: usize) -> Result<i64> {
        Ok(self.entry(index)?.id)
    }

    /// Image ids in sample order.
    pub fn image_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    /// Number of object classes, excluding background.
    pub fn num_classes(&self) -> usize {
        self.category_ids.len()
    }

    /// Contiguous label of a COCO category id.
    pub fn label(&self, category_id: i64) -> Option<i64> {
        self.label_map.get(&category_id).copied()
    }

    /// COCO category id of a contiguous label; `None` for background.
    pub fn category_id(&self, label: i64) -> Option<i64> {
        usize::try_from(label - 1)
            .ok()
            .and_then(|slot| self.category_ids.get(slot))
            .copied()
    }

    pub fn label_name(&self, label: i64) -> Option<&str> {
        usize::try_from(label)
            .ok()
            .and_then(|slot| self.label_info.get(slot))
            .map(String::as_str)
    }
}

impl<T> Dataset for CocoDetection<T>
where
    T: Transform<Annotated<DynamicImage>, Sample>,
{
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        let annotated = self.annotated(index)?;
        let image_id = annotated.image_id;
        self.transform
            .apply(annotated, rng)
            .with_context(|| format!("Failed to transform COCO image {}", image_id))
    }
}
