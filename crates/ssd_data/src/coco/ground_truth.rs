use crate::coco::annotations::{CocoAnnotation, CocoCategory, CocoFile, CocoImage};
use crate::error::DataError;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// In-memory index over a COCO annotation file, used to score detections.
///
/// Images, annotations and categories keep their file order; lookups go
/// through id maps built once at load time.
#[derive(Debug, Clone)]
pub struct CocoGroundTruth {
    path: PathBuf,
    images: Vec<CocoImage>,
    annotations: Vec<CocoAnnotation>,
    categories: Vec<CocoCategory>,
    image_pos: HashMap<i64, usize>,
    annotation_pos: HashMap<i64, usize>,
    category_pos: HashMap<i64, usize>,
    image_to_annotations: HashMap<i64, Vec<usize>>,
    category_to_images: HashMap<i64, Vec<i64>>,
}

impl CocoGroundTruth {
    /// Loads and indexes `path`.
    ///
    /// # Errors
    /// [`DataError::NotFound`] for a missing file, and
    /// [`DataError::MalformedAnnotation`] for invalid JSON or repeated ids.
    pub fn load(path: &Path) -> Result<Self> {
        let coco = CocoFile::load(path)?;
        Self::from_parsed(path, coco)
    }

    pub fn from_parsed(path: &Path, coco: CocoFile) -> Result<Self> {
        let duplicate = |what: &str, id: i64| DataError::MalformedAnnotation {
            path: path.to_path_buf(),
            reason: format!("duplicate {} id {}", what, id),
        };

        let mut image_pos = HashMap::with_capacity(coco.images.len());
        for (pos, image) in coco.images.iter().enumerate() {
            if image_pos.insert(image.id, pos).is_some() {
                return Err(duplicate("image", image.id).into());
            }
        }
        let mut category_pos = HashMap::with_capacity(coco.categories.len());
        for (pos, category) in coco.categories.iter().enumerate() {
            if category_pos.insert(category.id, pos).is_some() {
                return Err(duplicate("category", category.id).into());
            }
        }

        let mut annotation_pos = HashMap::with_capacity(coco.annotations.len());
        let mut image_to_annotations: HashMap<i64, Vec<usize>> = HashMap::new();
        let mut category_to_images: HashMap<i64, Vec<i64>> = HashMap::new();
        for (pos, annotation) in coco.annotations.iter().enumerate() {
            if annotation_pos.insert(annotation.id, pos).is_some() {
                return Err(duplicate("annotation", annotation.id).into());
            }
            image_to_annotations
                .entry(annotation.image_id)
                .or_default()
                .push(pos);
            let images = category_to_images.entry(annotation.category_id).or_default();
            if !images.contains(&annotation.image_id) {
                images.push(annotation.image_id);
            }
        }

        tracing::info!(
            path = %path.display(),
            images = coco.images.len(),
            annotations = coco.annotations.len(),
            categories = coco.categories.len(),
            "Loaded COCO ground truth"
        );

        Ok(Self {
            path: path.to_path_buf(),
            images: coco.images,
            annotations: coco.annotations,
            categories: coco.categories,
            image_pos,
            annotation_pos,
            category_pos,
            image_to_annotations,
            category_to_images,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_images(&self) -> usize {
        self.images.len()
    }

    pub fn num_annotations(&self) -> usize {
        self.annotations.len()
    }

    pub fn num_categories(&self) -> usize {
        self.categories.len()
    }

    /// All image ids, in file order.
    pub fn image_ids(&self) -> Vec<i64> {
        self.images.iter().map(|image| image.id).collect()
    }

    /// All category ids, in file order.
    pub fn category_ids(&self) -> Vec<i64> {
        self.categories.iter().map(|category| category.id).collect()
    }

    /// Ids of the annotations matching every given filter.
    ///
    /// # Arguments:
    /// - `image_ids`: keep annotations of these images; empty keeps all
    /// - `category_ids`: keep annotations of these categories; empty keeps all
    /// - `iscrowd`: keep only crowd (`Some(true)`) or non-crowd (`Some(false)`) regions
    pub fn annotation_ids(&self, image_ids: &[i64], category_ids: &[i64], iscrowd: Option<bool>) -> Vec<i64> {
        let candidates: Box<dyn Iterator<Item = &CocoAnnotation>> = if image_ids.is_empty() {
            Box::new(self.annotations.iter())
        } else {
            Box::new(
                image_ids
                    .iter()
                    .filter_map(|id| self.image_to_annotations.get(id))
                    .flatten()
                    .map(|&pos| &self.annotations[pos]),
            )
        };

        candidates
            .filter(|a| category_ids.is_empty() || category_ids.contains(&a.category_id))
            .filter(|a| iscrowd.map_or(true, |crowd| (a.iscrowd != 0) == crowd))
            .map(|a| a.id)
            .collect()
    }

    /// Ids of the images with at least one annotation of `category_id`.
    pub fn image_ids_for_category(&self, category_id: i64) -> Vec<i64> {
        self.category_to_images
            .get(&category_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn annotations(&self, ids: &[i64]) -> Result<Vec<&CocoAnnotation>> {
        Self::lookup(ids, &self.annotation_pos, &self.annotations, "annotation")
    }

    pub fn images(&self, ids: &[i64]) -> Result<Vec<&CocoImage>> {
        Self::lookup(ids, &self.image_pos, &self.images, "image")
    }

    pub fn categories(&self, ids: &[i64]) -> Result<Vec<&CocoCategory>> {
        Self::lookup(ids, &self.category_pos, &self.categories, "category")
    }

    fn lookup<'a, V>(ids: &[i64], pos: &HashMap<i64, usize>, values: &'a [V], what: &str) -> Result<Vec<&'a V>> {
        ids.iter()
            .map(|id| {
                pos.get(id)
                    .map(|&p| &values[p])
                    .ok_or_else(|| anyhow!("Unknown {} id {}", what, id))
            })
            .collect()
    }
}
