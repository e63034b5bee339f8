use anyhow::{anyhow, Result};
use std::collections::HashMap;
use tch::Tensor;

/// Feature names carried by every detection sample.
pub mod keys {
    /// `[3, 300, 300]` f32, normalised RGB.
    pub const IMAGE: &str = "image";
    /// `[]` i64, the COCO image id.
    pub const IMAGE_ID: &str = "image_id";
    /// `[2]` i64, `(height, width)` of the image after cropping, before resizing.
    pub const IMAGE_SIZE: &str = "image_size";
    /// Train: `[8732, 4]` encoded xywh. Eval: `[200, 4]` ltrb, zero padded.
    pub const BBOXES: &str = "bboxes";
    /// Train: `[8732]` i64. Eval: `[200]` i64, zero padded.
    pub const LABELS: &str = "labels";
}

/// One example produced by a dataset: feature name to tensor.
///
/// A detection sample holds the transformed image together with its targets,
/// e.g. `{"image": [3, 300, 300], "image_id": [], "image_size": [2],
/// "bboxes": [8732, 4], "labels": [8732]}`. See [`keys`] for the names.
#[derive(Debug)]
pub struct Sample {
    pub features: HashMap<String, Tensor>,
}

/// Shallow clone: the copies share tensor storage.
impl Clone for Sample {
    fn clone(&self) -> Self {
        let features = self
            .features
            .iter()
            .map(|(k, v)| (k.clone(), v.shallow_clone()))
            .collect();
        Self { features }
    }
}

// Safety: `tch::Tensor` is `Send` and `Sync`, and a `Sample` only mutates its
// map through `&mut self`, so shared references give read-only access.
unsafe impl Send for Sample {}
unsafe impl Sync for Sample {}

impl Sample {
    pub fn new(features: HashMap<String, Tensor>) -> Self {
        Self { features }
    }

    /// Creates a `Sample` from a single `(feature_name, tensor)` pair.
    /// Chain with [`with_feature`](Self::with_feature) to add more features.
    pub fn from_single(name: impl Into<String>, tensor: Tensor) -> Self {
        Self {
            features: HashMap::from([(name.into(), tensor)]),
        }
    }

    /// Adds or overwrites a feature.
    pub fn with_feature(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.features.insert(name.into(), tensor);
        self
    }

    pub fn get(&self, feature: &str) -> Result<&Tensor> {
        self.features
            .get(feature)
            .ok_or_else(|| anyhow!("Feature '{}' not found in sample", feature))
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }

    /// Applies `f` to every tensor, keeping the feature names.
    pub fn map_tensors(self, f: impl Fn(Tensor) -> Tensor) -> Self {
        Self {
            features: self.features.into_iter().map(|(k, v)| (k, f(v))).collect(),
        }
    }
}
