//! Serde model of a COCO `instances_*.json` file. Only the fields the
//! detection pipeline and evaluation need are modelled; everything else
//! (segmentation polygons, licenses, captions) is skipped on parse.

use crate::error::DataError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CocoImage {
    pub id: i64,
    pub file_name: String,
    pub height: u32,
    pub width: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CocoAnnotation {
    pub id: i64,
    pub image_id: i64,
    pub category_id: i64,
    /// `[x, y, width, height]` in pixels.
    pub bbox: [f64; 4],
    #[serde(default)]
    pub area: f64,
    #[serde(default)]
    pub iscrowd: u8,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CocoCategory {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub supercategory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct CocoFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<serde_json::Value>,
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    #[serde(default)]
    pub categories: Vec<CocoCategory>,
}

impl CocoFile {
    /// Parses an annotation file.
    ///
    /// A missing file is [`DataError::NotFound`]; unreadable or invalid JSON
    /// is [`DataError::MalformedAnnotation`].
    pub fn load(path: &Path) -> Result<Self, DataError> {
        let file = File::open(path).map_err(|e| DataError::from_io(path, e))?;
        let parsed: CocoFile = serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            DataError::MalformedAnnotation {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        tracing::debug!(
            path = %path.display(),
            images = parsed.images.len(),
            annotations = parsed.annotations.len(),
            categories = parsed.categories.len(),
            "Parsed COCO annotations"
        );
        Ok(parsed)
    }
}
