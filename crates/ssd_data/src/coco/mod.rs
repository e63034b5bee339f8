//! src/coco/mod.rs
//!
//! COCO 2017 detection data: directory layout, annotation parsing, the
//! training/validation dataset and the ground-truth index used for scoring.

pub mod annotations;
pub mod dataset;
pub mod ground_truth;
pub mod paths;

pub use annotations::{CocoAnnotation, CocoCategory, CocoFile, CocoImage};
pub use dataset::CocoDetection;
pub use ground_truth::CocoGroundTruth;
pub use paths::{locate, CocoPaths, Split};
