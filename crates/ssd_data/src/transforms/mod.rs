pub mod core;
pub mod detection;
pub mod vision;

pub use self::core::{Chain, Transform};
pub use self::detection::{build_transform, Annotated, Mode, OnImage, SsdTransform};
