//! src/transforms/vision/mod.rs
//!
//! Image-level transforms.
//!
//! ```text
//! transforms/vision/
//! ├── geometric.rs     → Resize
//! ├── photometric.rs   → ColorJitter, Normalize
//! ├── conversion.rs    → image → tensor
//! ├── augmentation.rs  → RandomHorizontalFlip
//! └── io.rs            → LoadImage
//! ```
//!
//! ```ignore
//! use crate::transforms::Transform;
//! use crate::transforms::vision::{Resize, ToTensor, Normalize};
//!
//! let pipeline = Resize::square(300)?
//!     .then(ToTensor)
//!     .then(Normalize::imagenet());
//! let tensor = pipeline.apply(image, &mut rng)?;
//! ```

pub mod augmentation;
pub mod conversion;
pub mod geometric;
pub mod io;
pub mod photometric;

pub use augmentation::RandomHorizontalFlip;
pub use conversion::ToTensor;
pub use geometric::Resize;
pub use io::LoadImage;
pub use photometric::{ColorJitter, Normalize};
