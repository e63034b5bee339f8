use crate::transforms::Transform;
use anyhow::{ensure, Result};
use image::{imageops, DynamicImage};
use rand::rngs::StdRng;
use rand::Rng;

// ============================================================================
// RandomHorizontalFlip
// ============================================================================

/// Flips images horizontally with probability `p`.
///
/// Detection samples use the box-aware impl on
/// [`Annotated`](crate::transforms::detection::Annotated), which mirrors the
/// boxes together with the pixels.
///
/// # Example
/// ```ignore
/// let flip = RandomHorizontalFlip::new(0.5)?; // 50% flip chance
/// let augmented = flip.apply(image, &mut rng)?;
/// ```
#[derive(Debug, Clone)]
pub struct RandomHorizontalFlip {
    p: f64,
}

impl RandomHorizontalFlip {
    pub fn new(p: f64) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&p),
            "Probability must be in [0.0, 1.0] range (got {})",
            p
        );
        Ok(Self { p })
    }

    /// Draws the flip decision for one input.
    pub(crate) fn should_flip(&self, rng: &mut StdRng) -> bool {
        rng.random_bool(self.p)
    }

    pub(crate) fn flip(img: DynamicImage) -> DynamicImage {
        match img {
            DynamicImage::ImageRgb8(mut rgb) => {
                imageops::flip_horizontal_in_place(&mut rgb);
                DynamicImage::ImageRgb8(rgb)
            }
            other => other.fliph(),
        }
    }
}

impl Transform<DynamicImage, DynamicImage> for RandomHorizontalFlip {
    fn apply(&self, img: DynamicImage, rng: &mut StdRng) -> Result<DynamicImage> {
        Ok(if self.should_flip(rng) {
            Self::flip(img)
        } else {
            img
        })
    }
}
