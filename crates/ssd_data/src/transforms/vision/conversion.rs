use crate::transforms::Transform;
use anyhow::{ensure, Context, Result};
use image::{DynamicImage, GenericImageView};
use rand::rngs::StdRng;
use tch::{Kind, Tensor};

// ============================================================================
// ToTensor
// ============================================================================

/// Converts an image to a channel-first f32 tensor in `[0.0, 1.0]`.
///
/// Detection inputs are always RGB, so every colour type is converted to
/// RGB8 first and the output shape is `[3, H, W]`.
#[derive(Debug, Clone)]
pub struct ToTensor;

impl Transform<DynamicImage, Tensor> for ToTensor {
    fn apply(&self, img: DynamicImage, _rng: &mut StdRng) -> Result<Tensor> {
        let (width, height) = img.dimensions();
        ensure!(
            width > 0 && height > 0,
            "Image dimensions must be positive (got {}x{})",
            width,
            height
        );

        let rgb = match img {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => other.to_rgb8(),
        };

        // HWC bytes -> CHW floats
        Tensor::from_slice(rgb.as_raw())
            .reshape([height as i64, width as i64, 3])
            .permute([2, 0, 1])
            .to_kind(Kind::Float)
            .f_div_scalar(255.0)
            .context("Failed to scale tensor values")
    }
}
