use crate::transforms::Transform;
use anyhow::{ensure, Result};
use image::{imageops::FilterType, DynamicImage};
use rand::rngs::StdRng;

// ============================================================================
// Resize
// ============================================================================

/// Resizes an image to exactly `width × height`, ignoring the aspect ratio.
///
/// SSD targets are normalised to `[0, 1]`, so stretching the image does not
/// invalidate them.
///
/// # Filter Types
/// - `Nearest`: Nearest neighbour, fastest
/// - `Triangle`: Bilinear filter, the SSD default
/// - `CatmullRom`: Bicubic sharpening
/// - `Lanczos3`: Highest quality, slowest
#[derive(Debug, Clone)]
pub struct Resize {
    width: u32,
    height: u32,
    filter: FilterType,
}

impl Resize {
    pub fn new(width: u32, height: u32, filter: FilterType) -> Result<Self> {
        ensure!(
            width > 0 && height > 0,
            "Image dimensions must be positive after resizing (got {}x{})",
            width,
            height
        );
        Ok(Self {
            width,
            height,
            filter,
        })
    }

    /// Square bilinear resize, as used for SSD inputs.
    pub fn square(size: u32) -> Result<Self> {
        Self::new(size, size, FilterType::Triangle)
    }
}

impl Transform<DynamicImage, DynamicImage> for Resize {
    fn apply(&self, img: DynamicImage, _rng: &mut StdRng) -> Result<DynamicImage> {
        if (img.width(), img.height()) == (self.width, self.height) {
            return Ok(img);
        }
        Ok(img.resize_exact(self.width, self.height, self.filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use rand::SeedableRng;

    fn test_gradient_image(width: u32, height: u32) -> DynamicImage {
        let mut img = RgbImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let r = (x * 255 / width) as u8;
                let g = (y * 255 / height) as u8;
                img.put_pixel(x, y, Rgb([r, g, 128]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_resize_ignores_aspect_ratio() -> Result<()> {
        let img = test_gradient_image(120, 40);
        let resized = Resize::square(30)?.apply(img, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(resized.dimensions(), (30, 30));
        Ok(())
    }

    #[test]
    fn test_resize_rejects_zero_size() {
        assert!(Resize::new(0, 300, FilterType::Triangle).is_err());
    }
}
