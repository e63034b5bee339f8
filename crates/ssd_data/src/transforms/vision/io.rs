use crate::error::DataError;
use crate::transforms::Transform;
use anyhow::{Context, Result};
use image::{DynamicImage, ImageReader};
use rand::rngs::StdRng;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

// ============================================================================
// LoadImage
// ============================================================================

/// Loads an image file from disk and decodes it to RGB8.
///
/// With the `turbojpeg` feature, `.jpg`/`.jpeg` files are decoded through
/// libjpeg-turbo first and fall back to the `image` decoder on failure.
/// A missing file is reported as [`DataError::NotFound`].
///
/// # Example
/// ```ignore
/// let image = LoadImage::new().load(Path::new("train2017/000000000139.jpg"))?;
/// ```
#[derive(Debug, Clone)]
pub struct LoadImage {
    buffer_size: usize,
}

impl Default for LoadImage {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadImage {
    /// Creates a new image loader with an 8KB read buffer.
    pub fn new() -> Self {
        Self { buffer_size: 8192 }
    }

    pub fn load(&self, path: &Path) -> Result<DynamicImage> {
        let bytes = self.read_bytes(path)?;

        #[cfg(feature = "turbojpeg")]
        if Self::is_jpeg_file(path) {
            match Self::decode_turbojpeg(&bytes) {
                Ok(image) => return Ok(image),
                Err(turbo_error) => tracing::warn!(
                    path = %path.display(),
                    error = %turbo_error,
                    "TurboJPEG failed, falling back to standard decoder"
                ),
            }
        }

        let image = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .with_context(|| format!("Failed to detect image format: {}", path.display()))?
            .decode()
            .with_context(|| format!("Failed to decode image: {}", path.display()))?;

        Ok(match image {
            DynamicImage::ImageRgb8(_) => image,
            other => DynamicImage::ImageRgb8(other.to_rgb8()),
        })
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let file = File::open(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                anyhow::Error::from(DataError::NotFound {
                    path: path.to_path_buf(),
                    source,
                })
            } else {
                anyhow::Error::from(source)
                    .context(format!("Failed to open image: {}", path.display()))
            }
        })?;

        let file_size = file.metadata().map(|m| m.len() as usize).unwrap_or(0);
        let mut reader = BufReader::with_capacity(self.buffer_size, file);
        let mut buffer = Vec::with_capacity(file_size);
        reader
            .read_to_end(&mut buffer)
            .with_context(|| format!("Failed to read image: {}", path.display()))?;
        Ok(buffer)
    }

    #[cfg(feature = "turbojpeg")]
    fn decode_turbojpeg(bytes: &[u8]) -> Result<DynamicImage> {
        use turbojpeg::{Decompressor, Image, PixelFormat};

        let mut decompressor =
            Decompressor::new().context("Failed to create TurboJPEG decompressor")?;
        let header = decompressor
            .read_header(bytes)
            .context("Failed to read JPEG header")?;
        let (width, height) = (header.width, header.height);

        let mut rgb_data = vec![0u8; width * height * 3];
        let output_image = Image {
            pixels: rgb_data.as_mut_slice(),
            width,
            height,
            format: PixelFormat::RGB,
            pitch: width * 3,
        };
        decompressor
            .decompress(bytes, output_image)
            .context("Failed to decompress JPEG")?;

        let rgb = image::RgbImage::from_raw(width as u32, height as u32, rgb_data)
            .ok_or_else(|| anyhow::anyhow!("TurboJPEG produced a buffer of the wrong size"))?;
        Ok(DynamicImage::ImageRgb8(rgb))
    }

    #[cfg(feature = "turbojpeg")]
    fn is_jpeg_file(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|extension| matches!(extension.to_lowercase().as_str(), "jpg" | "jpeg"))
    }
}

impl Transform<PathBuf, DynamicImage> for LoadImage {
    fn apply(&self, path: PathBuf, _rng: &mut StdRng) -> Result<DynamicImage> {
        self.load(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use rand::SeedableRng;

    #[test]
    fn test_load_png_as_rgb() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pixel.png");
        let mut img = RgbImage::new(4, 3);
        img.put_pixel(1, 2, Rgb([10, 20, 30]));
        img.save(&path)?;

        let loaded = LoadImage::new().apply(path, &mut StdRng::seed_from_u64(0))?;
        assert_eq!(loaded.dimensions(), (4, 3));
        assert_eq!(loaded.to_rgb8().get_pixel(1, 2), &Rgb([10, 20, 30]));
        Ok(())
    }

    #[test]
    fn test_grayscale_is_promoted_to_rgb() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("gray.png");
        image::GrayImage::from_pixel(2, 2, image::Luma([77])).save(&path)?;

        let loaded = LoadImage::new().load(&path)?;
        assert!(matches!(loaded, DynamicImage::ImageRgb8(_)));
        Ok(())
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = LoadImage::new()
            .load(Path::new("/definitely/not/here.jpg"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::NotFound { .. })
        ));
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image")?;
        assert!(LoadImage::new().load(&path).is_err());
        Ok(())
    }
}
