use crate::transforms::Transform;
use anyhow::{ensure, Context, Result};
use image::{DynamicImage, RgbImage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use tch::Tensor;

// ============================================================================
// ColorJitter
// ============================================================================

/// Randomly changes brightness, contrast, saturation and hue.
///
/// Each strength `s` turns into a factor drawn from `[max(0, 1 - s), 1 + s]`
/// (hue: a shift drawn from `[-s, s]`, in turns of the colour wheel). The four
/// adjustments run in a random order per call, and the result is clamped to
/// the valid pixel range after every step.
///
/// # Example
/// ```ignore
/// // SSD training settings
/// let jitter = ColorJitter::new(0.125, 0.5, 0.5, 0.05)?;
/// ```
#[derive(Debug, Clone)]
pub struct ColorJitter {
    brightness: f32,
    contrast: f32,
    saturation: f32,
    hue: f32,
}

#[derive(Debug, Clone, Copy)]
enum Adjustment {
    Brightness,
    Contrast,
    Saturation,
    Hue,
}

impl ColorJitter {
    pub fn new(brightness: f32, contrast: f32, saturation: f32, hue: f32) -> Result<Self> {
        ensure!(
            brightness >= 0.0 && contrast >= 0.0 && saturation >= 0.0,
            "Jitter strengths must be non-negative (got brightness={}, contrast={}, saturation={})",
            brightness,
            contrast,
            saturation
        );
        ensure!(
            (0.0..=0.5).contains(&hue),
            "Hue jitter must be in [0.0, 0.5] (got {})",
            hue
        );
        Ok(Self {
            brightness,
            contrast,
            saturation,
            hue,
        })
    }

    /// The jitter used by SSD training.
    pub fn ssd() -> Self {
        Self {
            brightness: 0.125,
            contrast: 0.5,
            saturation: 0.5,
            hue: 0.05,
        }
    }

    fn draw_factor(strength: f32, rng: &mut StdRng) -> Option<f32> {
        (strength > 0.0).then(|| rng.random_range((1.0 - strength).max(0.0)..=1.0 + strength))
    }

    fn jitter(&self, img: RgbImage, rng: &mut StdRng) -> RgbImage {
        let mut order = [
            Adjustment::Brightness,
            Adjustment::Contrast,
            Adjustment::Saturation,
            Adjustment::Hue,
        ];
        order.shuffle(rng);

        let (width, height) = img.dimensions();
        let mut pixels: Vec<[f32; 3]> = img
            .pixels()
            .map(|p| p.0.map(|c| c as f32 / 255.0))
            .collect();

        for adjustment in order {
            match adjustment {
                Adjustment::Brightness => {
                    if let Some(factor) = Self::draw_factor(self.brightness, rng) {
                        for px in pixels.iter_mut() {
                            *px = px.map(|c| (c * factor).clamp(0.0, 1.0));
                        }
                    }
                }
                Adjustment::Contrast => {
                    if let Some(factor) = Self::draw_factor(self.contrast, rng) {
                        let mean = pixels.iter().map(luma).sum::<f32>() / pixels.len().max(1) as f32;
                        for px in pixels.iter_mut() {
                            *px = px.map(|c| blend(c, mean, factor));
                        }
                    }
                }
                Adjustment::Saturation => {
                    if let Some(factor) = Self::draw_factor(self.saturation, rng) {
                        for px in pixels.iter_mut() {
                            let gray = luma(px);
                            *px = px.map(|c| blend(c, gray, factor));
                        }
                    }
                }
                Adjustment::Hue => {
                    if self.hue > 0.0 {
                        let shift = rng.random_range(-self.hue..=self.hue);
                        for px in pixels.iter_mut() {
                            let [h, s, v] = rgb_to_hsv(*px);
                            *px = hsv_to_rgb([(h + shift).rem_euclid(1.0), s, v]);
                        }
                    }
                }
            }
        }

        let raw = pixels
            .into_iter()
            .flat_map(|px| px.map(|c| (c * 255.0).round() as u8))
            .collect();
        RgbImage::from_raw(width, height, raw).unwrap_or_else(|| RgbImage::new(width, height))
    }
}

impl Transform<DynamicImage, DynamicImage> for ColorJitter {
    fn apply(&self, img: DynamicImage, rng: &mut StdRng) -> Result<DynamicImage> {
        let rgb = match img {
            DynamicImage::ImageRgb8(rgb) => rgb,
            other => other.to_rgb8(),
        };
        Ok(DynamicImage::ImageRgb8(self.jitter(rgb, rng)))
    }
}

fn luma(px: &[f32; 3]) -> f32 {
    0.299 * px[0] + 0.587 * px[1] + 0.114 * px[2]
}

/// `factor * c + (1 - factor) * other`, clamped to `[0, 1]`.
fn blend(c: f32, other: f32, factor: f32) -> f32 {
    (factor * c + (1.0 - factor) * other).clamp(0.0, 1.0)
}

fn rgb_to_hsv([r, g, b]: [f32; 3]) -> [f32; 3] {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta <= f32::EPSILON {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max <= f32::EPSILON { 0.0 } else { delta / max };
    [h, s, max]
}

fn hsv_to_rgb([h, s, v]: [f32; 3]) -> [f32; 3] {
    let sector = h * 6.0;
    let i = sector.floor();
    let f = sector - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match (i as i32).rem_euclid(6) {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

// ============================================================================
// Normalize
// ============================================================================

/// Normalizes tensors using channel-wise statistics.
///
/// # Arguments:
/// - `mean`: per-channel means
/// - `std`: per-channel standard deviation.
///
/// # Mathematical Operation:
/// ```text
/// output[c,h,w] = (input[c,h,w] - mean[c]) / std[c]
/// ```
#[derive(Debug, Clone)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    pub fn new(mean: &[f32], std: &[f32]) -> Result<Self> {
        ensure!(!mean.is_empty(), "Normalization mean cannot be empty");
        ensure!(
            mean.len() == std.len(),
            "Normalization mean has {} channels but std has {}",
            mean.len(),
            std.len()
        );
        ensure!(
            std.iter().all(|&s| s > 0.0),
            "Normalization std must be positive (got {:?})",
            std
        );
        Ok(Self {
            mean: mean.to_vec(),
            std: std.to_vec(),
        })
    }

    /// ImageNet standard normalization (RGB)
    pub fn imagenet() -> Self {
        Self {
            mean: vec![0.485, 0.456, 0.406],
            std: vec![0.229, 0.224, 0.225],
        }
    }
}

impl Transform<Tensor, Tensor> for Normalize {
    fn apply(&self, tensor: Tensor, _rng: &mut StdRng) -> Result<Tensor> {
        let (num_channels, _height, _width) = tensor
            .size3()
            .context("Input must be 3D tensor [C, H, W]")?;

        ensure!(
            num_channels as usize == self.mean.len(),
            "Channel count mismatch: input has {} channels but normalization expects {}",
            num_channels,
            self.mean.len()
        );

        let mean_t = Tensor::from_slice(&self.mean)
            .reshape([num_channels, 1, 1])
            .to_kind(tensor.kind());
        let std_t = Tensor::from_slice(&self.std)
            .reshape([num_channels, 1, 1])
            .to_kind(tensor.kind());

        Ok((tensor - mean_t) / std_t)
    }
}
