//! Box-aware transforms and the SSD300 train/eval pipelines.
//!
//! An [`Annotated`] value travels through the pipeline: the image changes
//! type along the way (`DynamicImage` -> `Tensor`) while its boxes are kept
//! consistent with every geometric step. The last step turns it into a
//! [`Sample`] with fixed-size targets.

use crate::boxes::{boxes_to_tensor, iou, BoxCoords, DefaultBoxes, Encoder, DEFAULT_CRITERION};
use crate::sample::{keys, Sample};
use crate::transforms::vision::{ColorJitter, Normalize, RandomHorizontalFlip, Resize, ToTensor};
use crate::transforms::Transform;
use anyhow::{ensure, Context, Result};
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use tch::{Device, Kind, Tensor};

/// Side length of the square SSD300 input.
pub const INPUT_SIZE: u32 = 300;

/// Number of box slots in an evaluation sample.
pub const MAX_EVAL_BOXES: usize = 200;

/// Which of the two SSD pipelines to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

// =======================================================================================
// Annotated
// =======================================================================================

/// An image with its COCO id, size and ground truths.
///
/// `size` is `(height, width)` of the current image in pixels and is only
/// updated by cropping; a resize stretches the image but keeps `size`, which
/// evaluation uses to map predictions back to the cropped frame.
/// `boxes` are normalised ltrb.
#[derive(Debug, Clone)]
pub struct Annotated<I> {
    pub image: I,
    pub image_id: i64,
    pub size: (u32, u32),
    pub boxes: Vec<BoxCoords>,
    pub labels: Vec<i64>,
}

impl<I> Annotated<I> {
    pub fn map_image<O>(self, f: impl FnOnce(I) -> Result<O>) -> Result<Annotated<O>> {
        Ok(Annotated {
            image: f(self.image)?,
            image_id: self.image_id,
            size: self.size,
            boxes: self.boxes,
            labels: self.labels,
        })
    }
}

/// Lifts an image transform to act on the image of an [`Annotated`].
#[derive(Debug, Clone)]
pub struct OnImage<T>(pub T);

impl<I, O, T> Transform<Annotated<I>, Annotated<O>> for OnImage<T>
where
    T: Transform<I, O>,
{
    fn apply(&self, input: Annotated<I>, rng: &mut StdRng) -> Result<Annotated<O>> {
        input.map_image(|image| self.0.apply(image, rng))
    }
}

// =======================================================================================
// SsdCropping
// =======================================================================================

/// IoU bounds `(min, max)` per crop mode; `None` is the "keep the whole image" mode.
const CROP_MODES: [Option<(Option<f32>, Option<f32>)>; 7] = [
    None,
    Some((Some(0.1), None)),
    Some((Some(0.3), None)),
    Some((Some(0.5), None)),
    Some((Some(0.7), None)),
    Some((Some(0.9), None)),
    Some((None, None)),
];

/// The SSD random crop.
///
/// Each attempt draws a mode from [`CROP_MODES`]. Apart from the no-crop
/// mode, a window with sides in `[0.3, 1)` and aspect ratio in `[0.5, 2]` is
/// placed uniformly; it is accepted when every ground truth's IoU with it is
/// strictly between the mode's bounds and at least one box centre lies
/// strictly inside. Rejected attempts start over with a new mode.
#[derive(Debug, Clone, Default)]
pub struct SsdCropping;

impl SsdCropping {
    fn try_window(
        input: &Annotated<DynamicImage>,
        (min_iou, max_iou): (f32, f32),
        rng: &mut StdRng,
    ) -> Option<Annotated<DynamicImage>> {
        let w: f32 = rng.random_range(0.3..1.0);
        let h: f32 = rng.random_range(0.3..1.0);
        if w / h < 0.5 || w / h > 2.0 {
            return None;
        }
        let left: f32 = rng.random_range(0.0..1.0 - w);
        let top: f32 = rng.random_range(0.0..1.0 - h);
        let right = left + w;
        let bottom = top + h;

        let window = [left, top, right, bottom];
        if !input.boxes.iter().all(|b| {
            let overlap = iou(b, &window);
            overlap > min_iou && overlap < max_iou
        }) {
            return None;
        }

        let keep: Vec<bool> = input
            .boxes
            .iter()
            .map(|b| {
                let xc = 0.5 * (b[0] + b[2]);
                let yc = 0.5 * (b[1] + b[3]);
                xc > left && xc < right && yc > top && yc < bottom
            })
            .collect();
        if !keep.iter().any(|&k| k) {
            return None;
        }

        let (htot, wtot) = input.size;
        let left_idx = (left * wtot as f32) as u32;
        let top_idx = (top * htot as f32) as u32;
        let right_idx = ((right * wtot as f32) as u32).min(wtot);
        let bottom_idx = ((bottom * htot as f32) as u32).min(htot);
        if right_idx <= left_idx || bottom_idx <= top_idx {
            return None;
        }

        let mut boxes = Vec::new();
        let mut labels = Vec::new();
        for ((b, &label), &k) in input.boxes.iter().zip(&input.labels).zip(&keep) {
            if !k {
                continue;
            }
            let clamped = [b[0].max(left), b[1].max(top), b[2].min(right), b[3].min(bottom)];
            boxes.push([
                (clamped[0] - left) / w,
                (clamped[1] - top) / h,
                (clamped[2] - left) / w,
                (clamped[3] - top) / h,
            ]);
            labels.push(label);
        }

        Some(Annotated {
            image: input
                .image
                .crop_imm(left_idx, top_idx, right_idx - left_idx, bottom_idx - top_idx),
            image_id: input.image_id,
            size: (bottom_idx - top_idx, right_idx - left_idx),
            boxes,
            labels,
        })
    }
}

impl Transform<Annotated<DynamicImage>, Annotated<DynamicImage>> for SsdCropping {
    fn apply(
        &self,
        input: Annotated<DynamicImage>,
        rng: &mut StdRng,
    ) -> Result<Annotated<DynamicImage>> {
        loop {
            let Some((min_iou, max_iou)) = CROP_MODES[rng.random_range(0..CROP_MODES.len())] else {
                return Ok(input);
            };
            let bounds = (
                min_iou.unwrap_or(f32::NEG_INFINITY),
                max_iou.unwrap_or(f32::INFINITY),
            );
            if let Some(cropped) = Self::try_window(&input, bounds, rng) {
                return Ok(cropped);
            }
        }
    }
}

// =======================================================================================
// Box-aware flip
// =======================================================================================

impl Transform<Annotated<DynamicImage>, Annotated<DynamicImage>> for RandomHorizontalFlip {
    fn apply(
        &self,
        mut input: Annotated<DynamicImage>,
        rng: &mut StdRng,
    ) -> Result<Annotated<DynamicImage>> {
        if self.should_flip(rng) {
            input.image = Self::flip(input.image);
            for b in input.boxes.iter_mut() {
                *b = [1.0 - b[2], b[1], 1.0 - b[0], b[3]];
            }
        }
        Ok(input)
    }
}

// =======================================================================================
// Targets
// =======================================================================================

fn image_sample(input: &Annotated<Tensor>) -> Sample {
    let (height, width) = input.size;
    Sample::from_single(keys::IMAGE, input.image.shallow_clone())
        .with_feature(
            keys::IMAGE_ID,
            Tensor::scalar_tensor(input.image_id as f64, (Kind::Int64, Device::Cpu)),
        )
        .with_feature(
            keys::IMAGE_SIZE,
            Tensor::from_slice(&[height as i64, width as i64]),
        )
}

/// Matches ground truths to the default boxes and emits one target per
/// default box: `bboxes [N, 4]` xywh and `labels [N]`.
#[derive(Debug, Clone)]
pub struct EncodeTargets {
    dboxes: Arc<DefaultBoxes>,
    criterion: f32,
}

impl EncodeTargets {
    pub fn new(dboxes: Arc<DefaultBoxes>) -> Self {
        Self {
            dboxes,
            criterion: DEFAULT_CRITERION,
        }
    }

    pub fn with_criterion(mut self, criterion: f32) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&criterion),
            "IoU criterion must be in [0.0, 1.0] (got {})",
            criterion
        );
        self.criterion = criterion;
        Ok(self)
    }
}

impl Transform<Annotated<Tensor>, Sample> for EncodeTargets {
    fn apply(&self, input: Annotated<Tensor>, _rng: &mut StdRng) -> Result<Sample> {
        let encoded = Encoder::new(&self.dboxes)
            .encode(&input.boxes, &input.labels, self.criterion)
            .with_context(|| format!("Failed to encode targets of image {}", input.image_id))?;

        Ok(image_sample(&input)
            .with_feature(keys::BBOXES, boxes_to_tensor(&encoded.boxes))
            .with_feature(keys::LABELS, Tensor::from_slice(&encoded.labels)))
    }
}

/// Zero-pads ltrb boxes and labels to `max_boxes` slots.
#[derive(Debug, Clone)]
pub struct PadTargets {
    max_boxes: usize,
}

impl PadTargets {
    pub fn new(max_boxes: usize) -> Result<Self> {
        ensure!(max_boxes > 0, "max_boxes must be positive");
        Ok(Self { max_boxes })
    }
}

impl Transform<Annotated<Tensor>, Sample> for PadTargets {
    fn apply(&self, input: Annotated<Tensor>, _rng: &mut StdRng) -> Result<Sample> {
        if input.boxes.len() > self.max_boxes {
            tracing::warn!(
                image_id = input.image_id,
                boxes = input.boxes.len(),
                max_boxes = self.max_boxes,
                "Truncating evaluation targets"
            );
        }

        let mut boxes = vec![[0.0f32; 4]; self.max_boxes];
        let mut labels = vec![0i64; self.max_boxes];
        for (slot, (b, &l)) in input.boxes.iter().zip(&input.labels).take(self.max_boxes).enumerate() {
            boxes[slot] = *b;
            labels[slot] = l;
        }

        Ok(image_sample(&input)
            .with_feature(keys::BBOXES, boxes_to_tensor(&boxes))
            .with_feature(keys::LABELS, Tensor::from_slice(&labels)))
    }
}

// =======================================================================================
// SsdTransform
// =======================================================================================

type BoxedPipeline = Box<dyn Transform<Annotated<DynamicImage>, Sample>>;

/// The complete SSD300 per-sample transform.
///
/// - Train: random crop, horizontal flip (p = 0.5), 300×300 bilinear resize,
///   colour jitter, to tensor, ImageNet normalisation, target encoding.
/// - Eval: resize, to tensor, normalisation, targets padded to
///   [`MAX_EVAL_BOXES`]. Eval ignores the RNG.
pub struct SsdTransform {
    mode: Mode,
    dboxes: Arc<DefaultBoxes>,
    pipeline: BoxedPipeline,
}

impl fmt::Debug for SsdTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsdTransform")
            .field("mode", &self.mode)
            .field("num_default_boxes", &self.dboxes.len())
            .finish()
    }
}

impl SsdTransform {
    /// Builds the pipeline for `mode`; the input size is the default boxes'
    /// figure size.
    pub fn new(dboxes: Arc<DefaultBoxes>, mode: Mode) -> Result<Self> {
        let size = dboxes.fig_size();
        let pipeline: BoxedPipeline = match mode {
            Mode::Train => Box::new(
                SsdCropping
                    .then(RandomHorizontalFlip::new(0.5)?)
                    .then(OnImage(Resize::square(size)?))
                    .then(OnImage(ColorJitter::ssd()))
                    .then(OnImage(ToTensor))
                    .then(OnImage(Normalize::imagenet()))
                    .then(EncodeTargets::new(Arc::clone(&dboxes))),
            ),
            Mode::Eval => Box::new(
                OnImage(Resize::square(size)?)
                    .then(OnImage(ToTensor))
                    .then(OnImage(Normalize::imagenet()))
                    .then(PadTargets::new(MAX_EVAL_BOXES)?),
            ),
        };
        Ok(Self {
            mode,
            dboxes,
            pipeline,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn default_boxes(&self) -> &Arc<DefaultBoxes> {
        &self.dboxes
    }
}

impl Transform<Annotated<DynamicImage>, Sample> for SsdTransform {
    fn apply(&self, input: Annotated<DynamicImage>, rng: &mut StdRng) -> Result<Sample> {
        self.pipeline.apply(input, rng)
    }
}

/// Builds the SSD300 default boxes and the transform for `mode`.
///
/// The returned `Arc` is the same set the transform encodes against; share
/// it with anything that decodes predictions.
pub fn build_transform(mode: Mode) -> Result<(Arc<DefaultBoxes>, SsdTransform)> {
    let dboxes = Arc::new(DefaultBoxes::ssd300_coco()?);
    let transform = SsdTransform::new(Arc::clone(&dboxes), mode)?;
    Ok((dboxes, transform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GenericImageView, Rgb, RgbImage};
    use rand::SeedableRng;

    const TEST_SEED: u64 = 42;

    fn annotated(width: u32, height: u32) -> Annotated<DynamicImage> {
        let mut img = RgbImage::new(width, height);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8]);
        }
        Annotated {
            image: DynamicImage::ImageRgb8(img),
            image_id: 139,
            size: (height, width),
            boxes: vec![[0.1, 0.2, 0.5, 0.6], [0.55, 0.3, 0.95, 0.9]],
            labels: vec![1, 18],
        }
    }

    mod cropping_tests {
        use super::*;

        #[test]
        fn test_crop_keeps_boxes_normalised_and_size_consistent() -> Result<()> {
            let mut rng = StdRng::seed_from_u64(TEST_SEED);
            for _ in 0..200 {
                let out = SsdCropping.apply(annotated(64, 48), &mut rng)?;

                let (h, w) = out.size;
                assert_eq!(out.image.dimensions(), (w, h));
                assert!(!out.boxes.is_empty());
                assert_eq!(out.boxes.len(), out.labels.len());
                for b in &out.boxes {
                    assert!(b.iter().all(|&v| (-1e-5..=1.0 + 1e-5).contains(&v)), "{:?}", b);
                    assert!(b[0] <= b[2] && b[1] <= b[3]);
                }
            }
            Ok(())
        }

        #[test]
        fn test_crop_sometimes_keeps_whole_image() -> Result<()> {
            let mut rng = StdRng::seed_from_u64(TEST_SEED);
            let untouched = (0..100)
                .filter_map(|_| SsdCropping.apply(annotated(64, 48), &mut rng).ok())
                .filter(|out| out.size == (48, 64))
                .count();
            assert!(untouched > 0);
            Ok(())
        }
    }

    mod flip_tests {
        use super::*;

        #[test]
        fn test_flip_mirrors_boxes() -> Result<()> {
            let flip = RandomHorizontalFlip::new(1.0)?;
            let out = flip.apply(annotated(8, 8), &mut StdRng::seed_from_u64(TEST_SEED))?;

            let expected = [0.5, 0.2, 0.9, 0.6];
            for k in 0..4 {
                assert!((out.boxes[0][k] - expected[k]).abs() < 1e-6);
            }
            Ok(())
        }
    }

    mod pipeline_tests {
        use super::*;

        #[test]
        fn test_train_sample_shapes() -> Result<()> {
            let (dboxes, transform) = build_transform(Mode::Train)?;
            let sample = transform.apply(annotated(64, 48), &mut StdRng::seed_from_u64(TEST_SEED))?;

            assert_eq!(sample.get(keys::IMAGE)?.size(), &[3, 300, 300]);
            assert_eq!(sample.get(keys::BBOXES)?.size(), &[dboxes.len() as i64, 4]);
            assert_eq!(sample.get(keys::LABELS)?.size(), &[8732]);
            assert_eq!(sample.get(keys::LABELS)?.kind(), Kind::Int64);
            assert_eq!(sample.get(keys::IMAGE_ID)?.int64_value(&[]), 139);
            assert_eq!(sample.get(keys::IMAGE_SIZE)?.size(), &[2]);
            Ok(())
        }

        #[test]
        fn test_train_depends_on_seed() -> Result<()> {
            let (_, transform) = build_transform(Mode::Train)?;
            let a = transform.apply(annotated(64, 48), &mut StdRng::seed_from_u64(1))?;
            let b = transform.apply(annotated(64, 48), &mut StdRng::seed_from_u64(2))?;
            let c = transform.apply(annotated(64, 48), &mut StdRng::seed_from_u64(1))?;

            assert!(!a.get(keys::IMAGE)?.equal(b.get(keys::IMAGE)?));
            assert!(a.get(keys::IMAGE)?.equal(c.get(keys::IMAGE)?));
            Ok(())
        }

        #[test]
        fn test_eval_ignores_seed_and_pads() -> Result<()> {
            let (_, transform) = build_transform(Mode::Eval)?;
            let a = transform.apply(annotated(64, 48), &mut StdRng::seed_from_u64(1))?;
            let b = transform.apply(annotated(64, 48), &mut StdRng::seed_from_u64(999))?;

            assert!(a.get(keys::IMAGE)?.equal(b.get(keys::IMAGE)?));
            assert_eq!(a.get(keys::BBOXES)?.size(), &[200, 4]);
            assert_eq!(a.get(keys::LABELS)?.int64_value(&[1]), 18);
            assert_eq!(a.get(keys::LABELS)?.int64_value(&[2]), 0);

            let size: Vec<i64> = a.get(keys::IMAGE_SIZE)?.try_into()?;
            assert_eq!(size, vec![48, 64]);
            Ok(())
        }

        #[test]
        fn test_pad_truncates_excess_boxes() -> Result<()> {
            let pad = PadTargets::new(1)?;
            let input = annotated(4, 4).map_image(|img| ToTensor.apply(img, &mut StdRng::seed_from_u64(0)))?;
            let sample = pad.apply(input, &mut StdRng::seed_from_u64(0))?;
            assert_eq!(sample.get(keys::LABELS)?.size(), &[1]);
            assert_eq!(sample.get(keys::LABELS)?.int64_value(&[0]), 1);
            Ok(())
        }
    }
}
