//! SSD default boxes and ground-truth matching.
//!
//! Boxes are `[f32; 4]` in normalised image coordinates. Two orders appear:
//! - `ltrb`: `[left, top, right, bottom]`
//! - `xywh`: `[centre_x, centre_y, width, height]`

use anyhow::{ensure, Result};
use tch::Tensor;

pub type BoxCoords = [f32; 4];

/// Coordinate order of a box tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxOrder {
    Ltrb,
    Xywh,
}

pub fn xywh_to_ltrb([cx, cy, w, h]: BoxCoords) -> BoxCoords {
    [cx - 0.5 * w, cy - 0.5 * h, cx + 0.5 * w, cy + 0.5 * h]
}

pub fn ltrb_to_xywh([l, t, r, b]: BoxCoords) -> BoxCoords {
    [0.5 * (l + r), 0.5 * (t + b), r - l, b - t]
}

/// Intersection over union of two ltrb boxes. Degenerate pairs give 0.
pub fn iou(a: &BoxCoords, b: &BoxCoords) -> f32 {
    let iw = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let ih = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = iw * ih;
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Flattens `[N, 4]` boxes into a float tensor.
pub fn boxes_to_tensor(boxes: &[BoxCoords]) -> Tensor {
    let flat: Vec<f32> = boxes.iter().flatten().copied().collect();
    Tensor::from_slice(&flat).view([boxes.len() as i64, 4])
}

// =======================================================================================
// Default boxes
// =======================================================================================

/// Geometry of an SSD default-box set.
#[derive(Debug, Clone, PartialEq)]
pub struct DefaultBoxesConfig {
    pub fig_size: u32,
    pub feat_size: Vec<u32>,
    pub steps: Vec<u32>,
    pub scales: Vec<u32>,
    pub aspect_ratios: Vec<Vec<u32>>,
    pub scale_xy: f32,
    pub scale_wh: f32,
}

impl DefaultBoxesConfig {
    /// SSD300 on COCO.
    pub fn ssd300_coco() -> Self {
        Self {
            fig_size: 300,
            feat_size: vec![38, 19, 10, 5, 3, 1],
            steps: vec![8, 16, 32, 64, 100, 300],
            scales: vec![21, 45, 99, 153, 207, 261, 315],
            aspect_ratios: vec![vec![2], vec![2, 3], vec![2, 3], vec![2, 3], vec![2], vec![2]],
            scale_xy: 0.1,
            scale_wh: 0.2,
        }
    }
}

/// The anchor set every prediction head is matched against.
///
/// Built once per loader and shared through `Arc` by the transform, the
/// pipeline and any consumer that decodes predictions.
#[derive(Debug, Clone)]
pub struct DefaultBoxes {
    config: DefaultBoxesConfig,
    xywh: Vec<BoxCoords>,
    ltrb: Vec<BoxCoords>,
}

impl DefaultBoxes {
    /// Generates the boxes for every feature map cell.
    ///
    /// For feature map `k` with `fk = fig_size / steps[k]`, each cell `(i, j)`
    /// gets boxes centred at `((j + 0.5) / fk, (i + 0.5) / fk)` with sizes
    /// `sk1 = scales[k] / fig_size`, `sqrt(sk1 * sk2)` and one pair per
    /// aspect ratio `(sk1 * sqrt(a), sk1 / sqrt(a))`. Boxes are clamped to
    /// `[0, 1]` in xywh form.
    pub fn new(config: DefaultBoxesConfig) -> Result<Self> {
        let layers = config.feat_size.len();
        ensure!(layers > 0, "Default boxes need at least one feature map");
        ensure!(
            config.steps.len() == layers && config.aspect_ratios.len() == layers,
            "steps ({}) and aspect_ratios ({}) must match the {} feature maps",
            config.steps.len(),
            config.aspect_ratios.len(),
            layers
        );
        ensure!(
            config.scales.len() == layers + 1,
            "Expected {} scales, got {}",
            layers + 1,
            config.scales.len()
        );
        ensure!(
            config.fig_size > 0 && config.steps.iter().all(|&s| s > 0),
            "fig_size and steps must be positive"
        );

        let fig = config.fig_size as f64;
        let mut xywh = Vec::new();
        for (idx, &sfeat) in config.feat_size.iter().enumerate() {
            let fk = fig / config.steps[idx] as f64;
            let sk1 = config.scales[idx] as f64 / fig;
            let sk2 = config.scales[idx + 1] as f64 / fig;
            let sk3 = (sk1 * sk2).sqrt();

            let mut sizes = vec![(sk1, sk1), (sk3, sk3)];
            for &alpha in &config.aspect_ratios[idx] {
                let root = (alpha as f64).sqrt();
                let (w, h) = (sk1 * root, sk1 / root);
                sizes.push((w, h));
                sizes.push((h, w));
            }

            for (w, h) in sizes {
                for i in 0..sfeat {
                    for j in 0..sfeat {
                        let cx = (j as f64 + 0.5) / fk;
                        let cy = (i as f64 + 0.5) / fk;
                        xywh.push(
                            [cx, cy, w, h].map(|v| v.clamp(0.0, 1.0) as f32),
                        );
                    }
                }
            }
        }
        let ltrb = xywh.iter().copied().map(xywh_to_ltrb).collect();

        Ok(Self { config, xywh, ltrb })
    }

    /// The 8732-box SSD300 COCO set.
    pub fn ssd300_coco() -> Result<Self> {
        Self::new(DefaultBoxesConfig::ssd300_coco())
    }

    pub fn len(&self) -> usize {
        self.xywh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xywh.is_empty()
    }

    pub fn config(&self) -> &DefaultBoxesConfig {
        &self.config
    }

    pub fn fig_size(&self) -> u32 {
        self.config.fig_size
    }

    pub fn scale_xy(&self) -> f32 {
        self.config.scale_xy
    }

    pub fn scale_wh(&self) -> f32 {
        self.config.scale_wh
    }

    pub fn xywh(&self) -> &[BoxCoords] {
        &self.xywh
    }

    pub fn ltrb(&self) -> &[BoxCoords] {
        &self.ltrb
    }

    /// Returns the boxes as a `[N, 4]` f32 tensor.
    pub fn to_tensor(&self, order: BoxOrder) -> Tensor {
        match order {
            BoxOrder::Ltrb => boxes_to_tensor(&self.ltrb),
            BoxOrder::Xywh => boxes_to_tensor(&self.xywh),
        }
    }
}

// =======================================================================================
// Encoder
// =======================================================================================

/// Default IoU threshold above which a default box takes a ground truth's label.
pub const DEFAULT_CRITERION: f32 = 0.5;

/// Per-default-box targets produced by [`Encoder::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTargets {
    /// One xywh box per default box: the matched ground truth, or the default
    /// box itself when unmatched.
    pub boxes: Vec<BoxCoords>,
    /// One label per default box, `0` for background.
    pub labels: Vec<i64>,
}

/// Matches ground-truth boxes to default boxes.
#[derive(Debug, Clone, Copy)]
pub struct Encoder<'a> {
    dboxes: &'a DefaultBoxes,
}

impl<'a> Encoder<'a> {
    pub fn new(dboxes: &'a DefaultBoxes) -> Self {
        Self { dboxes }
    }

    /// Assigns every default box a target.
    ///
    /// A default box takes the ground truth it overlaps most when that IoU is
    /// above `criterion`. Independently, every ground truth claims the default
    /// box it overlaps most, regardless of the threshold, so no object is left
    /// without a positive.
    ///
    /// # Arguments:
    /// - `boxes`: ground truths in ltrb order
    /// - `labels`: one label per ground truth
    /// - `criterion`: IoU threshold, usually [`DEFAULT_CRITERION`]
    pub fn encode(&self, boxes: &[BoxCoords], labels: &[i64], criterion: f32) -> Result<EncodedTargets> {
        ensure!(
            boxes.len() == labels.len(),
            "Got {} boxes but {} labels",
            boxes.len(),
            labels.len()
        );

        let dboxes = self.dboxes.ltrb();
        let mut out_boxes = dboxes.to_vec();
        let mut out_labels = vec![0i64; dboxes.len()];

        if !boxes.is_empty() {
            // For every default box: best ground truth and its IoU.
            let mut best_gt_iou = vec![f32::NEG_INFINITY; dboxes.len()];
            let mut best_gt_idx = vec![0usize; dboxes.len()];
            // For every ground truth: best default box.
            let mut best_dbox_iou = vec![f32::NEG_INFINITY; boxes.len()];
            let mut best_dbox_idx = vec![0usize; boxes.len()];

            for (d, dbox) in dboxes.iter().enumerate() {
                for (g, gt) in boxes.iter().enumerate() {
                    let overlap = iou(gt, dbox);
                    if overlap > best_gt_iou[d] {
                        best_gt_iou[d] = overlap;
                        best_gt_idx[d] = g;
                    }
                    if overlap > best_dbox_iou[g] {
                        best_dbox_iou[g] = overlap;
                        best_dbox_idx[g] = d;
                    }
                }
            }

            for (g, &d) in best_dbox_idx.iter().enumerate() {
                best_gt_iou[d] = 2.0;
                best_gt_idx[d] = g;
            }

            for d in 0..dboxes.len() {
                if best_gt_iou[d] > criterion {
                    out_boxes[d] = boxes[best_gt_idx[d]];
                    out_labels[d] = labels[best_gt_idx[d]];
                }
            }
        }

        Ok(EncodedTargets {
            boxes: out_boxes.into_iter().map(ltrb_to_xywh).collect(),
            labels: out_labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-6;

    mod geometry_tests {
        use super::*;

        #[test]
        fn test_iou_identical_and_disjoint() {
            let a = [0.1, 0.1, 0.5, 0.5];
            let b = [0.6, 0.6, 0.9, 0.9];
            assert!((iou(&a, &a) - 1.0).abs() < EPS);
            assert_eq!(iou(&a, &b), 0.0);
        }

        #[test]
        fn test_iou_half_overlap() {
            let a = [0.0, 0.0, 0.5, 1.0];
            let b = [0.25, 0.0, 0.75, 1.0];
            // inter = 0.25, union = 0.75
            assert!((iou(&a, &b) - 1.0 / 3.0).abs() < EPS);
        }

        #[test]
        fn test_iou_degenerate_box_is_zero() {
            let point = [0.3, 0.3, 0.3, 0.3];
            assert_eq!(iou(&point, &point), 0.0);
        }

        #[test]
        fn test_order_conversion_roundtrip() {
            let ltrb = [0.2, 0.1, 0.6, 0.9];
            let back = xywh_to_ltrb(ltrb_to_xywh(ltrb));
            for k in 0..4 {
                assert!((ltrb[k] - back[k]).abs() < EPS);
            }
        }
    }

    mod default_boxes_tests {
        use super::*;

        #[test]
        fn test_ssd300_has_8732_boxes() -> Result<()> {
            let dboxes = DefaultBoxes::ssd300_coco()?;
            assert_eq!(dboxes.len(), 8732);
            assert_eq!(dboxes.to_tensor(BoxOrder::Ltrb).size(), &[8732, 4]);
            assert_eq!(dboxes.scale_xy(), 0.1);
            assert_eq!(dboxes.scale_wh(), 0.2);
            Ok(())
        }

        #[test]
        fn test_first_box_geometry() -> Result<()> {
            let dboxes = DefaultBoxes::ssd300_coco()?;
            // First feature map: fk = 37.5, sk1 = 0.07.
            let [cx, cy, w, h] = dboxes.xywh()[0];
            assert!((cx - 0.5 / 37.5).abs() < EPS);
            assert!((cy - 0.5 / 37.5).abs() < EPS);
            assert!((w - 0.07).abs() < EPS);
            assert!((h - 0.07).abs() < EPS);

            // Second box in row-major order moves along x.
            let [cx1, cy1, _, _] = dboxes.xywh()[1];
            assert!((cx1 - 1.5 / 37.5).abs() < EPS);
            assert!((cy1 - cy).abs() < EPS);
            Ok(())
        }

        #[test]
        fn test_boxes_are_clamped() -> Result<()> {
            let dboxes = DefaultBoxes::ssd300_coco()?;
            assert!(dboxes
                .xywh()
                .iter()
                .flatten()
                .all(|&v| (0.0..=1.0).contains(&v)));
            // The last map is a single cell with sizes above 1 before clamping.
            let last = dboxes.xywh()[dboxes.len() - 1];
            assert_eq!(last[0], 0.5);
            assert!(last[2] <= 1.0 && last[3] <= 1.0);
            Ok(())
        }

        #[test]
        fn test_rejects_inconsistent_geometry() {
            let mut config = DefaultBoxesConfig::ssd300_coco();
            config.scales.pop();
            assert!(DefaultBoxes::new(config).is_err());

            let mut config = DefaultBoxesConfig::ssd300_coco();
            config.steps[0] = 0;
            assert!(DefaultBoxes::new(config).is_err());
        }
    }

    mod encoder_tests {
        use super::*;

        #[test]
        fn test_no_ground_truth_is_all_background() -> Result<()> {
            let dboxes = DefaultBoxes::ssd300_coco()?;
            let encoded = Encoder::new(&dboxes).encode(&[], &[], DEFAULT_CRITERION)?;

            assert_eq!(encoded.labels.len(), 8732);
            assert!(encoded.labels.iter().all(|&l| l == 0));
            for (got, want) in encoded.boxes.iter().zip(dboxes.xywh()) {
                for k in 0..4 {
                    assert!((got[k] - want[k]).abs() < 1e-5);
                }
            }
            Ok(())
        }

        #[test]
        fn test_every_ground_truth_gets_a_default_box() -> Result<()> {
            let dboxes = DefaultBoxes::ssd300_coco()?;
            // A tiny box matches nothing above 0.5 but must still be claimed.
            let boxes = [[0.40, 0.40, 0.41, 0.41], [0.1, 0.1, 0.9, 0.9]];
            let labels = [7, 3];
            let encoded = Encoder::new(&dboxes).encode(&boxes, &labels, DEFAULT_CRITERION)?;

            assert!(encoded.labels.contains(&7));
            assert!(encoded.labels.contains(&3));

            let positive = encoded.labels.iter().position(|&l| l == 7).unwrap();
            let expected = ltrb_to_xywh(boxes[0]);
            for k in 0..4 {
                assert!((encoded.boxes[positive][k] - expected[k]).abs() < EPS);
            }
            Ok(())
        }

        #[test]
        fn test_matches_above_criterion() -> Result<()> {
            let dboxes = DefaultBoxes::ssd300_coco()?;
            let gt = dboxes.ltrb()[100];
            let encoded = Encoder::new(&dboxes).encode(&[gt], &[5], DEFAULT_CRITERION)?;

            assert_eq!(encoded.labels[100], 5);
            for (d, dbox) in dboxes.ltrb().iter().enumerate() {
                if iou(&gt, dbox) > DEFAULT_CRITERION {
                    assert_eq!(encoded.labels[d], 5, "default box {} should match", d);
                }
            }
            Ok(())
        }

        #[test]
        fn test_rejects_label_count_mismatch() -> Result<()> {
            let dboxes = DefaultBoxes::ssd300_coco()?;
            let result = Encoder::new(&dboxes).encode(&[[0.0, 0.0, 1.0, 1.0]], &[], DEFAULT_CRITERION);
            assert!(result.is_err());
            Ok(())
        }
    }
}
