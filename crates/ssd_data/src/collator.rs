use crate::minibatch::MiniBatch;
use crate::sample::Sample;
use anyhow::{anyhow, bail, Result};
use std::collections::{HashMap, HashSet};
use tch::Tensor;

/// A `Collator` defines how multiple [`Sample`]s are combined into a [`MiniBatch`].
pub trait Collator {
    fn collate(&self, samples: &[Sample]) -> Result<MiniBatch>;
}

/// Stacks tensors with identical shapes along dim 0.
///
/// Detection samples are already fixed-size after the SSD transform
/// (8732 encoded boxes in training, 200 padded boxes in evaluation), so no
/// padding is done here. Mismatched keys or shapes are an error.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackCollator;

impl Collator for StackCollator {
    fn collate(&self, samples: &[Sample]) -> Result<MiniBatch> {
        let Some(first) = samples.first() else {
            bail!("Cannot collate empty sample list");
        };

        // Validate feature keys
        let first_keys: HashSet<&String> = first.features.keys().collect();
        for (i, sample) in samples.iter().enumerate().skip(1) {
            let missing_keys: Vec<&String> = first_keys
                .iter()
                .filter(|&&k| !sample.features.contains_key(k))
                .copied()
                .collect();
            let extra_keys: Vec<&String> = sample
                .features
                .keys()
                .filter(|k| !first_keys.contains(k))
                .collect();

            if !missing_keys.is_empty() || !extra_keys.is_empty() {
                bail!(
                    "Sample #{} has mismatched feature keys:\n -Missing: {:?}\n -Extra: {:?}",
                    i,
                    missing_keys,
                    extra_keys
                )
            }
        }

        let mut tensors = HashMap::with_capacity(first_keys.len());
        for key in first_keys {
            let tensors_to_stack = samples
                .iter()
                .map(|s| {
                    s.features
                        .get(key)
                        .ok_or_else(|| anyhow!("Feature '{}' vanished during collation", key))
                })
                .collect::<Result<Vec<&Tensor>>>()?;

            let reference_shape = tensors_to_stack[0].size();
            let reference_kind = tensors_to_stack[0].kind();
            for (i, tensor) in tensors_to_stack.iter().enumerate() {
                if tensor.size() != reference_shape {
                    bail!(
                        "Shape mismatch in sample {} for feature '{}': expected {:?}, got {:?}",
                        i,
                        key,
                        reference_shape,
                        tensor.size()
                    );
                }
                if tensor.kind() != reference_kind {
                    bail!(
                        "Dtype mismatch in sample {} for feature '{}': expected {:?}, got {:?}",
                        i,
                        key,
                        reference_kind,
                        tensor.kind()
                    );
                }
            }

            tensors.insert(key.clone(), Tensor::stack(&tensors_to_stack, 0));
        }
        Ok(MiniBatch { tensors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::keys;
    use tch::{Device, Kind};

    mod stack_collator_tests {
        use super::*;

        fn detection_sample(label: i64, num_boxes: i64) -> Sample {
            Sample::from_single(
                keys::IMAGE,
                Tensor::zeros([3, 8, 8], (Kind::Float, Device::Cpu)),
            )
            .with_feature(
                keys::BBOXES,
                Tensor::zeros([num_boxes, 4], (Kind::Float, Device::Cpu)),
            )
            .with_feature(
                keys::LABELS,
                Tensor::full([num_boxes], label, (Kind::Int64, Device::Cpu)),
            )
        }

        #[test]
        fn test_stacks_fixed_size_targets() -> Result<()> {
            let samples: Vec<_> = (1..=4).map(|l| detection_sample(l, 6)).collect();
            let batch = StackCollator.collate(&samples)?;

            assert_eq!(batch.get(keys::IMAGE)?.size(), &[4, 3, 8, 8]);
            assert_eq!(batch.get(keys::BBOXES)?.size(), &[4, 6, 4]);
            assert_eq!(batch.get(keys::LABELS)?.int64_value(&[2, 0]), 3);
            Ok(())
        }

        #[test]
        fn test_rejects_variable_box_counts() {
            let samples = vec![detection_sample(1, 6), detection_sample(1, 7)];
            let err = StackCollator.collate(&samples).unwrap_err();
            assert!(err.to_string().contains("Shape mismatch"));
        }

        #[test]
        fn test_rejects_missing_feature() {
            let full = detection_sample(1, 2);
            let partial = Sample::from_single(
                keys::IMAGE,
                Tensor::zeros([3, 8, 8], (Kind::Float, Device::Cpu)),
            );
            let err = StackCollator.collate(&[full, partial]).unwrap_err();
            assert!(err.to_string().contains("mismatched feature keys"));
        }

        #[test]
        fn test_rejects_mixed_dtypes() {
            let a = Sample::from_single(keys::IMAGE, Tensor::zeros([2], (Kind::Float, Device::Cpu)));
            let b = Sample::from_single(keys::IMAGE, Tensor::zeros([2], (Kind::Half, Device::Cpu)));
            assert!(StackCollator.collate(&[a, b]).is_err());
        }

        #[test]
        fn test_rejects_empty_batch() {
            assert!(StackCollator.collate(&[]).is_err());
        }
    }
}
