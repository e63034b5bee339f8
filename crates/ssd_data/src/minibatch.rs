use crate::collator::Collator;
use crate::sample::Sample;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use tch::{Cuda, Device, Tensor};

/// A batch of detection samples stacked along dim 0.
///
/// Each tensor has shape `[batch_size, ...]`. For a train batch of 32:
/// - `"image"` -> `[32, 3, 300, 300]`
/// - `"bboxes"` -> `[32, 8732, 4]`
/// - `"labels"` -> `[32, 8732]`
#[derive(Debug)]
pub struct MiniBatch {
    pub tensors: HashMap<String, Tensor>,
}

// Safety: same argument as for `Sample`; tensors are `Send + Sync` and the
// map is only mutated through `&mut self`.
unsafe impl Send for MiniBatch {}
unsafe impl Sync for MiniBatch {}

impl MiniBatch {
    /// Delegates stacking to the given [`Collator`].
    pub fn collate(samples: Vec<Sample>, collator: impl Collator) -> Result<Self> {
        collator.collate(&samples)
    }

    /// Returns the number of samples in the batch.
    pub fn batch_size(&self) -> Result<i64> {
        self.tensors
            .values()
            .next()
            .map(|t| t.size()[0])
            .ok_or(anyhow!("Empty mini-batch"))
    }

    pub fn get(&self, feature: &str) -> Result<&Tensor> {
        self.tensors
            .get(feature)
            .ok_or_else(|| anyhow!("Feature '{}' not found in mini-batch", feature))
    }

    pub fn features(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Transfers all tensors to the target device (CPU/GPU).
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|(feature_name, tensor)| (feature_name.clone(), tensor.to_device(device)))
                .collect(),
        }
    }

    /// Copies every tensor into page-locked host memory so a later
    /// `to_device` can run asynchronously.
    ///
    /// Page-locked memory needs a CUDA runtime; without one the batch is
    /// returned unchanged.
    pub fn pin_memory(self) -> Result<Self> {
        if !Cuda::is_available() {
            return Ok(self);
        }
        let mut tensors = HashMap::with_capacity(self.tensors.len());
        for (name, tensor) in self.tensors {
            let pinned = tensor
                .f_pin_memory(Device::Cuda(0))
                .map_err(|e| anyhow!("Failed to pin feature '{}': {}", name, e))?;
            tensors.insert(name, pinned);
        }
        Ok(Self { tensors })
    }

    /// A second handle on the same tensor storage.
    pub fn shallow_clone(&self) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|(name, tensor)| (name.clone(), tensor.shallow_clone()))
                .collect(),
        }
    }

    /// Replaces one feature's tensor with `f(tensor)`.
    pub fn map_feature(mut self, feature: &str, f: impl FnOnce(Tensor) -> Result<Tensor>) -> Result<Self> {
        let tensor = self
            .tensors
            .remove(feature)
            .ok_or_else(|| anyhow!("Feature '{}' not found in mini-batch", feature))?;
        self.tensors.insert(feature.to_string(), f(tensor)?);
        Ok(self)
    }
}
