use crate::sample::Sample;
use anyhow::Result;
use rand::rngs::StdRng;
use std::sync::Arc;

/// Random-access source of samples.
///
/// `get` receives the RNG that every stochastic transform step draws from.
/// The data loader seeds it per `(seed, epoch, index)`, so a sample's
/// augmentation does not depend on which worker produced it.
///
/// Implementations must be `Send + Sync`: worker threads share one dataset
/// through `Arc` and call `get` concurrently.
pub trait Dataset: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produces sample `index`. Indices outside `0..len()` fail with
    /// [`DataError::IndexOutOfRange`](crate::error::DataError::IndexOutOfRange).
    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample>;
}

impl<D: Dataset + ?Sized> Dataset for Arc<D> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
        (**self).get(index, rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use rand::{Rng, SeedableRng};
    use tch::Tensor;

    struct Squares(usize);

    impl Dataset for Squares {
        fn len(&self) -> usize {
            self.0
        }

        fn get(&self, index: usize, rng: &mut StdRng) -> Result<Sample> {
            if index >= self.0 {
                return Err(DataError::IndexOutOfRange { index, len: self.0 }.into());
            }
            let noise: i64 = rng.random_range(0..10);
            Ok(Sample::from_single(
                "value",
                Tensor::from_slice(&[(index * index) as i64 + 100 * noise]),
            ))
        }
    }

    #[test]
    fn test_arc_dataset_delegates() -> Result<()> {
        let dataset: Arc<dyn Dataset> = Arc::new(Squares(4));
        let mut rng = StdRng::seed_from_u64(42);

        assert_eq!(dataset.len(), 4);
        assert!(!dataset.is_empty());
        let value = dataset.get(3, &mut rng)?.get("value")?.int64_value(&[0]);
        assert_eq!(value % 100, 9);
        Ok(())
    }

    #[test]
    fn test_out_of_range_is_declared_kind() {
        let err = Squares(2)
            .get(2, &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DataError>(),
            Some(DataError::IndexOutOfRange { index: 2, len: 2 })
        ));
    }
}
