use anyhow::{Context, Result};
use rand::rngs::StdRng;
use std::marker::PhantomData;

/// Defines the core `Transform` trait for composable data processing pipelines.
///
/// A `Transform<I, O>` converts an input of type `I` into an output of type
/// `O`. Steps are chained with `.then(...)` into a single statically
/// dispatched pipeline.
///
/// Stochastic steps draw exclusively from the `rng` argument. The caller
/// owns the generator and decides how it is seeded (the data loader seeds one
/// per sample from `(seed, epoch, index)`), so a pipeline replays exactly
/// when handed an identically seeded generator. Deterministic steps ignore it.
///
/// Note: `then()` works only when:
/// 1. **Types align**: `self: Transform<I, O>`, `next: Transform<O, M>`
/// 2. **Owned**: `Self: Sized`
/// 3. **Thread-safe**: intermediate and output types must be `Send`
pub trait Transform<I, O>: Send + Sync {
    fn apply(&self, input: I, rng: &mut StdRng) -> Result<O>;

    #[inline]
    fn then<T, M>(self, next: T) -> Chain<Self, T, O>
    where
        Self: Sized,
        T: Transform<O, M>,
        O: Send,
        M: Send,
    {
        Chain {
            first: self,
            second: next,
            _marker: PhantomData,
        }
    }
}

impl<I, O, T> Transform<I, O> for Box<T>
where
    T: Transform<I, O> + ?Sized,
{
    fn apply(&self, input: I, rng: &mut StdRng) -> Result<O> {
        (**self).apply(input, rng)
    }
}

/// A chain of two transforms (`A` -> `B`)
/// - `PhantomData<M>` enforces intermediate type alignment.
#[derive(Debug)]
pub struct Chain<A, B, M> {
    first: A,
    second: B,
    _marker: PhantomData<fn() -> M>,
}

impl<A, B, M> Chain<A, B, M> {
    /// Use [`Transform::then`] for better ergonomics.
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            _marker: PhantomData,
        }
    }
}

impl<I, M, O, A, B> Transform<I, O> for Chain<A, B, M>
where
    A: Transform<I, M>,
    B: Transform<M, O>,
    M: Send,
{
    fn apply(&self, input: I, rng: &mut StdRng) -> Result<O> {
        self.first
            .apply(input, rng)
            .and_then(|mid| self.second.apply(mid, rng))
            .with_context(|| {
                format!(
                    "Transform chain failed: {} → {} → {}",
                    std::any::type_name::<A>(),
                    std::any::type_name::<B>(),
                    std::any::type_name::<O>()
                )
            })
    }
}
