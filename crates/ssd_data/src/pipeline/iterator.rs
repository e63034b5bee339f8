use crate::error::DataError;
use crate::minibatch::MiniBatch;
use anyhow::{ensure, Result};
use tch::{Cuda, Device};

use super::coco::CocoPipeline;
use super::Accelerator;

/// Epoch-sized view over an endless [`CocoPipeline`].
///
/// The pipeline reads its shard cyclically, so an epoch here is simply
/// `size` images: iteration stops once that many have been produced, and
/// [`reset`](Self::reset) starts the next epoch with the overshoot of the
/// last batch carried over. One run is always scheduled ahead of the batch
/// being consumed.
///
/// A run that fails (unreadable image, transform error) yields one `Err`
/// and iteration continues. A run that never arrives within the pipeline
/// timeout yields one `Err` and ends the epoch.
///
/// ```ignore
/// for epoch in 0..epochs {
///     for batch in &mut train_iter {
///         let batch = batch?;
///     }
///     train_iter.reset();
/// }
/// ```
#[derive(Debug)]
pub struct PipelineIterator {
    pipeline: CocoPipeline,
    size: usize,
    counter: usize,
    stalled: bool,
    accelerator: Accelerator,
    device: Option<Device>,
}

impl PipelineIterator {
    /// Wraps a built pipeline and schedules the first run.
    ///
    /// # Errors
    /// - `size == 0`
    /// - [`DataError::DeviceUnavailable`] for [`Accelerator::Gpu`] when CUDA
    ///   or the pipeline's device ordinal is absent
    /// - [`DataError::PipelineState`] if the pipeline was not built
    pub fn new(mut pipeline: CocoPipeline, size: usize, accelerator: Accelerator) -> Result<Self> {
        ensure!(size > 0, "Pipeline epoch size must be > 0");
        let device = match accelerator {
            Accelerator::Gpu => Some(cuda_device(pipeline.config().device_id)?),
            Accelerator::Mlu => {
                tracing::info!("MLU target has no libtorch device; batches stay in host memory");
                None
            }
        };
        pipeline.schedule_run()?;

        Ok(Self {
            pipeline,
            size,
            counter: 0,
            stalled: false,
            accelerator,
            device,
        })
    }

    /// Images per epoch.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    pub fn batch_size(&self) -> usize {
        self.pipeline.batch_size()
    }

    /// Batches per epoch.
    pub fn len(&self) -> usize {
        self.size.div_ceil(self.pipeline.batch_size())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the current epoch has produced `size` images or was cut
    /// short by a stalled run.
    pub fn epoch_done(&self) -> bool {
        self.stalled || self.counter >= self.size
    }

    /// Starts the next epoch once the current one is exhausted.
    ///
    /// Images produced past the end of the last epoch count towards the next.
    /// After a stall the next epoch starts from zero.
    /// Calling this mid-epoch does nothing.
    pub fn reset(&mut self) {
        if self.stalled {
            self.stalled = false;
            self.counter = 0;
        } else if self.counter >= self.size {
            self.counter %= self.size;
        } else {
            tracing::warn!(
                produced = self.counter,
                size = self.size,
                "Ignoring reset of a pipeline iterator in the middle of an epoch"
            );
        }
    }

    /// Schedules a run if none is pending.
    fn top_up(&mut self) -> Result<()> {
        if self.pipeline.pending_runs() == 0 {
            self.pipeline.schedule_run()?;
        }
        Ok(())
    }

    /// Takes the oldest run and keeps one scheduled behind it, whether the
    /// run succeeded or failed. A timed-out run stays pending and is taken
    /// by the next call.
    fn fetch(&mut self) -> Result<MiniBatch> {
        if let Err(e) = self.top_up() {
            self.stalled = true;
            return Err(e);
        }
        let pending = self.pipeline.pending_runs();
        let shared = self.pipeline.share_outputs().map(MiniBatch::shallow_clone);
        // A failed run still used up its images; a late one did not.
        if self.pipeline.pending_runs() < pending {
            self.counter += self.pipeline.batch_size();
        } else if shared.is_err() {
            self.stalled = true;
        }
        if shared.is_ok() {
            self.pipeline.release_outputs()?;
        }
        // Retried by the next fetch; the batch in hand is still good.
        if let Err(e) = self.top_up() {
            tracing::warn!(error = %format!("{:#}", e), "Failed to schedule the next pipeline run");
        }
        let batch = shared?;
        Ok(match self.device {
            Some(device) => batch.to_device(device),
            None => batch,
        })
    }
}

fn cuda_device(ordinal: usize) -> Result<Device> {
    if !Cuda::is_available() {
        return Err(DataError::DeviceUnavailable("CUDA is not available".to_string()).into());
    }
    let count = Cuda::device_count();
    if ordinal as i64 >= count {
        return Err(DataError::DeviceUnavailable(format!(
            "cuda:{} requested but only {} device(s) present",
            ordinal, count
        ))
        .into());
    }
    Ok(Device::Cuda(ordinal))
}

impl Iterator for PipelineIterator {
    type Item = Result<MiniBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.epoch_done() {
            return None;
        }
        Some(self.fetch())
    }
}
