//! The outbound seam: the per-batch image-to-image transform.
//!
//! The pipeline does not know whether a transform is a diffusion model, a
//! classical resampler or a test stub. It only hands over crops and
//! parameters and expects one output image per crop.

use anyhow::Result;
use image::imageops::FilterType;
use image::RgbImage;
use tokio_util::sync::CancellationToken;

use crate::error::TransformError;
use crate::fallback::{FilterResampler, Resampler};
use crate::types::{ImageValue, StepProgress, TransformOutput, UpscaleParams};

/// Everything a transform receives for one batch.
pub struct TransformRequest<'a> {
    pub crops: &'a [&'a RgbImage],
    pub params: &'a UpscaleParams,
    pub scale_factor: u32,
    /// Number of tiles completed before this batch.
    pub first_tile: usize,
    /// Same token the run observes; long-running transforms should poll it
    /// and return [`TransformError::Cancelled`].
    pub cancel: &'a CancellationToken,
}

pub trait TileTransform: Send {
    /// Process one batch. `on_step` may be called from inside for
    /// fine-grained progress and must stay cheap.
    fn transform(
        &mut self,
        request: &TransformRequest<'_>,
        on_step: &mut dyn FnMut(StepProgress),
    ) -> Result<TransformOutput>;

    /// Release cached device memory. Called after every batch attempt.
    fn reclaim_memory(&mut self) {}

    fn name(&self) -> &str {
        "transform"
    }
}

/// Non-generative transform: resamples every crop by the scale factor.
pub struct ResampleTransform {
    resampler: FilterResampler,
}

impl ResampleTransform {
    pub fn new(filter: FilterType) -> Self {
        Self {
            resampler: FilterResampler { filter },
        }
    }
}

impl Default for ResampleTransform {
    fn default() -> Self {
        Self::new(FilterType::Lanczos3)
    }
}

impl TileTransform for ResampleTransform {
    fn transform(
        &mut self,
        request: &TransformRequest<'_>,
        on_step: &mut dyn FnMut(StepProgress),
    ) -> Result<TransformOutput> {
        let total_steps = request.crops.len() as u32;
        let mut images = Vec::with_capacity(request.crops.len());
        for (i, crop) in request.crops.iter().enumerate() {
            if request.cancel.is_cancelled() {
                return Err(TransformError::Cancelled.into());
            }
            let resized = self.resampler.resample(
                crop,
                crop.width() * request.scale_factor,
                crop.height() * request.scale_factor,
            )?;
            images.push(ImageValue::Rgb(resized));
            on_step(StepProgress {
                first_tile: request.first_tile,
                batch_len: request.crops.len(),
                step: i as u32 + 1,
                total_steps,
            });
        }
        Ok(TransformOutput::Pipeline { images })
    }

    fn name(&self) -> &str {
        "resample"
    }
}
