//! Public entry point: upscale one image with a tile transform.

use image::RgbImage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::UpscaleError;
use crate::executor::{BatchExecutor, UpscaleCallbacks, UpscaleReport, UpscaleState};
use crate::fallback::FilterResampler;
use crate::recovery::RecoveryConfig;
use crate::types::{TileOptions, UpscaleParams};
use crate::transform::TileTransform;

/// Finished canvas plus run statistics.
#[derive(Debug)]
pub struct UpscaleOutcome {
    pub image: RgbImage,
    pub report: UpscaleReport,
}

/// Owns a transform and the recovery policy; each call is an independent run.
pub struct Upscaler<T: TileTransform> {
    transform: T,
    recovery: RecoveryConfig,
    resampler: FilterResampler,
}

impl<T: TileTransform> Upscaler<T> {
    pub fn new(transform: T) -> Self {
        Self::with_recovery(transform, RecoveryConfig::default())
    }

    pub fn with_recovery(transform: T, recovery: RecoveryConfig) -> Self {
        Self {
            transform,
            recovery,
            resampler: FilterResampler::default(),
        }
    }

    /// Resampler used for degenerate-output fallback and size correction.
    pub fn with_resampler(mut self, resampler: FilterResampler) -> Self {
        self.resampler = resampler;
        self
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }

    pub fn into_transform(self) -> T {
        self.transform
    }

    pub fn upscale(
        &mut self,
        image: &RgbImage,
        params: &UpscaleParams,
        options: &TileOptions,
        callbacks: UpscaleCallbacks<'_>,
        cancel: &CancellationToken,
    ) -> Result<RgbImage, UpscaleError> {
        self.run(image, params, options, callbacks, cancel)
            .map(|outcome| outcome.image)
    }

    pub fn run(
        &mut self,
        image: &RgbImage,
        params: &UpscaleParams,
        options: &TileOptions,
        callbacks: UpscaleCallbacks<'_>,
        cancel: &CancellationToken,
    ) -> Result<UpscaleOutcome, UpscaleError> {
        let mut state = UpscaleState::new(image, options, &self.recovery)?;

        let mut executor =
            BatchExecutor::new(&mut self.transform, params, self.recovery, callbacks, cancel)
                .with_resampler(self.resampler);
        let result = executor.run(image, &mut state);
        let report = executor.report().clone();

        match result {
            Ok(()) => {
                info!(
                    output_width = state.output_canvas.width(),
                    output_height = state.output_canvas.height(),
                    "Upscale finished"
                );
                Ok(UpscaleOutcome {
                    image: state.output_canvas,
                    report,
                })
            }
            Err(error) => {
                if !error.is_cancelled() {
                    warn!(
                        kind = error.kind().as_str(),
                        processed = report.processed_tiles,
                        total = report.total_tiles,
                        "Upscale aborted"
                    );
                }
                Err(error)
            }
        }
    }
}
