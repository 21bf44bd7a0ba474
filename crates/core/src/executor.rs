//! Sequential batch loop over the tile grid.
//!
//! One run owns one [`UpscaleState`]. Batches are taken in raster order,
//! transformed, checked, stitched, and only then is the next batch started.
//! An OOM shrinks the plan and resumes at the current position; a tile-size
//! change rebuilds the grid and skips source area that is already stitched.

use std::time::Instant;

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coerce::extract_images;
use crate::coverage::CoverageMask;
use crate::degenerate::is_degenerate;
use crate::error::{classify, FailureKind, UpscaleError};
use crate::fallback::{fallback_upscale_with, FilterResampler, Resampler, PLACEHOLDER_PIXEL};
use crate::geometry::{build_tiles, validate_geometry};
use crate::recovery::{handle_oom, RecoveryConfig, RecoveryInput};
use crate::stitch::{expected_tile_size, paste_tile};
use crate::transform::{TileTransform, TransformRequest};
use crate::types::{StepProgress, Tile, TileOptions, TransformOutput, UpscaleParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Init,
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Mutable state of a single upscale run.
pub struct UpscaleState {
    pub output_canvas: RgbImage,
    /// Pending grid. After a rebuild it holds only tiles not yet covered.
    pub tiles: Vec<Tile>,
    /// Position of the next batch inside `tiles`.
    pub cursor: usize,
    pub total_tiles: usize,
    pub processed_tiles: usize,
    pub current_tile_size: u32,
    pub current_batch_size: usize,
    pub reductions_remaining: u32,
    pub overlap: u32,
    pub scale_factor: u32,
    pub coverage: CoverageMask,
    pub run_state: RunState,
}

impl UpscaleState {
    pub fn new(
        source: &RgbImage,
        options: &TileOptions,
        recovery: &RecoveryConfig,
    ) -> Result<Self, UpscaleError> {
        validate_geometry(options.tile_size, options.overlap)?;
        if options.scale_factor == 0 {
            return Err(UpscaleError::InvalidGeometry(
                "scale_factor must be positive".to_string(),
            ));
        }
        if options.tile_batch_size == 0 {
            return Err(UpscaleError::InvalidGeometry(
                "tile_batch_size must be positive".to_string(),
            ));
        }

        let (width, height) = source.dimensions();
        let out_w = width.checked_mul(options.scale_factor);
        let out_h = height.checked_mul(options.scale_factor);
        let (Some(out_w), Some(out_h)) = (out_w, out_h) else {
            return Err(UpscaleError::InvalidGeometry(format!(
                "{width}x{height} scaled by {} overflows",
                options.scale_factor
            )));
        };

        let tiles = build_tiles(source, options.tile_size, options.overlap)?;
        Ok(Self {
            output_canvas: RgbImage::new(out_w, out_h),
            total_tiles: tiles.len(),
            tiles,
            cursor: 0,
            processed_tiles: 0,
            current_tile_size: options.tile_size,
            current_batch_size: options.tile_batch_size,
            reductions_remaining: recovery.max_reductions,
            overlap: options.overlap,
            scale_factor: options.scale_factor,
            coverage: CoverageMask::new(width, height),
            run_state: RunState::Init,
        })
    }

    /// Percentage of tiles stitched so far.
    pub fn progress_percent(&self) -> f32 {
        if self.total_tiles == 0 {
            return 0.0;
        }
        (self.processed_tiles as f32 / self.total_tiles as f32 * 100.0).clamp(0.0, 100.0)
    }
}

/// Optional observers for a run.
#[derive(Default)]
pub struct UpscaleCallbacks<'a> {
    /// `(processed_tiles, total_tiles)` after every pasted tile.
    pub on_progress: Option<Box<dyn FnMut(usize, usize) + Send + 'a>>,
    /// Step progress forwarded from inside the transform.
    pub on_step: Option<Box<dyn FnMut(StepProgress) + Send + 'a>>,
    /// Read-only view of the canvas after each stitched batch.
    pub on_preview: Option<Box<dyn FnMut(&RgbImage) + Send + 'a>>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpscaleReport {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub total_tiles: usize,
    pub processed_tiles: usize,
    pub batches_attempted: usize,
    pub fallback_batches: usize,
    pub reductions_used: u32,
    pub final_tile_size: u32,
    pub final_batch_size: usize,
    pub final_state: RunState,
}

impl UpscaleReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            elapsed_ms: 0,
            total_tiles: 0,
            processed_tiles: 0,
            batches_attempted: 0,
            fallback_batches: 0,
            reductions_used: 0,
            final_tile_size: 0,
            final_batch_size: 0,
            final_state: RunState::Init,
        }
    }
}

pub struct BatchExecutor<'r, T: TileTransform + ?Sized> {
    transform: &'r mut T,
    params: &'r UpscaleParams,
    recovery: RecoveryConfig,
    resampler: FilterResampler,
    callbacks: UpscaleCallbacks<'r>,
    cancel: &'r CancellationToken,
    report: UpscaleReport,
}

impl<'r, T: TileTransform + ?Sized> BatchExecutor<'r, T> {
    pub fn new(
        transform: &'r mut T,
        params: &'r UpscaleParams,
        recovery: RecoveryConfig,
        callbacks: UpscaleCallbacks<'r>,
        cancel: &'r CancellationToken,
    ) -> Self {
        Self {
            transform,
            params,
            recovery,
            resampler: FilterResampler::default(),
            callbacks,
            cancel,
            report: UpscaleReport::new(),
        }
    }

    pub fn with_resampler(mut self, resampler: FilterResampler) -> Self {
        self.resampler = resampler;
        self
    }

    /// Drive `state` to completion. On error the state records `Cancelled`
    /// or `Failed` and the report is still available via [`Self::report`].
    pub fn run(
        &mut self,
        source: &RgbImage,
        state: &mut UpscaleState,
    ) -> Result<(), UpscaleError> {
        let started = Instant::now();
        state.run_state = RunState::Running;
        info!(
            transform = self.transform.name(),
            width = source.width(),
            height = source.height(),
            tiles = state.total_tiles,
            tile_size = state.current_tile_size,
            overlap = state.overlap,
            batch_size = state.current_batch_size,
            scale = state.scale_factor,
            "Starting tiled upscale"
        );

        let result = self.run_batches(source, state);

        self.report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.report.total_tiles = state.total_tiles;
        self.report.processed_tiles = state.processed_tiles;
        self.report.final_tile_size = state.current_tile_size;
        self.report.final_batch_size = state.current_batch_size;
        self.report.final_state = state.run_state;

        if result.is_ok() {
            info!(
                tiles = state.processed_tiles,
                batches = self.report.batches_attempted,
                fallback_batches = self.report.fallback_batches,
                reductions = self.report.reductions_used,
                elapsed_ms = self.report.elapsed_ms,
                "Tiled upscale completed"
            );
        }
        result
    }

    pub fn report(&self) -> &UpscaleReport {
        &self.report
    }

    fn run_batches(
        &mut self,
        source: &RgbImage,
        state: &mut UpscaleState,
    ) -> Result<(), UpscaleError> {
        while state.cursor < state.tiles.len() {
            if self.cancel.is_cancelled() {
                return Err(cancelled(state));
            }

            let start = state.cursor;
            let end = (start + state.current_batch_size).min(state.tiles.len());
            let first_tile = state.processed_tiles;
            debug!(
                first_tile,
                batch_len = end - start,
                tile_size = state.current_tile_size,
                progress = %format!("{:.1}%", state.progress_percent()),
                "Running batch"
            );

            let attempt = {
                let crops: Vec<&RgbImage> = state.tiles[start..end].iter().map(|t| &t.crop).collect();
                let request = TransformRequest {
                    crops: &crops,
                    params: self.params,
                    scale_factor: state.scale_factor,
                    first_tile,
                    cancel: self.cancel,
                };
                let on_step = &mut self.callbacks.on_step;
                let mut forward = |progress: StepProgress| {
                    if let Some(callback) = on_step.as_mut() {
                        callback(progress);
                    }
                };
                self.transform.transform(&request, &mut forward)
            };
            self.transform.reclaim_memory();
            self.report.batches_attempted += 1;

            match attempt {
                Ok(output) => self.stitch_batch(state, start, end, output)?,
                Err(error) => match classify(&error) {
                    FailureKind::Cancelled => {
                        info!(first_tile, "Transform reported cancellation");
                        return Err(cancelled(state));
                    }
                    FailureKind::ResourceExhausted => self.recover(source, state, error)?,
                    FailureKind::Degenerate | FailureKind::Generic => {
                        error!(tile_index = first_tile, error = %format!("{error:#}"), "Transform failed");
                        state.run_state = RunState::Failed;
                        return Err(UpscaleError::Transform {
                            tile_index: first_tile,
                            source: error,
                        });
                    }
                },
            }
        }

        state.run_state = RunState::Completed;
        Ok(())
    }

    fn stitch_batch(
        &mut self,
        state: &mut UpscaleState,
        start: usize,
        end: usize,
        output: TransformOutput,
    ) -> Result<(), UpscaleError> {
        let batch_len = end - start;
        let produced = extract_images(output).map_err(|error| {
            error!(tile_index = state.processed_tiles, %error, "Could not read transform output");
            state.run_state = RunState::Failed;
            error
        })?;

        if produced.len() != batch_len {
            state.run_state = RunState::Failed;
            return Err(UpscaleError::Format(format!(
                "transform returned {} images for {batch_len} tiles",
                produced.len()
            )));
        }

        let produced = if is_degenerate(&produced) {
            warn!(
                first_tile = state.processed_tiles,
                batch_len,
                kind = FailureKind::Degenerate.as_str(),
                "Transform produced all-black tiles, falling back to interpolation"
            );
            self.report.fallback_batches += 1;
            let crops: Vec<RgbImage> = state.tiles[start..end].iter().map(|t| t.crop.clone()).collect();
            fallback_upscale_with(&self.resampler, &crops, state.scale_factor)
        } else {
            produced
        };

        for (offset, tile_image) in produced.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(cancelled(state));
            }

            let source_box = state.tiles[start + offset].source_box;
            let (want_w, want_h) = expected_tile_size(source_box, state.scale_factor);
            let tile_image = if tile_image.dimensions() == (want_w, want_h) {
                tile_image
            } else {
                self.conform(tile_image, want_w, want_h, state.processed_tiles)
            };

            paste_tile(&mut state.output_canvas, &tile_image, source_box, state.scale_factor);
            state.coverage.mark(source_box);
            state.processed_tiles += 1;
            state.cursor += 1;

            if let Some(callback) = self.callbacks.on_progress.as_mut() {
                callback(state.processed_tiles, state.total_tiles);
            }
        }

        if let Some(callback) = self.callbacks.on_preview.as_mut() {
            callback(&state.output_canvas);
        }
        Ok(())
    }

    /// Resample a tile whose size does not match its destination box.
    fn conform(&self, tile_image: RgbImage, width: u32, height: u32, tile_index: usize) -> RgbImage {
        warn!(
            tile_index,
            got_w = tile_image.width(),
            got_h = tile_image.height(),
            want_w = width,
            want_h = height,
            "Transform output has unexpected size, resampling"
        );
        match self.resampler.resample(&tile_image, width, height) {
            Ok(resized) => resized,
            Err(error) => {
                warn!(tile_index, error = %format!("{error:#}"), "Resample failed, using placeholder");
                RgbImage::from_pixel(width, height, PLACEHOLDER_PIXEL)
            }
        }
    }

    fn recover(
        &mut self,
        source: &RgbImage,
        state: &mut UpscaleState,
        error: anyhow::Error,
    ) -> Result<(), UpscaleError> {
        warn!(
            tile_index = state.processed_tiles,
            tile_size = state.current_tile_size,
            batch_size = state.current_batch_size,
            reductions_remaining = state.reductions_remaining,
            error = %format!("{error:#}"),
            "Out of memory during batch"
        );

        let input = RecoveryInput {
            batch_size: state.current_batch_size,
            tile_size: state.current_tile_size,
            overlap: state.overlap,
            reductions_remaining: state.reductions_remaining,
        };
        let Some(plan) = handle_oom(&input, &self.recovery) else {
            error!(tile_index = state.processed_tiles, "Out of memory and no reductions left");
            state.run_state = RunState::Failed;
            return Err(UpscaleError::ResourceExhausted {
                tile_index: state.processed_tiles,
                tile_size: state.current_tile_size,
                batch_size: state.current_batch_size,
                source: error,
            });
        };

        self.report.reductions_used += 1;
        state.current_batch_size = plan.batch_size;
        state.reductions_remaining = plan.reductions_remaining;

        if plan.requires_rebuild() {
            state.current_tile_size = plan.tile_size;
            let grid = build_tiles(source, plan.tile_size, state.overlap)?;
            let grid_len = grid.len();
            state.tiles = state.coverage.remaining(grid);
            state.cursor = 0;
            state.total_tiles = state.processed_tiles + state.tiles.len();
            info!(
                tile_size = plan.tile_size,
                grid_tiles = grid_len,
                remaining = state.tiles.len(),
                covered_pixels = state.coverage.covered_pixels(),
                "Rebuilt tile grid for remaining area"
            );
        }
        Ok(())
    }
}

fn cancelled(state: &mut UpscaleState) -> UpscaleError {
    state.run_state = RunState::Cancelled;
    info!(
        processed = state.processed_tiles,
        total = state.total_tiles,
        progress = %format!("{:.1}%", state.progress_percent()),
        "Upscale cancelled"
    );
    UpscaleError::Cancelled {
        processed_tiles: state.processed_tiles,
        total_tiles: state.total_tiles,
        partial: Box::new(std::mem::replace(
            &mut state.output_canvas,
            RgbImage::new(0, 0),
        )),
    }
}
