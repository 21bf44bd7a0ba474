//! Error taxonomy for the upscaling pipeline.
//!
//! Transforms report failures as `anyhow::Error`. The executor turns each one
//! into a [`FailureKind`] once, at the call boundary, and every later decision
//! (retry, shrink, propagate) matches on that kind instead of re-inspecting
//! the error.

use image::RgbImage;
use thiserror::Error;

/// Typed failures a transform can return to make its intent explicit.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("transform cancelled")]
    Cancelled,

    #[error("out of memory: {detail}")]
    OutOfMemory { detail: String },
}

/// Closed classification of anything that goes wrong around a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Cancelled,
    ResourceExhausted,
    Degenerate,
    Generic,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Degenerate => "degenerate",
            Self::Generic => "generic",
        }
    }
}

/// Message fragments that identify an allocator / device memory failure
/// raised by an untyped backend error.
const OOM_MARKERS: [&str; 6] = [
    "out of memory",
    "outofmemory",
    "oom",
    "allocation failed",
    "failed to allocate",
    "memory allocation",
];

const CANCEL_MARKERS: [&str; 2] = ["interrupted", "cancelled"];

/// Classify a transform failure.
///
/// Typed [`TransformError`]s anywhere in the chain win; otherwise the
/// rendered chain is matched against known OOM and interrupt messages.
pub fn classify(error: &anyhow::Error) -> FailureKind {
    for cause in error.chain() {
        if let Some(typed) = cause.downcast_ref::<TransformError>() {
            return match typed {
                TransformError::Cancelled => FailureKind::Cancelled,
                TransformError::OutOfMemory { .. } => FailureKind::ResourceExhausted,
            };
        }
    }

    // Driver codes such as `CUDA_ERROR_OUT_OF_MEMORY` spell words with `_`.
    let message = format!("{error:#}").to_ascii_lowercase().replace('_', " ");
    if OOM_MARKERS
        .iter()
        .any(|marker| contains_word(&message, marker))
    {
        return FailureKind::ResourceExhausted;
    }
    if CANCEL_MARKERS.iter().any(|marker| message.contains(marker)) {
        return FailureKind::Cancelled;
    }

    FailureKind::Generic
}

/// Word-boundary match so that e.g. "room" is not read as "oom".
fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |ch| !ch.is_ascii_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |ch| !ch.is_ascii_alphanumeric());
        before_ok && after_ok
    })
}

#[derive(Debug, Error)]
pub enum UpscaleError {
    /// Cooperative cancellation. `partial` holds whatever had been stitched.
    #[error("upscale cancelled after {processed_tiles} of {total_tiles} tiles")]
    Cancelled {
        processed_tiles: usize,
        total_tiles: usize,
        partial: Box<RgbImage>,
    },

    #[error(
        "out of memory at tile {tile_index} with tile_size={tile_size}, batch_size={batch_size}; no reductions left"
    )]
    ResourceExhausted {
        tile_index: usize,
        tile_size: u32,
        batch_size: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("unrecognized transform output: {0}")]
    Format(String),

    #[error("transform failed at tile {tile_index}: {source:#}")]
    Transform {
        tile_index: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid tile geometry: {0}")]
    InvalidGeometry(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl UpscaleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Cancelled { .. } => FailureKind::Cancelled,
            Self::ResourceExhausted { .. } => FailureKind::ResourceExhausted,
            Self::Format(_)
            | Self::Transform { .. }
            | Self::InvalidGeometry(_)
            | Self::Config(_) => FailureKind::Generic,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Context};

    #[test]
    fn typed_errors_classify_directly() {
        let cancelled = anyhow::Error::new(TransformError::Cancelled);
        assert_eq!(classify(&cancelled), FailureKind::Cancelled);

        let oom = anyhow::Error::new(TransformError::OutOfMemory {
            detail: "tile too large".to_string(),
        });
        assert_eq!(classify(&oom), FailureKind::ResourceExhausted);
    }

    #[test]
    fn typed_error_behind_context_is_found() {
        let result: Result<(), TransformError> = Err(TransformError::OutOfMemory {
            detail: "2 GiB".to_string(),
        });
        let error = result.context("running batch 3").unwrap_err();
        assert_eq!(classify(&error), FailureKind::ResourceExhausted);
    }

    #[test]
    fn untyped_messages_are_inspected() {
        assert_eq!(
            classify(&anyhow!("CUDA out of memory. Tried to allocate 2.00 GiB")),
            FailureKind::ResourceExhausted
        );
        assert_eq!(
            classify(&anyhow!("device OOM while running decoder")),
            FailureKind::ResourceExhausted
        );
        assert_eq!(
            classify(&anyhow!("operation interrupted by user")),
            FailureKind::Cancelled
        );
        assert_eq!(
            classify(&anyhow!("shape mismatch in conv layer")),
            FailureKind::Generic
        );
    }

    #[test]
    fn driver_error_codes_are_resource_exhaustion() {
        assert_eq!(
            classify(&anyhow!("CUDA_ERROR_OUT_OF_MEMORY")),
            FailureKind::ResourceExhausted
        );
        assert_eq!(
            classify(&anyhow!("cuMemAlloc failed: CUDA_ERROR_OUT_OF_MEMORY (code 2)")),
            FailureKind::ResourceExhausted
        );
        assert_eq!(
            classify(&anyhow!("CUDA_ERROR_ILLEGAL_ADDRESS")),
            FailureKind::Generic
        );
    }

    #[test]
    fn oom_marker_requires_word_boundary() {
        assert_eq!(
            classify(&anyhow!("no room left in the queue")),
            FailureKind::Generic
        );
    }

    #[test]
    fn upscale_error_kinds() {
        let err = UpscaleError::Format("empty".to_string());
        assert_eq!(err.kind(), FailureKind::Generic);
        assert!(!err.is_cancelled());

        let err = UpscaleError::Cancelled {
            processed_tiles: 2,
            total_tiles: 10,
            partial: Box::new(RgbImage::new(1, 1)),
        };
        assert!(err.is_cancelled());
        assert_eq!(err.kind(), FailureKind::Cancelled);
        assert!(err.to_string().contains("2 of 10"));
    }
}
