//! Tiled image upscaling with out-of-memory recovery, degenerate-output
//! fallback, cancellation and progress reporting.
//!
//! [`orchestrator::Upscaler`] is the entry point; [`transform::TileTransform`]
//! is the seam a model backend implements.

pub mod coerce;
pub mod config;
pub mod coverage;
pub mod degenerate;
pub mod error;
pub mod executor;
pub mod fallback;
pub mod geometry;
pub mod logging;
pub mod orchestrator;
pub mod recovery;
pub mod stitch;
pub mod transform;
pub mod types;
