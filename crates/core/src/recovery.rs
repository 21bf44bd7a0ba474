//! Out-of-memory recovery: trade throughput for headroom, within a budget.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Knobs for the shrink policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// How many reductions a single run may apply before an OOM is fatal.
    pub max_reductions: u32,
    /// Pixels removed from the tile size per reduction once batch size is 1.
    pub tile_size_decrement: u32,
    /// Smallest tile size recovery will shrink to.
    pub min_tile_size: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_reductions: 4,
            tile_size_decrement: 32,
            min_tile_size: 64,
        }
    }
}

/// Execution parameters at the moment of the OOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryInput {
    pub batch_size: usize,
    pub tile_size: u32,
    pub overlap: u32,
    pub reductions_remaining: u32,
}

/// What to shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    BatchSize { from: usize, to: usize },
    TileSize { from: u32, to: u32 },
}

/// A smaller plan to resume with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub batch_size: usize,
    pub tile_size: u32,
    pub reductions_remaining: u32,
    pub reduction: Reduction,
}

impl RecoveryPlan {
    /// The tile grid must be rebuilt when the tile size changed.
    pub fn requires_rebuild(&self) -> bool {
        matches!(self.reduction, Reduction::TileSize { .. })
    }
}

/// Smallest tile size allowed for a given overlap.
fn tile_size_floor(config: &RecoveryConfig, overlap: u32) -> u32 {
    config.min_tile_size.max(overlap + 1).max(1)
}

/// Decide how to continue after an OOM, or `None` when the failure is fatal.
///
/// Halves the batch size first; once it is 1, shrinks the tile size by
/// `tile_size_decrement` down to the floor. Each step costs one reduction.
pub fn handle_oom(input: &RecoveryInput, config: &RecoveryConfig) -> Option<RecoveryPlan> {
    if input.reductions_remaining == 0 {
        warn!(
            batch_size = input.batch_size,
            tile_size = input.tile_size,
            "OOM recovery budget exhausted"
        );
        return None;
    }

    let reductions_remaining = input.reductions_remaining - 1;

    if input.batch_size > 1 {
        let to = (input.batch_size / 2).max(1);
        info!(from = input.batch_size, to, reductions_remaining, "OOM: halving batch size");
        return Some(RecoveryPlan {
            batch_size: to,
            tile_size: input.tile_size,
            reductions_remaining,
            reduction: Reduction::BatchSize {
                from: input.batch_size,
                to,
            },
        });
    }

    let floor = tile_size_floor(config, input.overlap);
    if input.tile_size <= floor || config.tile_size_decrement == 0 {
        warn!(
            tile_size = input.tile_size,
            floor, "OOM at minimum batch and tile size"
        );
        return None;
    }

    let to = input
        .tile_size
        .saturating_sub(config.tile_size_decrement)
        .max(floor);
    info!(from = input.tile_size, to, reductions_remaining, "OOM: shrinking tile size");
    Some(RecoveryPlan {
        batch_size: 1,
        tile_size: to,
        reductions_remaining,
        reduction: Reduction::TileSize {
            from: input.tile_size,
            to,
        },
    })
}
