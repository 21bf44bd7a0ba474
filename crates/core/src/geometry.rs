//! Tile grid construction.

use image::{imageops, RgbImage};

use crate::error::UpscaleError;
use crate::types::{Tile, TileBox};

/// Check `tile_size > 0` and `overlap < tile_size`.
pub fn validate_geometry(tile_size: u32, overlap: u32) -> Result<(), UpscaleError> {
    if tile_size == 0 {
        return Err(UpscaleError::InvalidGeometry(
            "tile_size must be positive".to_string(),
        ));
    }
    if overlap >= tile_size {
        return Err(UpscaleError::InvalidGeometry(format!(
            "overlap ({overlap}) must be smaller than tile_size ({tile_size})"
        )));
    }
    Ok(())
}

/// Start offsets along one axis. The scan stops at the first span that
/// reaches `len`, so the last span is clamped rather than duplicated.
fn axis_spans(len: u32, tile_size: u32, stride: u32) -> Vec<(u32, u32)> {
    let mut spans = Vec::new();
    let mut start = 0u32;
    loop {
        let end = start.saturating_add(tile_size).min(len);
        spans.push((start, end));
        if end >= len {
            break;
        }
        start += stride;
    }
    spans
}

/// Raster-ordered boxes covering a `width × height` image.
pub fn tile_boxes(
    width: u32,
    height: u32,
    tile_size: u32,
    overlap: u32,
) -> Result<Vec<TileBox>, UpscaleError> {
    validate_geometry(tile_size, overlap)?;
    if width == 0 || height == 0 {
        return Err(UpscaleError::InvalidGeometry(format!(
            "image has no pixels ({width}x{height})"
        )));
    }

    let stride = tile_size - overlap;
    let columns = axis_spans(width, tile_size, stride);
    let rows = axis_spans(height, tile_size, stride);

    let mut boxes = Vec::with_capacity(columns.len() * rows.len());
    for &(y0, y1) in &rows {
        for &(x0, x1) in &columns {
            boxes.push(TileBox::new(x0, y0, x1, y1));
        }
    }
    Ok(boxes)
}

/// Build the tile grid for `image`, each tile carrying an owned crop.
pub fn build_tiles(
    image: &RgbImage,
    tile_size: u32,
    overlap: u32,
) -> Result<Vec<Tile>, UpscaleError> {
    let boxes = tile_boxes(image.width(), image.height(), tile_size, overlap)?;
    Ok(boxes
        .into_iter()
        .map(|source_box| Tile {
            crop: crop_box(image, source_box),
            source_box,
        })
        .collect())
}

pub(crate) fn crop_box(image: &RgbImage, source_box: TileBox) -> RgbImage {
    imageops::crop_imm(
        image,
        source_box.x0,
        source_box.y0,
        source_box.width(),
        source_box.height(),
    )
    .to_image()
}
