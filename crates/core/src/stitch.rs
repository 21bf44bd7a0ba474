//! Pasting upscaled tiles into the output canvas.

use image::{imageops, RgbImage};

use crate::types::TileBox;

/// Paste `tile_image` at `source_box * scale_factor`.
///
/// No blending: whatever was in the overlap band is overwritten, so in raster
/// order right/bottom tiles win. Pixels falling outside the canvas are
/// clipped.
pub fn paste_tile(
    output: &mut RgbImage,
    tile_image: &RgbImage,
    source_box: TileBox,
    scale_factor: u32,
) {
    let dest = source_box.scaled(scale_factor);
    imageops::replace(output, tile_image, dest.x0 as i64, dest.y0 as i64);
}

/// Output-space size a tile must have to fill its destination box exactly.
pub fn expected_tile_size(source_box: TileBox, scale_factor: u32) -> (u32, u32) {
    let dest = source_box.scaled(scale_factor);
    (dest.width(), dest.height())
}
