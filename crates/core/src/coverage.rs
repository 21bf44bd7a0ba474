//! Source-area bookkeeping across tile-grid rebuilds.
//!
//! Tile indices are not stable once the tile size changes, but the set of
//! source pixels already stitched is. After a rebuild the remaining work is
//! every tile of the new grid whose box is not entirely covered.

use crate::types::{Tile, TileBox};

/// One flag per source pixel, row-major.
#[derive(Debug, Clone)]
pub struct CoverageMask {
    width: u32,
    height: u32,
    covered: Vec<bool>,
    covered_count: u64,
}

impl CoverageMask {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            covered: vec![false; width as usize * height as usize],
            covered_count: 0,
        }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn mark(&mut self, source_box: TileBox) {
        let x1 = source_box.x1.min(self.width);
        let y1 = source_box.y1.min(self.height);
        for y in source_box.y0..y1 {
            let row_start = self.index(source_box.x0, y);
            let row_end = self.index(x1, y);
            for flag in &mut self.covered[row_start..row_end] {
                if !*flag {
                    *flag = true;
                    self.covered_count += 1;
                }
            }
        }
    }

    pub fn is_covered(&self, source_box: TileBox) -> bool {
        let x1 = source_box.x1.min(self.width);
        let y1 = source_box.y1.min(self.height);
        (source_box.y0..y1).all(|y| {
            let row_start = self.index(source_box.x0, y);
            let row_end = self.index(x1, y);
            self.covered[row_start..row_end].iter().all(|&flag| flag)
        })
    }

    pub fn covered_pixels(&self) -> u64 {
        self.covered_count
    }

    pub fn is_complete(&self) -> bool {
        self.covered_count == self.width as u64 * self.height as u64
    }

    /// Drop tiles whose whole source box has already been stitched.
    pub fn remaining(&self, tiles: Vec<Tile>) -> Vec<Tile> {
        tiles
            .into_iter()
            .filter(|tile| !self.is_covered(tile.source_box))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::build_tiles;
    use image::RgbImage;

    #[test]
    fn test_mark_and_query() {
        let mut mask = CoverageMask::new(10, 10);
        assert!(!mask.is_covered(TileBox::new(0, 0, 1, 1)));

        mask.mark(TileBox::new(0, 0, 5, 5));
        assert_eq!(mask.covered_pixels(), 25);
        assert!(mask.is_covered(TileBox::new(1, 1, 4, 4)));
        assert!(!mask.is_covered(TileBox::new(4, 4, 6, 6)));

        mask.mark(TileBox::new(3, 3, 6, 6));
        assert_eq!(mask.covered_pixels(), 25 + 9 - 4);
        assert!(mask.is_covered(TileBox::new(4, 4, 6, 6)));
    }

    #[test]
    fn test_complete() {
        let mut mask = CoverageMask::new(4, 2);
        mask.mark(TileBox::new(0, 0, 4, 1));
        assert!(!mask.is_complete());
        mask.mark(TileBox::new(0, 1, 4, 2));
        assert!(mask.is_complete());
    }

    #[test]
    fn test_remaining_after_rebuild_skips_covered_area() {
        let image = RgbImage::new(256, 256);
        let mut mask = CoverageMask::new(256, 256);

        // First row of a 128/16 grid was stitched before the tile size dropped.
        for tile in build_tiles(&image, 128, 16).unwrap().iter().take(3) {
            mask.mark(tile.source_box);
        }

        let rebuilt = build_tiles(&image, 64, 16).unwrap();
        let remaining = mask.remaining(rebuilt.clone());
        assert!(remaining.len() < rebuilt.len());
        // Rows of the 64/16 grid start at 0, 48, 96, ...; the first two lie
        // inside y < 128 and are already done.
        assert!(remaining.iter().all(|t| t.source_box.y1 > 128));

        let mut check = mask.clone();
        for tile in &remaining {
            check.mark(tile.source_box);
        }
        assert!(check.is_complete());
    }
}
