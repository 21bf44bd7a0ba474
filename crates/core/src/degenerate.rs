//! Detection of batches that "succeeded" with all-black output.

use image::RgbImage;

/// True when the batch is non-empty and every image is entirely zero.
///
/// Only total-black output is caught; partial corruption passes. An empty
/// batch is reported as not degenerate.
pub fn is_degenerate(images: &[RgbImage]) -> bool {
    !images.is_empty() && images.iter().all(is_black)
}

fn is_black(image: &RgbImage) -> bool {
    image.as_raw().iter().all(|&v| v == 0)
}

#[cfg(test)]
mod tests {
    use image::Rgb;

    use super::*;

    #[test]
    fn test_all_black_batch_is_degenerate() {
        let batch = vec![RgbImage::new(4, 4), RgbImage::new(8, 2)];
        assert!(is_degenerate(&batch));
    }

    #[test]
    fn test_single_nonzero_pixel_anywhere_is_not_degenerate() {
        let mut lit = RgbImage::new(4, 4);
        lit.put_pixel(3, 3, Rgb([0, 0, 1]));
        let batch = vec![RgbImage::new(4, 4), lit];
        assert!(!is_degenerate(&batch));
    }

    #[test]
    fn test_empty_batch_is_not_degenerate() {
        assert!(!is_degenerate(&[]));
    }
}
