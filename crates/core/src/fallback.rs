//! Deterministic interpolation upscaling used when the transform output
//! cannot be trusted.

use anyhow::{bail, Context, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tracing::warn;

/// Placeholder color for tiles that could not be resampled.
pub const PLACEHOLDER_PIXEL: Rgb<u8> = Rgb([255, 255, 255]);

/// Resampling backend; a seam so failures can be injected.
pub trait Resampler {
    fn resample(&self, image: &RgbImage, width: u32, height: u32) -> Result<RgbImage>;
}

/// `image::imageops::resize` with a fixed filter.
#[derive(Debug, Clone, Copy)]
pub struct FilterResampler {
    pub filter: FilterType,
}

impl Default for FilterResampler {
    fn default() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }
}

impl Resampler for FilterResampler {
    fn resample(&self, image: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
        if image.width() == 0 || image.height() == 0 {
            bail!(
                "cannot resample empty image ({}x{})",
                image.width(),
                image.height()
            );
        }
        if width == 0 || height == 0 {
            bail!("target size {width}x{height} is empty");
        }
        Ok(imageops::resize(image, width, height, self.filter))
    }
}

/// Parse a filter name; unknown names fall back to Lanczos3.
pub fn filter_from_str_lossy(name: &str) -> FilterType {
    match name.to_lowercase().as_str() {
        "nearest" | "neighbor" | "nn" => FilterType::Nearest,
        "bilinear" | "triangle" | "linear" => FilterType::Triangle,
        "bicubic" | "cubic" | "catmullrom" | "catmull-rom" => FilterType::CatmullRom,
        "gaussian" => FilterType::Gaussian,
        _ => FilterType::Lanczos3,
    }
}

fn scaled_dims(image: &RgbImage, scale: u32) -> Result<(u32, u32)> {
    let w = image
        .width()
        .checked_mul(scale)
        .context("scaled width overflows u32")?;
    let h = image
        .height()
        .checked_mul(scale)
        .context("scaled height overflows u32")?;
    Ok((w, h))
}

/// Upscale every image by `scale` with the default Lanczos3 resampler.
pub fn fallback_upscale(images: &[RgbImage], scale: u32) -> Vec<RgbImage> {
    fallback_upscale_with(&FilterResampler::default(), images, scale)
}

/// Upscale every image by `scale`. Always returns exactly one image per
/// input; an image that fails to resample becomes a white placeholder of the
/// expected output size.
pub fn fallback_upscale_with(
    resampler: &dyn Resampler,
    images: &[RgbImage],
    scale: u32,
) -> Vec<RgbImage> {
    images
        .iter()
        .enumerate()
        .map(|(index, image)| {
            let result = scaled_dims(image, scale)
                .and_then(|(w, h)| resampler.resample(image, w, h));
            match result {
                Ok(resized) => resized,
                Err(error) => {
                    warn!(index, error = %format!("{error:#}"), "Fallback resample failed, using placeholder");
                    let w = image.width().saturating_mul(scale);
                    let h = image.height().saturating_mul(scale);
                    RgbImage::from_pixel(w, h, PLACEHOLDER_PIXEL)
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    /// Fails on the n-th call, otherwise delegates to nearest-neighbor.
    struct FailingResampler {
        fail_on: usize,
        calls: Cell<usize>,
    }

    impl Resampler for FailingResampler {
        fn resample(&self, image: &RgbImage, width: u32, height: u32) -> Result<RgbImage> {
            let call = self.calls.get();
            self.calls.set(call + 1);
            if call == self.fail_on {
                bail!("simulated resample failure");
            }
            Ok(imageops::resize(image, width, height, FilterType::Nearest))
        }
    }

    #[test]
    fn test_fallback_output_sizes() {
        let images = vec![RgbImage::new(3, 5), RgbImage::new(16, 16)];
        let out = fallback_upscale(&images, 4);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].dimensions(), (12, 20));
        assert_eq!(out[1].dimensions(), (64, 64));
    }

    #[test]
    fn test_fallback_solid_color_preserved() {
        let images = vec![RgbImage::from_pixel(8, 8, Rgb([40, 90, 200]))];
        let out = fallback_upscale(&images, 2);
        assert!(out[0].pixels().all(|p| {
            p.0.iter()
                .zip([40u8, 90, 200])
                .all(|(&a, b)| (a as i16 - b as i16).abs() <= 1)
        }));
    }

    #[test]
    fn test_fallback_failure_keeps_count_and_uses_placeholder() {
        let images = vec![
            RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])),
            RgbImage::from_pixel(6, 2, Rgb([1, 2, 3])),
            RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])),
        ];
        let resampler = FailingResampler {
            fail_on: 1,
            calls: Cell::new(0),
        };
        let out = fallback_upscale_with(&resampler, &images, 4);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].dimensions(), (24, 8));
        assert!(out[1].pixels().all(|p| *p == PLACEHOLDER_PIXEL));
        assert_eq!(out[0].get_pixel(0, 0).0, [1, 2, 3]);
        assert_eq!(out[2].get_pixel(15, 15).0, [1, 2, 3]);
    }

    #[test]
    fn test_empty_image_becomes_empty_placeholder() {
        let out = fallback_upscale(&[RgbImage::new(0, 4)], 4);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].dimensions(), (0, 16));
    }

    #[test]
    fn test_filter_from_str() {
        assert_eq!(filter_from_str_lossy("nearest"), FilterType::Nearest);
        assert_eq!(filter_from_str_lossy("Bilinear"), FilterType::Triangle);
        assert_eq!(filter_from_str_lossy("bicubic"), FilterType::CatmullRom);
        assert_eq!(filter_from_str_lossy("lanczos"), FilterType::Lanczos3);
        assert_eq!(filter_from_str_lossy("unknown"), FilterType::Lanczos3);
    }
}
