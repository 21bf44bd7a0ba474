//! Normalization of whatever a transform returns into `RgbImage`s.
//!
//! Tensors may come back as `NCHW`, `CHW`, `HWC` or `HW`, as f32 or f16, and
//! in one of three value ranges. The range is guessed from the data:
//!
//! * `min < 0`            → assumed `[-1, 1]`
//! * otherwise `max <= 1.5` → assumed `[0, 1]`
//! * otherwise            → assumed `[0, 255]`
//!
//! A near-uniform gray tensor is ambiguous under this rule and can be
//! rendered too dark or too bright. That is a property of the heuristic, not
//! something the pipeline tries to correct.

use half::f16;
use image::{Rgb, RgbImage};
use ndarray::{Array3, ArrayViewD, Axis, Ix3};
use tracing::trace;

use crate::error::UpscaleError;
use crate::types::{ImageValue, TransformOutput};

const IMAGES_KEY: &str = "images";

/// Upper bound of values treated as unit range.
const UNIT_RANGE_MAX: f32 = 1.5;

/// Flatten a transform result into one image per produced tile.
pub fn extract_images(raw: TransformOutput) -> Result<Vec<RgbImage>, UpscaleError> {
    let values = match raw {
        TransformOutput::Keyed(mut map) => match map.remove(IMAGES_KEY) {
            Some(values) => values,
            None => {
                let mut keys: Vec<_> = map.keys().cloned().collect();
                keys.sort();
                return Err(UpscaleError::Format(format!(
                    "result has no '{IMAGES_KEY}' entry (keys: {keys:?})"
                )));
            }
        },
        TransformOutput::Pipeline { images } => images,
        TransformOutput::Single(value) => vec![value],
        TransformOutput::Sequence(values) => values,
    };

    let mut images = Vec::with_capacity(values.len());
    for value in values {
        images.extend(ensure_images(value)?);
    }
    Ok(images)
}

/// Like [`ensure_image`], but splits a leading batch dimension `N > 1`.
pub fn ensure_images(value: ImageValue) -> Result<Vec<RgbImage>, UpscaleError> {
    match value {
        ImageValue::Bytes(arr) if is_batch(arr.shape()) => arr
            .axis_iter(Axis(0))
            .map(|item| bytes_to_image(item))
            .collect(),
        ImageValue::Float(arr) if is_batch(arr.shape()) => arr
            .axis_iter(Axis(0))
            .map(|item| float_to_image(item))
            .collect(),
        ImageValue::Half(arr) if is_batch(arr.shape()) => {
            let widened = arr.mapv(f16::to_f32);
            widened
                .axis_iter(Axis(0))
                .map(|item| float_to_image(item))
                .collect()
        }
        other => Ok(vec![ensure_image(other)?]),
    }
}

/// Convert a single value to the canonical image type. Canonical images are
/// returned unchanged.
pub fn ensure_image(value: ImageValue) -> Result<RgbImage, UpscaleError> {
    match value {
        ImageValue::Rgb(image) => Ok(image),
        ImageValue::Dynamic(image) => Ok(image.into_rgb8()),
        ImageValue::Bytes(arr) => bytes_to_image(arr.view()),
        ImageValue::Float(arr) => float_to_image(arr.view()),
        ImageValue::Half(arr) => float_to_image(arr.mapv(f16::to_f32).view()),
    }
}

fn is_batch(shape: &[usize]) -> bool {
    shape.len() == 4 && shape[0] > 1
}

fn is_channel_dim(dim: usize) -> bool {
    matches!(dim, 1 | 3 | 4)
}

/// Reshape any supported layout into `HWC`.
///
/// `channels_first` decides which way a 3-D shape is read when both its first
/// and last dimension look like a channel count.
fn to_hwc<T: Clone>(arr: ArrayViewD<'_, T>, channels_first: bool) -> Result<Array3<T>, UpscaleError> {
    let shape = arr.shape().to_vec();
    if shape.iter().any(|&d| d == 0) {
        return Err(UpscaleError::Format(format!("empty array with shape {shape:?}")));
    }

    match shape.len() {
        4 if shape[0] == 1 => to_hwc(arr.index_axis_move(Axis(0), 0), channels_first),
        4 => Err(UpscaleError::Format(format!(
            "batch of {} images where a single image was expected",
            shape[0]
        ))),
        3 => {
            let chw = is_channel_dim(shape[0]);
            let hwc = is_channel_dim(shape[2]);
            let arr3 = arr
                .into_dimensionality::<Ix3>()
                .map_err(|e| UpscaleError::Format(e.to_string()))?;
            if chw && (channels_first || !hwc) {
                Ok(arr3.permuted_axes([1, 2, 0]).to_owned())
            } else if hwc {
                Ok(arr3.to_owned())
            } else {
                Err(UpscaleError::Format(format!(
                    "cannot find a channel axis in shape {shape:?}"
                )))
            }
        }
        2 => {
            let arr3 = arr
                .insert_axis(Axis(2))
                .into_dimensionality::<Ix3>()
                .map_err(|e| UpscaleError::Format(e.to_string()))?;
            Ok(arr3.to_owned())
        }
        n => Err(UpscaleError::Format(format!(
            "unsupported array rank {n} (shape {shape:?})"
        ))),
    }
}

fn hwc_to_image(hwc: &Array3<u8>) -> Result<RgbImage, UpscaleError> {
    let (h, w, c) = hwc.dim();
    let width = u32::try_from(w).map_err(|_| UpscaleError::Format(format!("width {w} too large")))?;
    let height =
        u32::try_from(h).map_err(|_| UpscaleError::Format(format!("height {h} too large")))?;

    // Grayscale is broadcast; a fourth (alpha) channel is dropped.
    Ok(RgbImage::from_fn(width, height, |x, y| {
        let (x, y) = (x as usize, y as usize);
        if c == 1 {
            let v = hwc[[y, x, 0]];
            Rgb([v, v, v])
        } else {
            Rgb([hwc[[y, x, 0]], hwc[[y, x, 1]], hwc[[y, x, 2]]])
        }
    }))
}

/// Integer arrays are taken as already in `0..=255`; they are read
/// channels-last unless only the first axis looks like channels.
fn bytes_to_image(arr: ArrayViewD<'_, u8>) -> Result<RgbImage, UpscaleError> {
    let hwc = to_hwc(arr, false)?;
    hwc_to_image(&hwc)
}

fn float_to_image(arr: ArrayViewD<'_, f32>) -> Result<RgbImage, UpscaleError> {
    let hwc = to_hwc(arr, true)?;

    let (min, max) = hwc
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });

    let range = ValueRange::detect(min, max);
    trace!(min, max, ?range, "Detected tensor value range");

    let bytes = hwc.mapv(|v| range.to_u8(v));
    hwc_to_image(&bytes)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueRange {
    Signed,
    Unit,
    Byte,
}

impl ValueRange {
    fn detect(min: f32, max: f32) -> Self {
        if min < 0.0 {
            Self::Signed
        } else if max <= UNIT_RANGE_MAX {
            Self::Unit
        } else {
            Self::Byte
        }
    }

    fn to_u8(self, v: f32) -> u8 {
        let scaled = match self {
            Self::Signed => (v + 1.0) / 2.0 * 255.0,
            Self::Unit => v * 255.0,
            Self::Byte => v,
        };
        // NaN saturates to 0 on cast.
        scaled.round().clamp(0.0, 255.0) as u8
    }
}
