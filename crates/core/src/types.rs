use std::collections::HashMap;

use half::f16;
use image::{DynamicImage, RgbImage};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Half-open pixel rectangle `[x0, x1) × [y0, y1)` in source-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TileBox {
    pub fn new(x0: u32, y0: u32, x1: u32, y1: u32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    /// Box multiplied by an integer scale factor (output-canvas coordinates).
    pub fn scaled(&self, scale: u32) -> Self {
        Self {
            x0: self.x0 * scale,
            y0: self.y0 * scale,
            x1: self.x1 * scale,
            y1: self.y1 * scale,
        }
    }
}

/// One unit of work: a source box and an owned copy of its pixels.
#[derive(Debug, Clone)]
pub struct Tile {
    pub source_box: TileBox,
    pub crop: RgbImage,
}

/// A single image as a transform may hand it back.
pub enum ImageValue {
    /// Already canonical.
    Rgb(RgbImage),
    Dynamic(DynamicImage),
    /// Integer array: `HW`, `HWC`, or `NHWC`.
    Bytes(ArrayD<u8>),
    /// Float tensor: `HW`, `CHW`/`HWC`, or `NCHW`. Value range is detected.
    Float(ArrayD<f32>),
    /// FP16 tensor, same layouts as [`ImageValue::Float`].
    Half(ArrayD<f16>),
}

impl std::fmt::Debug for ImageValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rgb(img) => write!(f, "Rgb({}x{})", img.width(), img.height()),
            Self::Dynamic(img) => write!(f, "Dynamic({}x{})", img.width(), img.height()),
            Self::Bytes(arr) => write!(f, "Bytes({:?})", arr.shape()),
            Self::Float(arr) => write!(f, "Float({:?})", arr.shape()),
            Self::Half(arr) => write!(f, "Half({:?})", arr.shape()),
        }
    }
}

/// Raw result of one transform call, before coercion.
#[derive(Debug)]
pub enum TransformOutput {
    /// Dictionary-style result; images live under the `images` key.
    Keyed(HashMap<String, Vec<ImageValue>>),
    /// Pipeline-style result object exposing an `images` field.
    Pipeline { images: Vec<ImageValue> },
    Single(ImageValue),
    Sequence(Vec<ImageValue>),
}

/// Generation parameters forwarded untouched to the transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscaleParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub guidance_scale: f32,
    pub noise_level: u32,
    /// How often (in steps) the transform should report step progress.
    pub callback_steps: u32,
}

impl Default for UpscaleParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            steps: 30,
            guidance_scale: 9.0,
            noise_level: 20,
            callback_steps: 1,
        }
    }
}

/// Tiling knobs for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileOptions {
    pub tile_size: u32,
    pub overlap: u32,
    pub tile_batch_size: usize,
    pub scale_factor: u32,
}

impl Default for TileOptions {
    fn default() -> Self {
        Self {
            tile_size: 128,
            overlap: 16,
            tile_batch_size: 2,
            scale_factor: 4,
        }
    }
}

/// Fine-grained progress reported from inside a transform call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepProgress {
    /// Index of the first tile of the running batch.
    pub first_tile: usize,
    pub batch_len: usize,
    pub step: u32,
    pub total_steps: u32,
}
