//! Image bytes to fixed-shape CHW tensors.

use data_contracts::ImageShape;
use image::imageops::FilterType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("unsupported channel count {0}")]
    UnsupportedChannels(u32),
    #[error("decoded {actual} values, expected {expected}")]
    Shape { expected: usize, actual: usize },
}

/// Turns raw image bytes into exactly `shape().len()` f32 values.
pub trait Transform: Send + Sync {
    fn shape(&self) -> ImageShape;
    fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>, DecodeError>;
}

/// Decode, resize to the target shape, convert to gray/RGB, scale to [0, 1].
#[derive(Debug, Clone, Copy)]
pub struct ImageTransform {
    shape: ImageShape,
    filter: FilterType,
}

impl ImageTransform {
    pub fn new(shape: ImageShape) -> Self {
        Self {
            shape,
            filter: FilterType::Nearest,
        }
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = filter;
        self
    }
}

impl Transform for ImageTransform {
    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>, DecodeError> {
        let ImageShape {
            height,
            width,
            channels,
        } = self.shape;
        let mut img = image::load_from_memory(bytes)?;
        if img.width() != width || img.height() != height {
            img = img.resize_exact(width, height, self.filter);
        }
        let out = match channels {
            1 => img.to_luma8().into_raw().into_iter().map(scale).collect(),
            3 => interleaved_to_chw(&img.to_rgb8().into_raw(), 3),
            c => return Err(DecodeError::UnsupportedChannels(c)),
        };
        check_len(out, self.shape.len())
    }
}

fn scale(v: u8) -> f32 {
    v as f32 / 255.0
}

fn interleaved_to_chw(raw: &[u8], channels: usize) -> Vec<f32> {
    let plane = raw.len() / channels;
    let mut chw = vec![0.0f32; raw.len()];
    for (i, px) in raw.chunks_exact(channels).enumerate() {
        for (c, v) in px.iter().enumerate() {
            chw[c * plane + i] = scale(*v);
        }
    }
    chw
}

fn check_len(values: Vec<f32>, expected: usize) -> Result<Vec<f32>, DecodeError> {
    if values.len() != expected {
        return Err(DecodeError::Shape {
            expected,
            actual: values.len(),
        });
    }
    Ok(values)
}
