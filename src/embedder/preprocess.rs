//! Frame → model input: bilinear resize to the model's square input size,
//! drop alpha, scale channels to [0, 1]. Layout is HWC (row-major RGB).

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Rgba};

use super::EmbedError;
use crate::frame::Frame;

/// Number of colour channels handed to the model.
pub const CHANNELS: usize = 3;

/// Normalized pixel tensor ready for inference.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub width: u32,
    pub height: u32,
    /// `width * height * 3` values in [0, 1], HWC order.
    pub data: Vec<f32>,
}

impl ModelInput {
    /// RGB triple at `(x, y)`.
    pub fn pixel(&self, x: u32, y: u32) -> [f32; 3] {
        let i = (y as usize * self.width as usize + x as usize) * CHANNELS;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}

/// Resize `frame` to `size`x`size` and normalize.
pub fn prepare(frame: &Frame, size: u32) -> Result<ModelInput, EmbedError> {
    if size == 0 {
        return Err(EmbedError::InvalidFrame("model input size is zero".into()));
    }
    let view: ImageBuffer<Rgba<u8>, &[u8]> =
        ImageBuffer::from_raw(frame.width(), frame.height(), frame.rgba()).ok_or_else(|| {
            EmbedError::InvalidFrame(format!(
                "pixel buffer does not match {}x{}",
                frame.width(),
                frame.height()
            ))
        })?;

    let resized = imageops::resize(&view, size, size, FilterType::Triangle);

    let mut data = Vec::with_capacity(size as usize * size as usize * CHANNELS);
    for px in resized.pixels() {
        let [r, g, b, _] = px.0;
        data.push(r as f32 / 255.0);
        data.push(g as f32 / 255.0);
        data.push(b as f32 / 255.0);
    }

    Ok(ModelInput {
        width: size,
        height: size,
        data,
    })
}
