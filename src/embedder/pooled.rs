//! Built-in colour model: average-pools the input into a `grid`x`grid`
//! mosaic and centres each channel on the image mean. Deterministic, cheap,
//! and sensitive to layout and colour shifts, which is enough to drive the
//! comparator without a learned network. A perfectly uniform image embeds to
//! the zero vector (its similarity is NaN).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::preprocess::{ModelInput, CHANNELS};
use super::{EmbedError, EmbeddingModel, ModelLoadError, ModelLoader};

pub struct PooledColorModel {
    grid: u32,
    input_size: u32,
}

impl PooledColorModel {
    pub fn new(grid: u32, input_size: u32) -> Self {
        Self {
            grid: grid.clamp(1, input_size.max(1)),
            input_size,
        }
    }
}

impl EmbeddingModel for PooledColorModel {
    fn input_size(&self) -> u32 {
        self.input_size
    }

    fn dimension(&self) -> usize {
        (self.grid * self.grid) as usize * CHANNELS
    }

    fn infer(&self, input: &ModelInput) -> Result<Vec<f32>, EmbedError> {
        if input.width != self.input_size || input.height != self.input_size {
            return Err(EmbedError::Inference(format!(
                "expected {0}x{0} input, got {1}x{2}",
                self.input_size, input.width, input.height
            )));
        }

        let grid = self.grid as usize;
        let size = self.input_size as usize;
        let mut sums = vec![0.0f64; grid * grid * CHANNELS];
        let mut counts = vec![0u32; grid * grid];

        for y in 0..size {
            let gy = y * grid / size;
            for x in 0..size {
                let gx = x * grid / size;
                let cell = gy * grid + gx;
                let px = (y * size + x) * CHANNELS;
                for c in 0..CHANNELS {
                    sums[cell * CHANNELS + c] += input.data[px + c] as f64;
                }
                counts[cell] += 1;
            }
        }

        let mut means = [0.0f64; CHANNELS];
        for (cell, &count) in counts.iter().enumerate() {
            for c in 0..CHANNELS {
                let v = sums[cell * CHANNELS + c] / count.max(1) as f64;
                sums[cell * CHANNELS + c] = v;
                means[c] += v;
            }
        }
        for m in &mut means {
            *m /= (grid * grid) as f64;
        }

        Ok(sums
            .iter()
            .enumerate()
            .map(|(i, v)| (v - means[i % CHANNELS]) as f32)
            .collect())
    }
}

/// Loader for [`PooledColorModel`]; never fails.
pub struct PooledColorLoader {
    pub grid: u32,
    pub input_size: u32,
}

#[async_trait]
impl ModelLoader for PooledColorLoader {
    async fn load(&self) -> Result<Arc<dyn EmbeddingModel>, ModelLoadError> {
        let model = PooledColorModel::new(self.grid, self.input_size);
        info!(
            grid = self.grid,
            input_size = self.input_size,
            dimension = model.dimension(),
            "pooled colour model ready"
        );
        Ok(Arc::new(model))
    }
}
