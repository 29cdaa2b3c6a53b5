//! Immutable RGBA snapshots sampled from the live stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Bytes per pixel (RGBA8).
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame has zero dimension ({width}x{height})")]
    EmptyDimensions { width: u32, height: u32 },
    #[error("pixel buffer is {actual} bytes, expected {expected} for {width}x{height} RGBA")]
    BufferSize {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// A point-in-time snapshot of the live stream. Clones share the pixel buffer.
#[derive(Clone)]
pub struct Frame {
    id: u64,
    width: u32,
    height: u32,
    rgba: Arc<[u8]>,
    captured_at: Instant,
}

impl Frame {
    /// Wrap an RGBA8 buffer, validating its size against the dimensions.
    pub fn from_rgba(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if rgba.len() != expected {
            return Err(FrameError::BufferSize {
                width,
                height,
                expected,
                actual: rgba.len(),
            });
        }
        Ok(Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            width,
            height,
            rgba: rgba.into(),
            captured_at: Instant::now(),
        })
    }

    /// A frame filled with a single colour. Used by synthetic sources.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Result<Self, FrameError> {
        let pixels = width as usize * height as usize;
        let mut buf = Vec::with_capacity(pixels * BYTES_PER_PIXEL);
        for _ in 0..pixels {
            buf.extend_from_slice(&rgba);
        }
        Self::from_rgba(width, height, buf)
    }

    /// Process-unique identifier, assigned at creation.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Frame {}
