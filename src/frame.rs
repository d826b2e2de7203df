//! Decoded frames and the single-slot buffer that hands them to consumers.
//!
//! - `Frame`: RGB24 pixels plus dimensions. Immutable once built and shared
//!   through `Arc`, so a consumer's snapshot can never observe a frame that
//!   is still being written.
//! - `FrameBuffer`: holds only the most recent frame. Each publish discards
//!   the previous one; there is no queue.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};

/// Bytes per pixel of the RGB24 layout every frame uses.
pub const BYTES_PER_PIXEL: usize = 3;

/// Opaque decoded image.
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    /// Build a frame from tightly packed RGB24 rows.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32) -> Result<Self> {
        let expected = width as usize * height as usize * BYTES_PER_PIXEL;
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame of {}x{} needs {} bytes, got {}",
                width,
                height,
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// A frame with no pixels counts as a failed read.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

/// Replace-on-write slot for the latest frame.
#[derive(Default)]
pub struct FrameBuffer {
    slot: Mutex<Option<Arc<Frame>>>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new frame. The lock covers only the pointer swap; the
    /// displaced frame is dropped after it is released.
    pub fn publish(&self, frame: Arc<Frame>) {
        let previous = self.lock().replace(frame);
        drop(previous);
    }

    /// Latest frame, or `None` before the first publish.
    pub fn snapshot(&self) -> Option<Arc<Frame>> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<Frame>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
