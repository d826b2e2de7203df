//! Still captures of the current frame.

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use crate::frame::Frame;

/// Encode `frame` as JPEG at `path`.
pub fn write_jpeg(frame: &Frame, path: &Path) -> Result<()> {
    let image = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
        .ok_or_else(|| anyhow!("frame buffer does not match {}x{}", frame.width, frame.height))?;
    image
        .save_with_format(path, image::ImageFormat::Jpeg)
        .with_context(|| format!("write snapshot {}", path.display()))
}
