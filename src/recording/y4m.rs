//! YUV4MPEG2 (`.y4m`) sink.
//!
//! Uncompressed 4:4:4 frames behind a one-line header. Needs no codec, so it
//! is the sink available in every build; any media tool can transcode it.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{FrameSink, SinkFactory};
use crate::frame::{Frame, BYTES_PER_PIXEL};

#[derive(Clone, Copy, Debug, Default)]
pub struct Y4mSinkFactory;

impl SinkFactory for Y4mSinkFactory {
    fn extension(&self) -> &'static str {
        "y4m"
    }

    fn create(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn FrameSink>> {
        if width == 0 || height == 0 {
            anyhow::bail!("cannot record a {}x{} stream", width, height);
        }
        let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C444", width, height, fps.max(1))
            .context("write y4m header")?;
        Ok(Box::new(Y4mSink {
            out,
            path: path.to_path_buf(),
            planes: Vec::with_capacity(width as usize * height as usize * 3),
        }))
    }
}

struct Y4mSink {
    out: BufWriter<File>,
    path: PathBuf,
    /// Reused Y, U and V planes.
    planes: Vec<u8>,
}

impl FrameSink for Y4mSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        rgb_to_yuv444(frame.pixels(), &mut self.planes);
        self.out.write_all(b"FRAME\n")?;
        self.out
            .write_all(&self.planes)
            .with_context(|| format!("write frame to {}", self.path.display()))?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.out
            .flush()
            .with_context(|| format!("flush {}", self.path.display()))?;
        self.out.get_ref().sync_all().context("sync recording")?;
        Ok(())
    }
}

/// Full-range BT.601 conversion into planar Y, U, V.
fn rgb_to_yuv444(rgb: &[u8], planes: &mut Vec<u8>) {
    let pixels = rgb.len() / BYTES_PER_PIXEL;
    planes.clear();
    planes.resize(pixels * 3, 0);
    let (y_plane, rest) = planes.split_at_mut(pixels);
    let (u_plane, v_plane) = rest.split_at_mut(pixels);

    for (i, px) in rgb.chunks_exact(BYTES_PER_PIXEL).enumerate() {
        let (r, g, b) = (px[0] as f32, px[1] as f32, px[2] as f32);
        let y = 0.299 * r + 0.587 * g + 0.114 * b;
        let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
        let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
        y_plane[i] = y.round().clamp(0.0, 255.0) as u8;
        u_plane[i] = u.round().clamp(0.0, 255.0) as u8;
        v_plane[i] = v.round().clamp(0.0, 255.0) as u8;
    }
}
