//! H.264/MP4 sink using GStreamer.
//!
//! Pipeline: appsrc (RGB) ! videoconvert ! x264enc ! mp4mux ! filesink.
//! Buffers are timestamped from the frame count at the session rate, so the
//! file plays back at the recorded rate regardless of source timing.

use anyhow::{anyhow, Context, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use std::path::Path;

use super::{FrameSink, SinkFactory};
use crate::frame::Frame;

#[derive(Clone, Copy, Debug, Default)]
pub struct Mp4SinkFactory;

impl SinkFactory for Mp4SinkFactory {
    fn extension(&self) -> &'static str {
        "mp4"
    }

    fn create(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn FrameSink>> {
        gst::init().context("initialize gstreamer")?;
        let fps = fps.max(1);

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .field("width", width as i32)
            .field("height", height as i32)
            .field("framerate", gst::Fraction::new(fps as i32, 1))
            .build();
        let appsrc = gst_app::AppSrc::builder()
            .caps(&caps)
            .format(gst::Format::Time)
            .is_live(true)
            .build();

        let make = |factory: &str| {
            gst::ElementFactory::make(factory)
                .build()
                .with_context(|| format!("create {factory}"))
        };
        let convert = make("videoconvert")?;
        let encoder = make("x264enc")?;
        encoder.set_property_from_str("tune", "zerolatency");
        let muxer = make("mp4mux")?;
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", path.to_string_lossy().to_string())
            .build()
            .context("create filesink")?;

        let pipeline = gst::Pipeline::new();
        pipeline
            .add_many([appsrc.upcast_ref(), &convert, &encoder, &muxer, &filesink])
            .context("add recording elements")?;
        gst::Element::link_many([appsrc.upcast_ref(), &convert, &encoder, &muxer, &filesink])
            .context("link recording elements")?;
        pipeline
            .set_state(gst::State::Playing)
            .context("start recording pipeline")?;

        Ok(Box::new(Mp4Sink {
            pipeline,
            appsrc,
            frame_ns: 1_000_000_000 / fps as u64,
            frames: 0,
        }))
    }
}

struct Mp4Sink {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    frame_ns: u64,
    frames: u64,
}

impl FrameSink for Mp4Sink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        let mut buffer = gst::Buffer::from_slice(frame.pixels().to_vec());
        {
            let buffer = buffer
                .get_mut()
                .ok_or_else(|| anyhow!("recording buffer is shared"))?;
            buffer.set_pts(gst::ClockTime::from_nseconds(self.frame_ns * self.frames));
            buffer.set_duration(gst::ClockTime::from_nseconds(self.frame_ns));
        }
        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| anyhow!("push frame into recording pipeline: {:?}", e))?;
        self.frames += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let eos = self.appsrc.end_of_stream();
        let mut failure = eos.err().map(|e| format!("send EOS: {e:?}"));

        if failure.is_none() {
            if let Some(bus) = self.pipeline.bus() {
                for msg in bus.iter_timed(gst::ClockTime::from_seconds(5)) {
                    match msg.view() {
                        gst::MessageView::Eos(..) => break,
                        gst::MessageView::Error(err) => {
                            failure = Some(format!("recording pipeline error: {}", err.error()));
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        let _ = self.pipeline.set_state(gst::State::Null);
        match failure {
            Some(reason) => Err(anyhow!(reason)),
            None => Ok(()),
        }
    }
}
