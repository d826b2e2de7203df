//! RTSP transport.
//!
//! `RtspTransportFactory` opens a synthetic stream for `stub://` URLs and a
//! GStreamer pipeline for anything else. The pipeline keeps one decoded
//! buffer and drops older ones, trading occasional frame loss for latency.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
use std::time::{Duration, Instant};

use super::{StreamTransport, StreamUrl, TransportFactory};
use crate::frame::{Frame, BYTES_PER_PIXEL};

/// Shape of the frames produced for `stub://` URLs.
#[derive(Clone, Copy, Debug)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Frames per second the synthetic stream is paced at.
    pub fps: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 10,
        }
    }
}

/// Transport factory used by camera feeds.
#[derive(Clone, Debug)]
pub struct RtspTransportFactory {
    /// Longest a single read waits for a sample before reporting "nothing yet".
    pub frame_timeout: Duration,
    /// Longest an open waits for the pipeline to start.
    pub open_timeout: Duration,
    pub synthetic: SyntheticConfig,
}

impl Default for RtspTransportFactory {
    fn default() -> Self {
        Self {
            frame_timeout: Duration::from_millis(500),
            open_timeout: Duration::from_secs(5),
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl TransportFactory for RtspTransportFactory {
    fn open(&self, url: &StreamUrl) -> Result<Box<dyn StreamTransport>> {
        if url.scheme() == "stub" {
            log::info!("stream {} opened (synthetic)", url);
            return Ok(Box::new(SyntheticTransport::new(self.synthetic)));
        }
        #[cfg(feature = "rtsp-gstreamer")]
        {
            let transport = GstreamerTransport::open(url, self.frame_timeout, self.open_timeout)?;
            log::info!("stream {} opened", url);
            Ok(Box::new(transport))
        }
        #[cfg(not(feature = "rtsp-gstreamer"))]
        {
            anyhow::bail!("opening {} requires the rtsp-gstreamer feature", url)
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic stream (stub://) for tests and demos
// ----------------------------------------------------------------------------

struct SyntheticTransport {
    config: SyntheticConfig,
    frame_count: u64,
    /// Slowly changing scene so consecutive frames are not identical.
    scene_state: u8,
    next_frame_at: Instant,
}

impl SyntheticTransport {
    fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            frame_count: 0,
            scene_state: 0,
            next_frame_at: Instant::now(),
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.config.fps.max(1)
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count =
            self.config.width as usize * self.config.height as usize * BYTES_PER_PIXEL;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl StreamTransport for SyntheticTransport {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let now = Instant::now();
        if now < self.next_frame_at {
            std::thread::sleep(self.next_frame_at - now);
        }
        self.next_frame_at = Instant::now() + self.frame_interval();

        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Frame::new(pixels, self.config.width, self.config.height).map(Some)
    }
}

// ----------------------------------------------------------------------------
// Production transport using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerTransport {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_timeout: Duration,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerTransport {
    /// Pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB, one buffer, drop).
    fn open(url: &StreamUrl, frame_timeout: Duration, open_timeout: Duration) -> Result<Self> {
        use gstreamer::prelude::*;

        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location=\"{}\" latency=0 protocols=tcp ! decodebin ! videoconvert ! \
             video/x-raw,format=RGB ! appsink name=appsink sync=false max-buffers=1 drop=true",
            url.as_str()
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        let mut transport = Self {
            pipeline,
            appsink,
            frame_timeout,
            last_error: None,
        };

        transport
            .pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        let (result, _, _) = transport
            .pipeline
            .state(gstreamer::ClockTime::from_mseconds(open_timeout.as_millis() as u64));
        result.context("RTSP pipeline did not start")?;
        transport.poll_bus();
        if let Some(err) = transport.last_error.take() {
            anyhow::bail!(err);
        }
        Ok(transport)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl StreamTransport for GstreamerTransport {
    fn read_frame(&mut self) -> Result<Option<Frame>> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            anyhow::bail!("{}", err);
        }

        let timeout = gstreamer::ClockTime::from_mseconds(self.frame_timeout.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            if self.appsink.is_eos() {
                anyhow::bail!("RTSP stream ended");
            }
            return Ok(None);
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        Frame::new(pixels, width, height).map(Some)
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerTransport {
    fn drop(&mut self) {
        use gstreamer::prelude::*;
        let _ = self.pipeline.set_state(gstreamer::State::Null);
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * BYTES_PER_PIXEL;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data.get(..len).context("RTSP buffer shorter than frame")?;
        return Ok((pixels.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::CameraIdentity;
    use crate::ingest::StreamEndpoint;
    use std::net::Ipv4Addr;

    fn stub_url() -> Result<StreamUrl> {
        let endpoint = StreamEndpoint {
            scheme: "stub".to_string(),
            ..StreamEndpoint::default()
        };
        let identity = CameraIdentity::parse("aa:bb:cc:dd:ee:ff", "admin", "secret")?;
        Ok(StreamUrl::build(&endpoint, &identity, Ipv4Addr::new(127, 0, 0, 1))?)
    }

    fn factory() -> RtspTransportFactory {
        RtspTransportFactory {
            synthetic: SyntheticConfig {
                width: 64,
                height: 48,
                fps: 200,
            },
            ..RtspTransportFactory::default()
        }
    }

    #[test]
    fn synthetic_stream_produces_frames() -> Result<()> {
        let mut transport = factory().open(&stub_url()?)?;
        let frame = transport.read_frame()?.expect("synthetic frame");
        assert_eq!(frame.dimensions(), (64, 48));
        assert!(!frame.is_empty());
        Ok(())
    }

    #[test]
    fn synthetic_frames_change_between_reads() -> Result<()> {
        let mut transport = factory().open(&stub_url()?)?;
        let first = transport.read_frame()?.expect("first frame");
        let second = transport.read_frame()?.expect("second frame");
        assert_ne!(first.pixels()[0], second.pixels()[0]);
        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn real_urls_need_the_gstreamer_feature() -> Result<()> {
        let identity = CameraIdentity::parse("aa:bb:cc:dd:ee:ff", "admin", "secret")?;
        let url = StreamUrl::build(
            &StreamEndpoint::default(),
            &identity,
            Ipv4Addr::new(127, 0, 0, 1),
        )?;
        assert!(factory().open(&url).is_err());
        Ok(())
    }
}
