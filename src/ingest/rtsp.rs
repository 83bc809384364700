//! RTSP (and generic URI) frame source.
//!
//! Decoding is delegated to GStreamer:
//! `rtspsrc ! decodebin ! videoconvert ! appsink` for `rtsp://` addresses and
//! `uridecodebin` for anything else GStreamer can open. The appsink keeps a
//! single buffer and drops stale ones, so a read always returns the newest
//! decoded frame.
//!
//! Without the `rtsp-gstreamer` feature, construction fails.

use anyhow::Result;
#[cfg(feature = "rtsp-gstreamer")]
use anyhow::{anyhow, Context};
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Duration;

use super::SourceConnection;
use crate::frame::Frame;

/// GStreamer-backed source.
pub struct RtspSource {
    address: String,
    #[cfg(feature = "rtsp-gstreamer")]
    pipeline: Option<GstreamerPipeline>,
    #[cfg(feature = "rtsp-gstreamer")]
    frame_count: u64,
}

impl RtspSource {
    #[cfg(feature = "rtsp-gstreamer")]
    pub fn new(address: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            address: address.to_string(),
            pipeline: None,
            frame_count: 0,
        })
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    pub fn new(address: &str) -> Result<Self> {
        anyhow::bail!(
            "source {} requires the rtsp-gstreamer feature",
            address
        )
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl SourceConnection for RtspSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&mut self) -> Result<()> {
        self.release();
        let pipeline = GstreamerPipeline::launch(&self.address)?;
        self.pipeline = Some(pipeline);
        log::info!("RtspSource: connected to {}", self.address);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| anyhow!("source {} not connected", self.address))?;
        pipeline.poll_bus()?;

        let Some(sample) = pipeline.appsink.try_pull_sample(gstreamer::ClockTime::from_mseconds(
            FRAME_TIMEOUT.as_millis() as u64,
        )) else {
            return Ok(None);
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        Frame::from_rgb(width, height, pixels, self.frame_count)
            .map(Some)
            .ok_or_else(|| anyhow!("decoded frame has inconsistent size"))
    }

    fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.pipeline.set_state(gstreamer::State::Null) {
                log::warn!("RtspSource: failed to stop pipeline for {}: {}", self.address, err);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }
}

#[cfg(not(feature = "rtsp-gstreamer"))]
impl SourceConnection for RtspSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&mut self) -> Result<()> {
        anyhow::bail!("source {} requires the rtsp-gstreamer feature", self.address)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        anyhow::bail!("source {} requires the rtsp-gstreamer feature", self.address)
    }

    fn release(&mut self) {}

    fn is_open(&self) -> bool {
        false
    }
}

impl Drop for RtspSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ----------------------------------------------------------------------------
// GStreamer pipeline
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
const FRAME_TIMEOUT: Duration = Duration::from_millis(500);

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerPipeline {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerPipeline {
    fn launch(address: &str) -> Result<Self> {
        let source = if address.to_ascii_lowercase().starts_with("rtsp://") {
            format!("rtspsrc location={} latency=0 ! decodebin", address)
        } else {
            format!("uridecodebin uri={}", address)
        };
        let description = format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            source
        );
        let pipeline = gstreamer::parse::launch(&description)
            .context("build capture pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("capture pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set capture pipeline to Playing")?;

        Ok(Self { pipeline, appsink })
    }

    /// Surface pipeline errors and end-of-stream as read failures.
    fn poll_bus(&mut self) -> Result<()> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => return Err(anyhow!("gstreamer reached EOS")),
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("sample missing buffer")?;
    let caps = sample.caps().context("sample missing caps")?;
    let info = gstreamer_video::VideoInfo::from_caps(caps).context("parse caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map sample buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("buffer row is out of bounds")?);
    }

    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn construction_requires_feature() {
        assert!(RtspSource::new("rtsp://127.0.0.1:554/stream").is_err());
    }
}
