//! HTTP MJPEG / JPEG snapshot source.
//!
//! A `multipart/x-mixed-replace` response is read as a continuous MJPEG stream;
//! any other content type is treated as a snapshot endpoint and re-fetched on
//! every read. JPEG decoding happens in memory.
//!
//! Connect and read timeouts bound how long a stalled camera can hold the
//! capture thread, and with it `StreamSupervisor::stop`.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::io::Read;
use std::time::Duration;
use url::Url;

use super::SourceConnection;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

pub struct MjpegSource {
    address: String,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    Snapshot,
}

impl MjpegSource {
    pub fn new(address: &str) -> Result<Self> {
        let url = Url::parse(address).context("parse http source url")?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Ok(Self {
            address: address.to_string(),
            agent,
            stream: None,
            frame_count: 0,
        })
    }
}

impl SourceConnection for MjpegSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&mut self) -> Result<()> {
        self.stream = None;
        let response = self
            .agent
            .get(&self.address)
            .call()
            .with_context(|| format!("connect to http stream {}", self.address))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(reader)));
        } else {
            self.stream = Some(HttpStream::Snapshot);
        }
        log::info!("MjpegSource: connected to {}", self.address);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("http source {} not connected", self.address))?;
        let jpeg_bytes = match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg()?,
            HttpStream::Snapshot => fetch_snapshot(&self.agent, &self.address)?,
        };
        let Some(jpeg_bytes) = jpeg_bytes else {
            return Ok(None);
        };

        let (pixels, width, height) = decode_jpeg(&jpeg_bytes)?;
        self.frame_count += 1;
        Frame::from_rgb(width, height, pixels, self.frame_count)
            .map(Some)
            .ok_or_else(|| anyhow!("decoded jpeg has inconsistent size"))
    }

    fn release(&mut self) {
        self.stream = None;
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send + Sync>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send + Sync>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG from the stream. `Ok(None)` when the stream ended.
    fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Option<Vec<u8>>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(bytes))
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    let rgb = image.into_rgb8();
    Ok((rgb.into_raw(), width, height))
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
