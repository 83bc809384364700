//! Frame sources.
//!
//! A `SourceConnection` owns one capture handle to one source address and knows
//! only how to open it, read one frame, and release it. Reconnect policy lives
//! in `supervisor`, not here.
//!
//! Backends, selected by address scheme:
//! - `stub://` synthetic generator (tests, demos)
//! - `http://`, `https://` MJPEG or JPEG snapshots (feature: ingest-mjpeg)
//! - everything else (RTSP, files, device URIs) via GStreamer (feature: rtsp-gstreamer)

use anyhow::{anyhow, Result};

use crate::frame::Frame;

#[cfg(feature = "ingest-mjpeg")]
pub mod mjpeg;
pub mod rtsp;
pub mod stub;

#[cfg(feature = "ingest-mjpeg")]
pub use mjpeg::MjpegSource;
pub use rtsp::RtspSource;
pub use stub::StubSource;

/// One capture handle to one source address.
pub trait SourceConnection: Send {
    /// Address this connection was created for.
    fn address(&self) -> &str;

    /// Open (or reopen) the capture handle.
    fn connect(&mut self) -> Result<()>;

    /// Read one frame.
    ///
    /// `Ok(None)` means the handle produced no data this time; `Err` is a
    /// transient I/O condition. Both count as a failed read.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Release the capture handle. Safe to call when already released.
    fn release(&mut self);

    fn is_open(&self) -> bool;
}

/// Create an unopened connection for `address`.
pub fn open_source(address: &str) -> Result<Box<dyn SourceConnection>> {
    let address = address.trim();
    if address.is_empty() {
        return Err(anyhow!("source address is empty"));
    }
    let scheme = address
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase());

    match scheme.as_deref() {
        Some("stub") => Ok(Box::new(StubSource::new(address)?)),
        Some("http") | Some("https") => open_http(address),
        _ => Ok(Box::new(RtspSource::new(address)?)),
    }
}

#[cfg(feature = "ingest-mjpeg")]
fn open_http(address: &str) -> Result<Box<dyn SourceConnection>> {
    Ok(Box::new(MjpegSource::new(address)?))
}

#[cfg(not(feature = "ingest-mjpeg"))]
fn open_http(address: &str) -> Result<Box<dyn SourceConnection>> {
    Err(anyhow!(
        "http source {} requires the ingest-mjpeg feature",
        address
    ))
}
