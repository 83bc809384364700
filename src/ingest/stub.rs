//! Synthetic frame source (`stub://`).
//!
//! Produces moving test-pattern frames with no network access. Query parameters
//! shape its failure behaviour so reconnect logic can be exercised end to end:
//!
//! - `width`, `height`: frame size (default 640x480)
//! - `drop`: probability in `0.0..=1.0` that a read returns no data
//! - `fail_after`: go dark after this many frames until the next `connect()`
//! - `offline`: refuse every `connect()` (address unreachable)
//!
//! Example: `stub://lobby?width=320&height=240&drop=0.05&fail_after=500`

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use url::Url;

use super::SourceConnection;
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
/// Largest RGB buffer a stub frame may need (8K UHD fits).
const MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct StubConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub drop_probability: f64,
    pub fail_after: Option<u64>,
    pub offline: bool,
}

impl StubConfig {
    pub fn parse(address: &str) -> Result<Self> {
        let url = Url::parse(address).with_context(|| format!("parse stub address {}", address))?;
        if url.scheme() != "stub" {
            return Err(anyhow!("not a stub address: {}", address));
        }

        let mut config = Self {
            name: url.host_str().unwrap_or("stub").to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            drop_probability: 0.0,
            fail_after: None,
            offline: false,
        };

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "width" => config.width = parse_param(&key, &value)?,
                "height" => config.height = parse_param(&key, &value)?,
                "drop" => config.drop_probability = parse_param(&key, &value)?,
                "fail_after" => config.fail_after = Some(parse_param(&key, &value)?),
                "offline" => config.offline = matches!(value.as_ref(), "1" | "true" | "yes"),
                other => log::debug!("stub {}: ignoring unknown parameter '{}'", address, other),
            }
        }

        if config.width == 0 || config.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        match config.frame_len() {
            Some(len) if len <= MAX_FRAME_BYTES => {}
            _ => {
                return Err(anyhow!(
                    "stub frame size {}x{} exceeds {} bytes",
                    config.width,
                    config.height,
                    MAX_FRAME_BYTES
                ))
            }
        }
        if !(0.0..=1.0).contains(&config.drop_probability) {
            return Err(anyhow!("stub drop probability must be within 0..=1"));
        }
        Ok(config)
    }

    /// RGB buffer length, `None` on overflow.
    pub fn frame_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(3)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("invalid stub parameter {}={}", key, value))
}

/// Synthetic source.
pub struct StubSource {
    address: String,
    config: StubConfig,
    open: bool,
    frame_count: u64,
    /// Frames produced since the last successful connect.
    frames_this_session: u64,
}

impl StubSource {
    pub fn new(address: &str) -> Result<Self> {
        Ok(Self {
            address: address.to_string(),
            config: StubConfig::parse(address)?,
            open: false,
            frame_count: 0,
            frames_this_session: 0,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&self) -> Vec<u8> {
        // Bounded by `StubConfig::parse`.
        let pixel_count = self.config.frame_len().unwrap_or(0);
        let seed = self
            .config
            .name
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + seed) % 256) as u8;
        }
        pixels
    }
}

impl SourceConnection for StubSource {
    fn address(&self) -> &str {
        &self.address
    }

    fn connect(&mut self) -> Result<()> {
        if self.config.offline {
            self.open = false;
            return Err(anyhow!("stub source {} is offline", self.config.name));
        }
        self.open = true;
        self.frames_this_session = 0;
        log::info!("StubSource: connected to {} (synthetic)", self.address);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.open {
            return Err(anyhow!("stub source {} not connected", self.config.name));
        }
        if let Some(limit) = self.config.fail_after {
            if self.frames_this_session >= limit {
                return Ok(None);
            }
        }
        if self.config.drop_probability > 0.0
            && rand::thread_rng().gen_bool(self.config.drop_probability)
        {
            return Ok(None);
        }

        self.frame_count += 1;
        self.frames_this_session += 1;
        let pixels = self.generate_pixels();
        let frame = Frame::from_rgb(
            self.config.width,
            self.config.height,
            pixels,
            self.frame_count,
        )
        .ok_or_else(|| anyhow!("stub frame buffer has the wrong size"))?;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_query_parameters() -> Result<()> {
        let config =
            StubConfig::parse("stub://gate?width=32&height=24&drop=0.25&fail_after=7&offline=1")?;
        assert_eq!(config.name, "gate");
        assert_eq!((config.width, config.height), (32, 24));
        assert_eq!(config.drop_probability, 0.25);
        assert_eq!(config.fail_after, Some(7));
        assert!(config.offline);
        assert_eq!(config.frame_len(), Some(32 * 24 * 3));
        Ok(())
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(StubConfig::parse("stub://gate?width=0").is_err());
        assert!(StubConfig::parse("stub://gate?width=4294967295&height=4294967295").is_err());
        assert!(StubConfig::parse("stub://gate?width=65536&height=65536").is_err());
        assert!(StubConfig::parse("stub://gate?drop=1.5").is_err());
        assert!(StubConfig::parse("stub://gate?fail_after=soon").is_err());
        assert!(StubConfig::parse("rtsp://gate").is_err());
    }

    #[test]
    fn reads_before_connect_fail() -> Result<()> {
        let mut source = StubSource::new("stub://gate?width=4&height=4")?;
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[test]
    fn goes_dark_after_limit_until_reconnect() -> Result<()> {
        let mut source = StubSource::new("stub://gate?width=4&height=4&fail_after=2")?;
        source.connect()?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert!(source.next_frame()?.is_none());

        source.release();
        source.connect()?;
        let frame = source.next_frame()?.expect("frame after reconnect");
        assert_eq!(frame.sequence, 3);
        Ok(())
    }

    #[test]
    fn offline_source_refuses_connect() -> Result<()> {
        let mut source = StubSource::new("stub://gate?offline=true")?;
        assert!(source.connect().is_err());
        assert!(!source.is_open());
        Ok(())
    }

    #[test]
    fn frames_change_over_time() -> Result<()> {
        let mut source = StubSource::new("stub://gate?width=4&height=4")?;
        source.connect()?;
        let first = source.next_frame()?.expect("frame");
        let second = source.next_frame()?.expect("frame");
        assert_ne!(first.image.as_raw(), second.image.as_raw());
        assert_eq!(source.frames_captured(), 2);
        Ok(())
    }
}
