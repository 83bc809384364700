use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use crate::multiplex::{DEFAULT_GRID_SIZE, DEFAULT_MAX_GRID_SOURCES};
use crate::registry::{SourceId, SourceRecord};
use crate::supervisor::{
    SupervisorConfig, DEFAULT_FAILURE_THRESHOLD, DEFAULT_POLL_INTERVAL, DEFAULT_RECONNECT_COOLDOWN,
};

const DEFAULT_SOURCE_NAME: &str = "front_camera";
const DEFAULT_SOURCE_URL: &str = "stub://front_camera";
const DEFAULT_FRAME_RATE: u32 = 30;
const DEFAULT_ROTATION_SECS: u64 = 10;
const DEFAULT_DISPLAY_WIDTH: u32 = 1280;
const DEFAULT_DISPLAY_HEIGHT: u32 = 720;
const DEFAULT_SLOT_PADDING: u32 = 10;

// ----------------------------------------------------------------------------
// Display settings shared by every open display
// ----------------------------------------------------------------------------

/// Render rate restricted to the supported set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FrameRate(u32);

impl FrameRate {
    pub const ALLOWED: [u32; 8] = [1, 3, 5, 10, 15, 20, 30, 60];

    pub fn new(fps: u32) -> Result<Self> {
        if Self::ALLOWED.contains(&fps) {
            Ok(Self(fps))
        } else {
            Err(anyhow!(
                "frame rate {} not supported; expected one of {:?}",
                fps,
                Self::ALLOWED
            ))
        }
    }

    pub fn fps(&self) -> u32 {
        self.0
    }

    /// Delay between render ticks, `1000 / fps` whole milliseconds.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(u64::from(1000 / self.0))
    }
}

impl Default for FrameRate {
    fn default() -> Self {
        Self(DEFAULT_FRAME_RATE)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fps", self.0)
    }
}

/// Rotation period from a whole number of seconds. Zero is rejected.
pub fn rotation_from_secs(secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(anyhow!("rotation time must be greater than zero"));
    }
    Ok(Duration::from_secs(secs))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplaySettings {
    pub frame_rate: FrameRate,
    pub rotation: Duration,
    pub auto_rotate: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            frame_rate: FrameRate::default(),
            rotation: Duration::from_secs(DEFAULT_ROTATION_SECS),
            auto_rotate: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutSettings {
    pub grid_size: usize,
    pub max_grid_sources: usize,
    pub width: u32,
    pub height: u32,
    /// Inset applied to each grid cell.
    pub padding: u32,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            grid_size: DEFAULT_GRID_SIZE,
            max_grid_sources: DEFAULT_MAX_GRID_SOURCES,
            width: DEFAULT_DISPLAY_WIDTH,
            height: DEFAULT_DISPLAY_HEIGHT,
            padding: DEFAULT_SLOT_PADDING,
        }
    }
}

// ----------------------------------------------------------------------------
// Config file
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct WallConfigFile {
    sources: Option<Vec<SourceConfigFile>>,
    display: Option<DisplayConfigFile>,
    capture: Option<CaptureConfigFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceConfigFile {
    id: Option<u64>,
    name: String,
    url: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DisplayConfigFile {
    frame_rate: Option<u32>,
    rotation_secs: Option<u64>,
    auto_rotate: Option<bool>,
    grid_size: Option<usize>,
    max_grid_sources: Option<usize>,
    width: Option<u32>,
    height: Option<u32>,
    padding: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CaptureConfigFile {
    failure_threshold: Option<u32>,
    reconnect_cooldown_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}

/// Camera wall configuration: the source list plus display and capture tuning.
#[derive(Debug, Clone)]
pub struct WallConfig {
    pub sources: Vec<SourceRecord>,
    pub settings: DisplaySettings,
    pub layout: LayoutSettings,
    pub capture: SupervisorConfig,
}

impl Default for WallConfig {
    fn default() -> Self {
        Self {
            sources: vec![SourceRecord::new(1, DEFAULT_SOURCE_NAME, DEFAULT_SOURCE_URL)],
            settings: DisplaySettings::default(),
            layout: LayoutSettings::default(),
            capture: SupervisorConfig::default(),
        }
    }
}

impl WallConfig {
    /// File named by `CAMERA_WALL_CONFIG` (if set), then env overrides, then
    /// validation.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMERA_WALL_CONFIG").ok();
        match config_path.as_deref() {
            Some(path) => Self::load_from(Path::new(path)),
            None => Self::finish(WallConfigFile::default()),
        }
    }

    /// Like `load`, with an explicit file path.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::finish(read_config_file(path)?)
    }

    fn finish(file: WallConfigFile) -> Result<Self> {
        let mut cfg = Self::from_file(file)?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: WallConfigFile) -> Result<Self> {
        let defaults = Self::default();
        let sources = match file.sources {
            Some(sources) => assign_ids(sources),
            None => defaults.sources,
        };

        let display = file.display.unwrap_or_default();
        let frame_rate = match display.frame_rate {
            Some(fps) => FrameRate::new(fps)?,
            None => defaults.settings.frame_rate,
        };
        let rotation = match display.rotation_secs {
            Some(secs) => rotation_from_secs(secs)?,
            None => defaults.settings.rotation,
        };
        let settings = DisplaySettings {
            frame_rate,
            rotation,
            auto_rotate: display
                .auto_rotate
                .unwrap_or(defaults.settings.auto_rotate),
        };
        let layout = LayoutSettings {
            grid_size: display.grid_size.unwrap_or(defaults.layout.grid_size),
            max_grid_sources: display
                .max_grid_sources
                .unwrap_or(defaults.layout.max_grid_sources),
            width: display.width.unwrap_or(defaults.layout.width),
            height: display.height.unwrap_or(defaults.layout.height),
            padding: display.padding.unwrap_or(defaults.layout.padding),
        };

        let capture = file.capture.unwrap_or_default();
        let capture = SupervisorConfig {
            failure_threshold: capture
                .failure_threshold
                .unwrap_or(DEFAULT_FAILURE_THRESHOLD),
            reconnect_cooldown: capture
                .reconnect_cooldown_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RECONNECT_COOLDOWN),
            poll_interval: capture
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
        };

        Ok(Self {
            sources,
            settings,
            layout,
            capture,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(fps) = std::env::var("CAMERA_WALL_FPS") {
            let fps: u32 = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("CAMERA_WALL_FPS must be an integer frame rate"))?;
            self.settings.frame_rate = FrameRate::new(fps)?;
        }
        if let Ok(rotation) = std::env::var("CAMERA_WALL_ROTATION_SECS") {
            let seconds: u64 = rotation.trim().parse().map_err(|_| {
                anyhow!("CAMERA_WALL_ROTATION_SECS must be an integer number of seconds")
            })?;
            self.settings.rotation = rotation_from_secs(seconds)?;
        }
        if let Ok(auto_rotate) = std::env::var("CAMERA_WALL_AUTO_ROTATE") {
            self.settings.auto_rotate = parse_bool(&auto_rotate).ok_or_else(|| {
                anyhow!("CAMERA_WALL_AUTO_ROTATE must be true/false, yes/no or 1/0")
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.layout.grid_size == 0 {
            return Err(anyhow!("display.grid_size must be at least 1"));
        }
        if self.layout.max_grid_sources == 0 {
            return Err(anyhow!("display.max_grid_sources must be at least 1"));
        }
        if self.layout.width == 0 || self.layout.height == 0 {
            return Err(anyhow!("display size must be non-zero"));
        }
        if self.capture.poll_interval.is_zero() {
            return Err(anyhow!("capture.poll_interval_ms must be greater than zero"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.id) {
                return Err(anyhow!("duplicate source id {}", source.id.0));
            }
            if source.name.trim().is_empty() {
                return Err(anyhow!("source {} has an empty name", source.id.0));
            }
            if source.address.trim().is_empty() {
                return Err(anyhow!("source {} has an empty url", source.id.0));
            }
        }
        Ok(())
    }
}

/// Sources without an explicit id are numbered after the largest explicit one,
/// in file order.
fn assign_ids(sources: Vec<SourceConfigFile>) -> Vec<SourceRecord> {
    let mut next = sources.iter().filter_map(|s| s.id).max().unwrap_or(0) + 1;
    sources
        .into_iter()
        .map(|source| {
            let id = source.id.unwrap_or_else(|| {
                let id = next;
                next += 1;
                id
            });
            SourceRecord {
                id: SourceId(id),
                name: source.name,
                address: source.url,
            }
        })
        .collect()
}

fn read_config_file(path: &Path) -> Result<WallConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
