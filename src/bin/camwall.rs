//! camwall - camera wall runner
//!
//! This binary:
//! 1. Loads the wall configuration (file, env, then CLI overrides)
//! 2. Starts one capture supervisor per configured source
//! 3. Opens one display (single rotation or grid paging)
//! 4. Logs slot assignments and per-slot frame counts until Ctrl-C

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use camera_wall::{
    Console, DisplayGeometry, DisplayId, PresentationSink, SlotImage, SlotOutput, SourceId,
    Topology, WallConfig,
};

const SUMMARY_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Single,
    Grid,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "CAMERA_WALL_CONFIG")]
    config: Option<PathBuf>,
    /// Display topology.
    #[arg(long, value_enum, default_value = "grid")]
    mode: Mode,
    /// Comma-separated source ids to show (default: all configured sources).
    #[arg(long, value_delimiter = ',')]
    sources: Vec<u64>,
    /// Render rate; one of 1, 3, 5, 10, 15, 20, 30, 60.
    #[arg(long)]
    fps: Option<u32>,
    /// Seconds between rotations.
    #[arg(long)]
    rotation_secs: Option<u64>,
    /// Keep the first index/page on screen.
    #[arg(long)]
    no_auto_rotate: bool,
    /// Slots per grid page.
    #[arg(long)]
    grid_size: Option<usize>,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
    /// Exit after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration_secs: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => WallConfig::load_from(path)?,
        None => WallConfig::load()?,
    };
    if let Some(grid_size) = args.grid_size {
        if grid_size == 0 {
            return Err(anyhow!("--grid-size must be at least 1"));
        }
        config.layout.grid_size = grid_size;
    }
    if let Some(width) = args.width {
        config.layout.width = width;
    }
    if let Some(height) = args.height {
        config.layout.height = height;
    }

    let mut console = Console::from_config(&config)?;
    let now = Instant::now();
    if let Some(fps) = args.fps {
        console.set_frame_rate(fps)?;
    }
    if let Some(secs) = args.rotation_secs {
        console.set_rotation_time(secs, now)?;
    }
    if args.no_auto_rotate {
        console.set_auto_rotate(false, now);
    }

    let sources = select_sources(&config, &args.sources)?;
    let topology = match args.mode {
        Mode::Single => Topology::Single,
        Mode::Grid => Topology::Grid {
            slots: config.layout.grid_size,
        },
    };
    let sources = match topology {
        Topology::Grid { .. } if sources.len() > config.layout.max_grid_sources => {
            log::warn!(
                "grid shows at most {} sources; ignoring {} more",
                config.layout.max_grid_sources,
                sources.len() - config.layout.max_grid_sources
            );
            sources[..config.layout.max_grid_sources].to_vec()
        }
        _ => sources,
    };

    let geometry = DisplayGeometry::new(config.layout.width, config.layout.height)
        .with_padding(config.layout.padding);
    let display = console.open_display(
        topology,
        sources,
        geometry,
        Box::new(LogSink::new()),
        Instant::now(),
    )?;
    let settings = console.settings();
    log::info!(
        "camwall running: {} sources, {} at {}, rotation {}s (auto={})",
        console.registry().len(),
        display,
        settings.frame_rate,
        settings.rotation.as_secs(),
        settings.auto_rotate
    );

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let deadline = args
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    console.run(&stop, deadline);

    log::info!("shutdown signal received, stopping capture...");
    for record in console.registry().records() {
        if let Some(status) = console.registry().status(record.id) {
            let last_frame = console
                .registry()
                .frame(record.id)
                .map(|frame| format!("{}ms ago", frame.age().as_millis()))
                .unwrap_or_else(|| "none".to_string());
            log::info!(
                "source {} '{}': {:?}, {} frames, {} reconnects, last frame {}",
                record.id,
                record.name,
                status.state,
                status.frames_captured,
                status.reconnects,
                last_frame
            );
        }
    }
    console.shutdown();
    Ok(())
}

fn select_sources(config: &WallConfig, requested: &[u64]) -> Result<Vec<SourceId>> {
    if requested.is_empty() {
        return Ok(config.sources.iter().map(|record| record.id).collect());
    }
    requested
        .iter()
        .map(|&id| {
            let id = SourceId(id);
            if config.sources.iter().any(|record| record.id == id) {
                Ok(id)
            } else {
                Err(anyhow!("--sources lists unknown source {}", id))
            }
        })
        .collect()
}

/// Logs assignment changes as they happen and frame counts periodically.
struct LogSink {
    plan: Vec<Option<SourceId>>,
    frames: Vec<u64>,
    placeholders: Vec<u64>,
    last_summary: Instant,
}

impl LogSink {
    fn new() -> Self {
        Self {
            plan: Vec::new(),
            frames: Vec::new(),
            placeholders: Vec::new(),
            last_summary: Instant::now(),
        }
    }
}

impl PresentationSink for LogSink {
    fn present(&mut self, display: DisplayId, slots: &[SlotOutput]) {
        let plan: Vec<Option<SourceId>> = slots.iter().map(|slot| slot.source).collect();
        if plan != self.plan {
            let shown: Vec<String> = plan
                .iter()
                .map(|source| source.map_or_else(|| "-".to_string(), |id| id.to_string()))
                .collect();
            log::info!("{} slots: [{}]", display, shown.join(", "));
            self.plan = plan;
            self.frames = vec![0; slots.len()];
            self.placeholders = vec![0; slots.len()];
        }

        for slot in slots {
            let counter = match &slot.image {
                SlotImage::Image(_) => self.frames.get_mut(slot.slot),
                SlotImage::Placeholder(_) => self.placeholders.get_mut(slot.slot),
            };
            if let Some(count) = counter {
                *count += 1;
            }
        }

        if self.last_summary.elapsed() >= SUMMARY_INTERVAL {
            for slot in slots {
                log::info!(
                    "{} slot {} ({}x{}): {} frames, {} placeholders, now {}",
                    display,
                    slot.slot,
                    slot.rect.width,
                    slot.rect.height,
                    self.frames.get(slot.slot).copied().unwrap_or(0),
                    self.placeholders.get(slot.slot).copied().unwrap_or(0),
                    match &slot.image {
                        SlotImage::Image(_) => "live".to_string(),
                        SlotImage::Placeholder(placeholder) => format!("{:?}", placeholder),
                    }
                );
            }
            self.last_summary = Instant::now();
        }
    }
}
