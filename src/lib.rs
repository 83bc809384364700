//! Camera Wall
//!
//! Continuous acquisition from many unreliable video sources, multiplexed onto
//! a fixed set of display slots.
//!
//! # Architecture
//!
//! 1. **Capture never blocks display**: each source runs in its own thread and
//!    publishes into a lock-guarded single-frame cache; readers take copies.
//! 2. **Sources heal themselves**: too many failed reads in a row trigger a
//!    release, a cool-down and a reopen, forever, until the source is removed.
//! 3. **No duplicates per display**: a display never shows one source in two
//!    slots; a failed slot is handed to a source not already on screen.
//! 4. **One scheduler**: render and rotation timers of every display run in
//!    order on a single cooperative scheduler.
//!
//! # Module Structure
//!
//! - `frame`: captured frames and the latest-frame cache
//! - `ingest`: source connections (synthetic, HTTP MJPEG, GStreamer)
//! - `supervisor`: per-source capture thread with reconnect
//! - `registry`: source records and their supervisors
//! - `multiplex`: slot assignment, rotation and failure reassignment
//! - `compositor`: fill-crop scaling and slot layout
//! - `scheduler`: cooperative timer queue
//! - `console`: displays, timers and presentation sinks
//! - `config`: file and environment configuration

pub mod compositor;
pub mod config;
pub mod console;
pub mod frame;
pub mod ingest;
pub mod multiplex;
pub mod registry;
pub mod scheduler;
pub mod supervisor;

pub use compositor::{fill_crop, fill_crop_image, Rect};
pub use config::{DisplaySettings, FrameRate, LayoutSettings, WallConfig};
pub use console::{
    Console, DisplayGeometry, DisplayId, PresentationSink, SlotImage, SlotOutput,
};
pub use frame::{Frame, LatestFrame};
pub use ingest::{open_source, SourceConnection, StubSource};
pub use multiplex::{DisplayMultiplexer, Placeholder, Reassignment, Slot, SlotState, Topology};
pub use registry::{FrameLookup, FrameProvider, SourceId, SourceRecord, SourceRegistry, SourceUpdate};
pub use scheduler::{Scheduler, TimerId};
pub use supervisor::{StreamState, StreamSupervisor, SupervisorConfig, SupervisorStatus};
