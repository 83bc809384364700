//! Captured frames and the latest-frame cache.
//!
//! - `Frame`: one decoded RGB image plus capture metadata. `Clone` is a deep copy.
//! - `LatestFrame`: single-slot cache shared between a capture loop (writer)
//!   and display multiplexers (readers).
//!
//! The cached frame and its ok flag live under one mutex, so a reader never sees
//! a frame paired with the ok flag of a different read. Readers always get an
//! owned copy; the writer's buffer is never handed out by reference.

use image::RgbImage;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One decoded frame.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Per-connection capture counter, starting at 1.
    pub sequence: u64,
    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64) -> Self {
        Self {
            image,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// Build a frame from packed RGB8 bytes. Returns `None` when the buffer
    /// length does not match `width * height * 3`.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>, sequence: u64) -> Option<Self> {
        RgbImage::from_raw(width, height, pixels).map(|image| Self::new(image, sequence))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

// ----------------------------------------------------------------------------
// LatestFrame: lock-guarded single-slot cache
// ----------------------------------------------------------------------------

#[derive(Default)]
struct Slot {
    frame: Option<Frame>,
    ok: bool,
}

/// Most recent frame of one source.
///
/// `snapshot` returns `Some` only when a frame exists and the most recent read
/// succeeded. A failed read keeps the previous frame in place but clears `ok`.
#[derive(Default)]
pub struct LatestFrame {
    slot: Mutex<Slot>,
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached frame and mark the source healthy.
    pub fn store(&self, frame: Frame) {
        let mut slot = self.lock();
        slot.frame = Some(frame);
        slot.ok = true;
    }

    /// Record a failed read.
    pub fn mark_failed(&self) {
        self.lock().ok = false;
    }

    /// Deep copy of the cached frame, taken atomically with the ok flag.
    pub fn snapshot(&self) -> Option<Frame> {
        let slot = self.lock();
        match (&slot.frame, slot.ok) {
            (Some(frame), true) => Some(frame.clone()),
            _ => None,
        }
    }

    /// Whether any frame has ever been stored, healthy or not.
    pub fn has_frame(&self) -> bool {
        self.lock().frame.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Plain data, never torn: recover from poisoning.
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
