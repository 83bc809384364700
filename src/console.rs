//! Application glue: sources, displays and their timers.
//!
//! The `Console` owns the source registry, every open display and one
//! cooperative `Scheduler`. Each display has at most one render timer and at
//! most one rotation timer pending at any time. All callbacks run on the
//! thread that calls `tick`/`run`; the only other threads are the capture
//! threads inside the registry.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::compositor::{fill_crop, slot_rects, Rect};
use crate::config::{rotation_from_secs, DisplaySettings, FrameRate, WallConfig};
use crate::multiplex::{DisplayMultiplexer, Placeholder, Slot, SlotContent, Topology};
use crate::registry::{SourceId, SourceRecord, SourceRegistry, SourceUpdate};
use crate::scheduler::{Scheduler, TimerId};
use crate::supervisor::SupervisorConfig;

const MAX_IDLE_SLEEP: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DisplayId(u64);

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "display-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerEvent {
    Render(DisplayId),
    Rotate(DisplayId),
}

/// Pixel size of one display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisplayGeometry {
    pub width: u32,
    pub height: u32,
    /// Grid cell inset; single displays ignore it.
    pub padding: u32,
}

impl DisplayGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            padding: 0,
        }
    }

    pub fn with_padding(mut self, padding: u32) -> Self {
        self.padding = padding;
        self
    }
}

#[derive(Clone, Debug)]
pub enum SlotImage {
    /// Frame fill-cropped to the slot rectangle.
    Image(RgbImage),
    Placeholder(Placeholder),
}

/// One composited slot, ready for presentation.
#[derive(Clone, Debug)]
pub struct SlotOutput {
    pub slot: usize,
    pub rect: Rect,
    pub source: Option<SourceId>,
    pub image: SlotImage,
}

/// Receives every composited render pass of a display.
pub trait PresentationSink {
    fn present(&mut self, display: DisplayId, slots: &[SlotOutput]);
}

struct DisplayState {
    multiplexer: DisplayMultiplexer,
    geometry: DisplayGeometry,
    sink: Box<dyn PresentationSink>,
    render_timer: Option<TimerId>,
    rotation_timer: Option<TimerId>,
}

pub struct Console {
    registry: SourceRegistry,
    scheduler: Scheduler<TimerEvent>,
    settings: DisplaySettings,
    max_grid_sources: usize,
    displays: BTreeMap<DisplayId, DisplayState>,
    next_display: u64,
}

impl Console {
    pub fn new(settings: DisplaySettings, capture: SupervisorConfig, max_grid_sources: usize) -> Self {
        Self {
            registry: SourceRegistry::new(capture),
            scheduler: Scheduler::new(),
            settings,
            max_grid_sources,
            displays: BTreeMap::new(),
            next_display: 1,
        }
    }

    /// Console with every configured source registered and capturing.
    pub fn from_config(config: &WallConfig) -> Result<Self> {
        let mut console = Self::new(
            config.settings,
            config.capture,
            config.layout.max_grid_sources,
        );
        for record in &config.sources {
            console.add_source(record.clone())?;
        }
        Ok(console)
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn settings(&self) -> DisplaySettings {
        self.settings
    }

    pub fn scheduler(&self) -> &Scheduler<TimerEvent> {
        &self.scheduler
    }

    pub fn display_ids(&self) -> Vec<DisplayId> {
        self.displays.keys().copied().collect()
    }

    pub fn multiplexer(&self, display: DisplayId) -> Option<&DisplayMultiplexer> {
        self.displays.get(&display).map(|state| &state.multiplexer)
    }

    pub fn render_plan(&self, display: DisplayId) -> Option<&[Slot]> {
        self.multiplexer(display).map(|m| m.render_plan())
    }

    // ------------------------------------------------------------------------
    // Displays
    // ------------------------------------------------------------------------

    /// Open a display over `sources` (in order). The first render is due
    /// immediately; the first rotation one rotation period later.
    pub fn open_display(
        &mut self,
        topology: Topology,
        sources: Vec<SourceId>,
        geometry: DisplayGeometry,
        sink: Box<dyn PresentationSink>,
        now: Instant,
    ) -> Result<DisplayId> {
        if let Some(unknown) = sources.iter().find(|id| !self.registry.contains(**id)) {
            return Err(anyhow!("source {} not registered", unknown));
        }
        let multiplexer = DisplayMultiplexer::new(topology, sources, self.max_grid_sources)?;

        let id = DisplayId(self.next_display);
        self.next_display += 1;

        let render_timer = Some(self.scheduler.schedule_at(now, TimerEvent::Render(id)));
        let rotation_timer = self
            .settings
            .auto_rotate
            .then(|| self.schedule_rotation(id, now));
        self.displays.insert(
            id,
            DisplayState {
                multiplexer,
                geometry,
                sink,
                render_timer,
                rotation_timer,
            },
        );
        log::info!(
            "{} opened: {} topology, {}x{}",
            id,
            topology.name(),
            geometry.width,
            geometry.height
        );
        Ok(id)
    }

    /// Cancel both timers, then drop the display.
    pub fn close_display(&mut self, display: DisplayId) -> Result<()> {
        let state = self
            .displays
            .get_mut(&display)
            .ok_or_else(|| anyhow!("{} is not open", display))?;
        for timer in [state.render_timer.take(), state.rotation_timer.take()]
            .into_iter()
            .flatten()
        {
            self.scheduler.cancel(timer);
        }
        self.displays.remove(&display);
        log::info!("{} closed", display);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    /// Takes effect from each display's next render tick.
    pub fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        self.settings.frame_rate = FrameRate::new(fps)?;
        log::info!("frame rate set to {}", self.settings.frame_rate);
        Ok(())
    }

    /// Replace every display's pending rotation timer with one due a full new
    /// period from `now`.
    pub fn set_rotation_time(&mut self, secs: u64, now: Instant) -> Result<()> {
        self.settings.rotation = rotation_from_secs(secs)?;
        log::info!("rotation time set to {}s", secs);
        if self.settings.auto_rotate {
            self.reschedule_rotations(now);
        }
        Ok(())
    }

    pub fn set_auto_rotate(&mut self, enabled: bool, now: Instant) {
        if self.settings.auto_rotate == enabled {
            return;
        }
        self.settings.auto_rotate = enabled;
        log::info!("auto-rotate {}", if enabled { "enabled" } else { "disabled" });
        if enabled {
            self.reschedule_rotations(now);
        } else {
            for state in self.displays.values_mut() {
                if let Some(timer) = state.rotation_timer.take() {
                    self.scheduler.cancel(timer);
                }
            }
        }
    }

    fn reschedule_rotations(&mut self, now: Instant) {
        let ids = self.display_ids();
        for id in ids {
            let previous = self
                .displays
                .get_mut(&id)
                .and_then(|state| state.rotation_timer.take());
            if let Some(timer) = previous {
                self.scheduler.cancel(timer);
            }
            let timer = self.schedule_rotation(id, now);
            if let Some(state) = self.displays.get_mut(&id) {
                state.rotation_timer = Some(timer);
            }
        }
    }

    fn schedule_rotation(&mut self, id: DisplayId, now: Instant) -> TimerId {
        self.scheduler
            .schedule_after(now, self.settings.rotation, TimerEvent::Rotate(id))
    }

    // ------------------------------------------------------------------------
    // Sources
    // ------------------------------------------------------------------------

    pub fn add_source(&mut self, record: SourceRecord) -> Result<()> {
        self.registry.add(record)
    }

    /// Append a registered source to an open display.
    pub fn attach_source(&mut self, display: DisplayId, source: SourceId) -> Result<()> {
        if !self.registry.contains(source) {
            return Err(anyhow!("source {} not registered", source));
        }
        let state = self
            .displays
            .get_mut(&display)
            .ok_or_else(|| anyhow!("{} is not open", display))?;
        state.multiplexer.add_source(source)
    }

    /// Stop the source's supervisor, then drop it from every display.
    pub fn remove_source(&mut self, source: SourceId) -> Result<SourceRecord> {
        let record = self.registry.remove(source)?;
        for (id, state) in self.displays.iter_mut() {
            if state.multiplexer.remove_source(source) {
                log::info!("{}: source {} removed from rotation", id, source);
            }
        }
        Ok(record)
    }

    pub fn update_source(&mut self, source: SourceId, update: SourceUpdate) -> Result<()> {
        self.registry.update(source, update)
    }

    pub fn restart_source(&mut self, source: SourceId) -> Result<()> {
        self.registry.restart(source)
    }

    /// Returns the sources that failed to restart.
    pub fn restart_all(&mut self) -> Vec<SourceId> {
        self.registry.restart_all()
    }

    // ------------------------------------------------------------------------
    // Timer loop
    // ------------------------------------------------------------------------

    /// Run every timer due at `now`, in deadline order. Returns how many fired.
    pub fn tick(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some((timer, event)) = self.scheduler.pop_due(now) {
            fired += 1;
            match event {
                TimerEvent::Render(id) => self.on_render(id, timer, now),
                TimerEvent::Rotate(id) => self.on_rotate(id, timer, now),
            }
        }
        fired
    }

    fn on_render(&mut self, id: DisplayId, timer: TimerId, now: Instant) {
        let interval = self.settings.frame_rate.interval();
        let Some(state) = self.displays.get_mut(&id) else {
            return;
        };
        if state.render_timer != Some(timer) {
            return;
        }
        present(&self.registry, id, state);
        state.render_timer = Some(
            self.scheduler
                .schedule_after(now, interval, TimerEvent::Render(id)),
        );
    }

    fn on_rotate(&mut self, id: DisplayId, timer: TimerId, now: Instant) {
        let auto_rotate = self.settings.auto_rotate;
        let rotation = self.settings.rotation;
        let Some(state) = self.displays.get_mut(&id) else {
            return;
        };
        if state.rotation_timer != Some(timer) {
            return;
        }
        state.rotation_timer = None;
        state.multiplexer.rotate();
        present(&self.registry, id, state);
        if auto_rotate {
            state.rotation_timer = Some(self.scheduler.schedule_after(
                now,
                rotation,
                TimerEvent::Rotate(id),
            ));
        }
    }

    /// Drive `tick` on the calling thread until `stop` is set or `deadline`
    /// passes.
    pub fn run(&mut self, stop: &AtomicBool, deadline: Option<Instant>) {
        log::info!("console running with {} display(s)", self.displays.len());
        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                break;
            }
            self.tick(now);

            let mut wake = now + MAX_IDLE_SLEEP;
            if let Some(next) = self.scheduler.next_deadline() {
                wake = wake.min(next);
            }
            if let Some(deadline) = deadline {
                wake = wake.min(deadline);
            }
            let idle = wake.saturating_duration_since(Instant::now());
            if !idle.is_zero() {
                std::thread::sleep(idle);
            }
        }
    }

    /// Close every display and stop every capture thread.
    pub fn shutdown(&mut self) {
        for id in self.display_ids() {
            if let Err(err) = self.close_display(id) {
                log::warn!("{:#}", err);
            }
        }
        self.scheduler.clear();
        self.registry.stop_all();
        log::info!("console shut down");
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Render one pass of `state` and hand it to its sink.
fn present(registry: &SourceRegistry, id: DisplayId, state: &mut DisplayState) {
    let topology = state.multiplexer.topology();
    let padding = match topology {
        Topology::Single => 0,
        Topology::Grid { .. } => state.geometry.padding,
    };
    let rects = slot_rects(
        topology.slot_count(),
        state.geometry.width,
        state.geometry.height,
        padding,
    );

    let frames = state.multiplexer.render(registry);
    let outputs: Vec<SlotOutput> = frames
        .into_iter()
        .zip(rects)
        .map(|(frame, rect)| {
            let image = match frame.content {
                SlotContent::Frame(captured) => {
                    match fill_crop(Some(&captured), rect.width, rect.height) {
                        Some(image) => SlotImage::Image(image),
                        None => SlotImage::Placeholder(Placeholder::Loading),
                    }
                }
                SlotContent::Placeholder(placeholder) => SlotImage::Placeholder(placeholder),
            };
            SlotOutput {
                slot: frame.slot,
                rect,
                source: frame.source,
                image,
            }
        })
        .collect();
    state.sink.present(id, &outputs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    type Presented = Arc<Mutex<Vec<(DisplayId, Vec<SlotOutput>)>>>;

    struct CollectingSink(Presented);

    impl PresentationSink for CollectingSink {
        fn present(&mut self, display: DisplayId, slots: &[SlotOutput]) {
            self.0.lock().unwrap().push((display, slots.to_vec()));
        }
    }

    fn collecting() -> (Box<dyn PresentationSink>, Presented) {
        let presented: Presented = Arc::new(Mutex::new(Vec::new()));
        (Box::new(CollectingSink(presented.clone())), presented)
    }

    fn console_with_sources(count: u64) -> Result<Console> {
        let mut console = Console::new(
            DisplaySettings::default(),
            SupervisorConfig {
                failure_threshold: 5,
                reconnect_cooldown: Duration::from_millis(5),
                poll_interval: Duration::from_millis(1),
            },
            20,
        );
        for id in 1..=count {
            console.add_source(SourceRecord::new(
                id,
                format!("cam{}", id),
                format!("stub://cam{}?width=16&height=12", id),
            ))?;
        }
        Ok(console)
    }

    fn all_ids(count: u64) -> Vec<SourceId> {
        (1..=count).map(SourceId).collect()
    }

    #[test]
    fn open_display_schedules_render_and_rotation() -> Result<()> {
        let mut console = console_with_sources(2)?;
        let (sink, presented) = collecting();
        let t0 = Instant::now();
        console.open_display(Topology::Single, all_ids(2), DisplayGeometry::new(64, 48), sink, t0)?;
        assert_eq!(console.scheduler().pending(), 2);

        // Render fires at once and re-arms itself.
        assert_eq!(console.tick(t0), 1);
        assert_eq!(presented.lock().unwrap().len(), 1);
        assert_eq!(console.scheduler().pending(), 2);
        Ok(())
    }

    #[test]
    fn rotation_change_replaces_exactly_one_timer() -> Result<()> {
        let mut console = console_with_sources(10)?;
        let (sink, _presented) = collecting();
        let t0 = Instant::now();
        let display =
            console.open_display(Topology::grid(), all_ids(10), DisplayGeometry::new(64, 48), sink, t0)?;

        let scheduled = console.scheduler().scheduled_count();
        let cancelled = console.scheduler().cancelled_count();
        console.set_rotation_time(5, t0)?;
        assert_eq!(console.scheduler().scheduled_count(), scheduled + 1);
        assert_eq!(console.scheduler().cancelled_count(), cancelled + 1);
        assert_eq!(console.scheduler().pending(), 2);

        // The old 10 s timer must not fire; the new 5 s timer fires once.
        console.tick(t0 + Duration::from_secs(5));
        assert_eq!(console.multiplexer(display).map(|m| m.page()), Some(1));
        console.tick(t0 + Duration::from_secs(9));
        assert_eq!(console.multiplexer(display).map(|m| m.page()), Some(1));
        console.tick(t0 + Duration::from_secs(10));
        assert_eq!(console.multiplexer(display).map(|m| m.page()), Some(2));
        Ok(())
    }

    #[test]
    fn invalid_settings_leave_state_unchanged() -> Result<()> {
        let mut console = console_with_sources(1)?;
        let before = console.settings();
        assert!(console.set_frame_rate(24).is_err());
        assert!(console.set_rotation_time(0, Instant::now()).is_err());
        assert_eq!(console.settings(), before);
        Ok(())
    }

    #[test]
    fn grid_rotation_presents_immediately() -> Result<()> {
        let mut console = console_with_sources(10)?;
        let (sink, presented) = collecting();
        let t0 = Instant::now();
        let display =
            console.open_display(Topology::grid(), all_ids(10), DisplayGeometry::new(64, 48), sink, t0)?;
        console.set_frame_rate(1)?;
        console.tick(t0);
        presented.lock().unwrap().clear();

        let mut pages = Vec::new();
        for n in 1..=4 {
            console.tick(t0 + Duration::from_secs(10 * n) - Duration::from_millis(1));
            let before = presented.lock().unwrap().len();
            console.tick(t0 + Duration::from_secs(10 * n));
            assert!(presented.lock().unwrap().len() > before);
            pages.push(console.multiplexer(display).map(|m| m.page()).unwrap_or(99));
        }
        assert_eq!(pages, vec![1, 2, 0, 1]);
        Ok(())
    }

    #[test]
    fn disabling_auto_rotate_cancels_rotation() -> Result<()> {
        let mut console = console_with_sources(3)?;
        let (sink, _presented) = collecting();
        let t0 = Instant::now();
        console.open_display(Topology::Single, all_ids(3), DisplayGeometry::new(32, 32), sink, t0)?;
        console.set_auto_rotate(false, t0);
        assert_eq!(console.scheduler().pending(), 1);

        // Only the render timer fires and re-arms.
        assert_eq!(console.tick(t0 + Duration::from_secs(60)), 1);
        assert_eq!(console.scheduler().pending(), 1);

        console.set_auto_rotate(true, t0);
        assert_eq!(console.scheduler().pending(), 2);
        Ok(())
    }

    #[test]
    fn close_display_cancels_both_timers() -> Result<()> {
        let mut console = console_with_sources(2)?;
        let (sink, presented) = collecting();
        let t0 = Instant::now();
        let display =
            console.open_display(Topology::Single, all_ids(2), DisplayGeometry::new(32, 32), sink, t0)?;
        console.close_display(display)?;
        assert_eq!(console.scheduler().pending(), 0);
        assert_eq!(console.tick(t0 + Duration::from_secs(60)), 0);
        assert!(presented.lock().unwrap().is_empty());
        assert!(console.close_display(display).is_err());
        Ok(())
    }

    #[test]
    fn removing_source_updates_every_display() -> Result<()> {
        let mut console = console_with_sources(3)?;
        let t0 = Instant::now();
        let (sink_a, _) = collecting();
        let (sink_b, _) = collecting();
        let grid =
            console.open_display(Topology::grid(), all_ids(3), DisplayGeometry::new(64, 48), sink_a, t0)?;
        let single =
            console.open_display(Topology::Single, all_ids(3), DisplayGeometry::new(64, 48), sink_b, t0)?;

        console.remove_source(SourceId(1))?;
        assert!(!console.registry().contains(SourceId(1)));
        for display in [grid, single] {
            let multiplexer = console.multiplexer(display).expect("open display");
            assert!(!multiplexer.sources().contains(&SourceId(1)));
            assert!(!multiplexer.assigned().contains(&SourceId(1)));
            assert!(multiplexer
                .render_plan()
                .iter()
                .all(|slot| slot.source != Some(SourceId(1))));
        }
        assert_eq!(
            console.render_plan(single).map(|plan| plan[0].source),
            Some(Some(SourceId(2)))
        );
        Ok(())
    }

    #[test]
    fn open_display_rejects_unknown_sources() -> Result<()> {
        let mut console = console_with_sources(1)?;
        let (sink, _) = collecting();
        let result = console.open_display(
            Topology::Single,
            vec![SourceId(1), SourceId(42)],
            DisplayGeometry::new(32, 32),
            sink,
            Instant::now(),
        );
        assert!(result.is_err());
        assert_eq!(console.scheduler().pending(), 0);
        Ok(())
    }

    #[test]
    fn attach_source_extends_display() -> Result<()> {
        let mut console = console_with_sources(2)?;
        let (sink, _) = collecting();
        let display = console.open_display(
            Topology::grid(),
            vec![SourceId(1)],
            DisplayGeometry::new(32, 32),
            sink,
            Instant::now(),
        )?;
        console.attach_source(display, SourceId(2))?;
        assert_eq!(
            console.multiplexer(display).map(|m| m.sources().to_vec()),
            Some(all_ids(2))
        );
        assert!(console.attach_source(display, SourceId(3)).is_err());
        Ok(())
    }

    fn wait_for_frame(console: &Console, source: SourceId) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if console.registry().frame(source).is_some() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn rejected_source_operations_leave_displays_unchanged() -> Result<()> {
        let mut console = console_with_sources(2)?;
        let (sink, presented) = collecting();
        let t0 = Instant::now();
        let display =
            console.open_display(Topology::Single, all_ids(2), DisplayGeometry::new(32, 24), sink, t0)?;
        assert!(wait_for_frame(&console, SourceId(1)));
        let plan_before = console.render_plan(display).map(|plan| plan.to_vec());
        let pending_before = console.scheduler().pending();

        let bad_address = SourceUpdate {
            name: None,
            address: Some("stub://cam1?width=0".into()),
        };
        assert!(console.update_source(SourceId(1), bad_address).is_err());
        assert!(console.remove_source(SourceId(9)).is_err());
        assert!(console.attach_source(display, SourceId(9)).is_err());
        assert!(console.restart_source(SourceId(9)).is_err());

        assert!(console.registry().contains(SourceId(1)));
        assert_eq!(
            console.registry().record(SourceId(1)).map(|r| r.address.clone()),
            Some("stub://cam1?width=16&height=12".to_string())
        );
        assert_eq!(console.render_plan(display).map(|plan| plan.to_vec()), plan_before);
        assert_eq!(console.scheduler().pending(), pending_before);

        assert!(wait_for_frame(&console, SourceId(1)));
        console.tick(t0);
        let presented = presented.lock().unwrap();
        let (_, slots) = presented.last().expect("one presentation");
        assert_eq!(slots[0].source, Some(SourceId(1)));
        assert!(matches!(slots[0].image, SlotImage::Image(_)));
        Ok(())
    }

    #[test]
    fn oversized_grid_is_rejected_without_timers() -> Result<()> {
        let mut console = Console::new(DisplaySettings::default(), SupervisorConfig::default(), 2);
        for id in 1..=3 {
            console.add_source(SourceRecord::new(id, format!("cam{}", id), format!("stub://cam{}", id)))?;
        }
        let (sink, _) = collecting();
        let result = console.open_display(
            Topology::grid(),
            all_ids(3),
            DisplayGeometry::new(32, 32),
            sink,
            Instant::now(),
        );
        assert!(result.is_err());
        assert!(console.display_ids().is_empty());
        assert_eq!(console.scheduler().pending(), 0);
        assert_eq!(console.scheduler().scheduled_count(), 0);
        Ok(())
    }
}
