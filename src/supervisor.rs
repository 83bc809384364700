//! Per-source capture supervision.
//!
//! A `StreamSupervisor` runs one background thread per source. The thread reads
//! frames as fast as the source delivers them (bounded by a short poll
//! interval), keeps the newest one in a `LatestFrame` cache, and counts
//! consecutive failed reads. Once the count exceeds the failure threshold, the
//! capture handle is released, the thread waits out a cool-down, reopens the
//! same address and resets the count, whether or not the reopen worked.
//!
//! Read and reconnect failures never leave this module. Consumers only see
//! `get_frame() == None`. A source that never comes back keeps the thread
//! retrying at bounded CPU cost until `stop()`.
//!
//! State machine:
//!
//! ```text
//!   Connecting --read ok--> Streaming --read fails--> Stalled
//!        ^                      ^                        |
//!        |                      +-------read ok----------+
//!        |                                               | failures > threshold
//!        +----------- reopen ------- Backoff <-----------+
//! ```

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{Frame, LatestFrame};
use crate::ingest::{open_source, SourceConnection};
use crate::registry::SourceId;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 100;
pub const DEFAULT_RECONNECT_COOLDOWN: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Capture loop tuning.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Reconnect once consecutive failed reads exceed this count.
    pub failure_threshold: u32,
    /// Pause between releasing and reopening the capture handle.
    pub reconnect_cooldown: Duration,
    /// Sleep between reads. Must stay well below any render interval.
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reconnect_cooldown: DEFAULT_RECONNECT_COOLDOWN,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Handle (re)opened, no successful read yet.
    Connecting,
    /// Most recent read succeeded.
    Streaming,
    /// Reads failing, threshold not yet reached.
    Stalled,
    /// Handle released, waiting to reopen.
    Backoff,
    Stopped,
}

/// Point-in-time view of a supervisor, for status displays and logs.
#[derive(Clone, Debug)]
pub struct SupervisorStatus {
    pub state: StreamState,
    pub consecutive_failures: u32,
    pub reconnects: u64,
    pub frames_captured: u64,
    pub last_frame_at: Option<Instant>,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: StreamState::Connecting,
            consecutive_failures: 0,
            reconnects: 0,
            frames_captured: 0,
            last_frame_at: None,
        }
    }
}

struct Shared {
    latest: LatestFrame,
    running: AtomicBool,
    status: Mutex<SupervisorStatus>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, SupervisorStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// CaptureWorker: the loop body, owned by the capture thread
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PollOutcome {
    Frame,
    Failed(u32),
    ReconnectDue,
}

pub(crate) struct CaptureWorker {
    id: SourceId,
    connection: Box<dyn SourceConnection>,
    config: SupervisorConfig,
    shared: Arc<Shared>,
    consecutive_failures: u32,
}

impl CaptureWorker {
    fn open(&mut self) {
        self.set_state(StreamState::Connecting);
        match self.connection.connect() {
            Ok(()) => log::info!(
                "source {}: capture opened at {}",
                self.id,
                self.connection.address()
            ),
            Err(err) => log::warn!(
                "source {}: could not open {}: {:#}",
                self.id,
                self.connection.address(),
                err
            ),
        }
    }

    /// One read plus bookkeeping.
    pub(crate) fn poll_once(&mut self) -> PollOutcome {
        let read = match self.connection.next_frame() {
            Ok(Some(frame)) if !frame.is_empty() => Some(frame),
            Ok(_) => None,
            Err(err) => {
                log::debug!("source {}: read failed: {:#}", self.id, err);
                None
            }
        };

        match read {
            Some(frame) => {
                let captured_at = frame.captured_at;
                self.shared.latest.store(frame);
                self.consecutive_failures = 0;
                let mut status = self.shared.status();
                status.state = StreamState::Streaming;
                status.consecutive_failures = 0;
                status.frames_captured += 1;
                status.last_frame_at = Some(captured_at);
                PollOutcome::Frame
            }
            None => {
                self.shared.latest.mark_failed();
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                {
                    let mut status = self.shared.status();
                    if status.state == StreamState::Streaming {
                        status.state = StreamState::Stalled;
                    }
                    status.consecutive_failures = self.consecutive_failures;
                }
                if self.consecutive_failures > self.config.failure_threshold {
                    PollOutcome::ReconnectDue
                } else {
                    PollOutcome::Failed(self.consecutive_failures)
                }
            }
        }
    }

    /// Release, cool down, reopen. The failure count resets either way.
    pub(crate) fn reconnect(&mut self) {
        log::warn!(
            "source {}: reconnecting to {} after {} consecutive failed reads",
            self.id,
            self.connection.address(),
            self.consecutive_failures
        );
        self.connection.release();
        self.set_state(StreamState::Backoff);

        if !self.wait(self.config.reconnect_cooldown) {
            return;
        }

        self.open();
        self.consecutive_failures = 0;
        let mut status = self.shared.status();
        status.consecutive_failures = 0;
        status.reconnects += 1;
        if self.connection.is_open() {
            log::info!("source {}: reopened", self.id);
        } else {
            log::warn!("source {}: reopen failed, will keep retrying", self.id);
        }
    }

    fn run(mut self) {
        self.open();
        while self.shared.is_running() {
            if self.poll_once() == PollOutcome::ReconnectDue {
                self.reconnect();
            }
            std::thread::sleep(self.config.poll_interval);
        }
        self.connection.release();
        self.set_state(StreamState::Stopped);
        log::info!("source {}: capture loop exited", self.id);
    }

    /// Sleep in poll-interval steps so `stop()` is observed promptly.
    /// Returns false when stopped during the wait.
    fn wait(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        let step = self.config.poll_interval.max(Duration::from_millis(1));
        loop {
            if !self.shared.is_running() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(step.min(deadline - now));
        }
    }

    fn set_state(&self, state: StreamState) {
        self.shared.status().state = state;
    }
}

// ----------------------------------------------------------------------------
// StreamSupervisor
// ----------------------------------------------------------------------------

/// Background capture of one source with a non-blocking latest-frame cache.
///
/// Lifecycle is one-shot: `start()` once, `stop()` once. Restarting a source
/// means building a new supervisor.
pub struct StreamSupervisor {
    id: SourceId,
    address: String,
    shared: Arc<Shared>,
    worker: Option<CaptureWorker>,
    join: Option<JoinHandle<()>>,
}

impl StreamSupervisor {
    pub fn new(
        id: SourceId,
        connection: Box<dyn SourceConnection>,
        config: SupervisorConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            latest: LatestFrame::new(),
            running: AtomicBool::new(false),
            status: Mutex::new(SupervisorStatus::default()),
        });
        let address = connection.address().to_string();
        let worker = CaptureWorker {
            id,
            connection,
            config,
            shared: shared.clone(),
            consecutive_failures: 0,
        };
        Self {
            id,
            address,
            shared,
            worker: Some(worker),
            join: None,
        }
    }

    /// Build a supervisor for `address` using the backend its scheme selects.
    pub fn for_address(id: SourceId, address: &str, config: SupervisorConfig) -> Result<Self> {
        Ok(Self::new(id, open_source(address)?, config))
    }

    /// Spawn the capture thread.
    pub fn start(&mut self) -> Result<()> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("source {}: supervisor already started", self.id))?;
        self.shared.running.store(true, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("capture-{}", self.id))
            .spawn(move || worker.run());
        match spawned {
            Ok(join) => {
                self.join = Some(join);
                log::info!("source {}: supervisor started for {}", self.id, self.address);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(anyhow!("source {}: failed to spawn capture thread: {}", self.id, err))
            }
        }
    }

    /// Latest healthy frame, copied out. Never blocks on I/O.
    ///
    /// `None` when nothing has been captured yet or the most recent read failed.
    pub fn get_frame(&self) -> Option<Frame> {
        self.shared.latest.snapshot()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.shared.status().clone()
    }

    pub fn is_running(&self) -> bool {
        self.join.is_some() && self.shared.is_running()
    }

    /// Stop the capture thread and wait for it to release the handle.
    ///
    /// The thread notices within one poll interval (or one in-flight read).
    pub fn stop(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(mut worker) = self.worker.take() {
            // Never started: release directly.
            worker.connection.release();
            worker.set_state(StreamState::Stopped);
        }
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("source {}: capture thread panicked", self.id))?;
            log::info!("source {}: supervisor stopped", self.id);
        }
        Ok(())
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("{:#}", err);
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone, Copy)]
    enum Step {
        Frame(u8),
        NoData,
        Error,
    }

    /// Connection that replays a script, then repeats `fallback` forever.
    struct ScriptedConnection {
        script: Arc<Mutex<VecDeque<Step>>>,
        fallback: Step,
        connects: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        connect_ok: bool,
        open: bool,
        sequence: u64,
    }

    struct ScriptHandles {
        script: Arc<Mutex<VecDeque<Step>>>,
        connects: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    fn scripted(steps: Vec<Step>, fallback: Step, connect_ok: bool) -> (ScriptedConnection, ScriptHandles) {
        let script = Arc::new(Mutex::new(steps.into_iter().collect::<VecDeque<_>>()));
        let connects = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let connection = ScriptedConnection {
            script: script.clone(),
            fallback,
            connects: connects.clone(),
            releases: releases.clone(),
            connect_ok,
            open: false,
            sequence: 0,
        };
        (
            connection,
            ScriptHandles {
                script,
                connects,
                releases,
            },
        )
    }

    impl SourceConnection for ScriptedConnection {
        fn address(&self) -> &str {
            "scripted://test"
        }

        fn connect(&mut self) -> Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.open = self.connect_ok;
            if self.connect_ok {
                Ok(())
            } else {
                Err(anyhow!("unreachable"))
            }
        }

        fn next_frame(&mut self) -> Result<Option<Frame>> {
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(self.fallback);
            match step {
                Step::Frame(value) => {
                    self.sequence += 1;
                    let image = RgbImage::from_pixel(2, 2, Rgb([value; 3]));
                    Ok(Some(Frame::new(image, self.sequence)))
                }
                Step::NoData => Ok(None),
                Step::Error => Err(anyhow!("transient i/o")),
            }
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    fn test_config() -> SupervisorConfig {
        SupervisorConfig {
            failure_threshold: 100,
            reconnect_cooldown: Duration::ZERO,
            poll_interval: Duration::from_millis(1),
        }
    }

    fn worker_for(connection: ScriptedConnection, config: SupervisorConfig) -> StreamSupervisor {
        StreamSupervisor::new(SourceId(7), Box::new(connection), config)
    }

    #[test]
    fn latest_frame_tracks_each_successful_read() {
        let steps = (1..=5).map(Step::Frame).collect();
        let (connection, _handles) = scripted(steps, Step::NoData, true);
        let mut supervisor = worker_for(connection, test_config());
        let worker = supervisor.worker.as_mut().unwrap();
        worker.shared.running.store(true, Ordering::SeqCst);
        worker.open();

        for n in 1..=5u8 {
            assert_eq!(worker.poll_once(), PollOutcome::Frame);
            let frame = supervisor_frame(&worker.shared).expect("frame after success");
            assert_eq!(frame.sequence, n as u64);
            assert_eq!(frame.image.get_pixel(0, 0), &Rgb([n; 3]));
        }
    }

    fn supervisor_frame(shared: &Shared) -> Option<Frame> {
        shared.latest.snapshot()
    }

    #[test]
    fn failed_read_clears_ok_flag() {
        let (connection, _handles) = scripted(vec![Step::Frame(1), Step::Error], Step::NoData, true);
        let mut supervisor = worker_for(connection, test_config());
        let worker = supervisor.worker.as_mut().unwrap();
        worker.open();

        assert_eq!(worker.poll_once(), PollOutcome::Frame);
        assert_eq!(worker.poll_once(), PollOutcome::Failed(1));
        assert!(worker.shared.latest.snapshot().is_none());
        assert_eq!(worker.shared.status().state, StreamState::Stalled);
    }

    #[test]
    fn reconnect_happens_once_after_threshold_is_exceeded() {
        let (connection, handles) = scripted(vec![], Step::NoData, true);
        let mut supervisor = worker_for(connection, test_config());
        let worker = supervisor.worker.as_mut().unwrap();
        worker.shared.running.store(true, Ordering::SeqCst);
        worker.open();
        assert_eq!(handles.connects.load(Ordering::SeqCst), 1);

        for n in 1..=100 {
            assert_eq!(worker.poll_once(), PollOutcome::Failed(n));
        }
        assert_eq!(worker.poll_once(), PollOutcome::ReconnectDue);
        worker.reconnect();

        assert_eq!(handles.connects.load(Ordering::SeqCst), 2);
        assert_eq!(handles.releases.load(Ordering::SeqCst), 1);
        assert_eq!(worker.consecutive_failures, 0);
        let status = worker.shared.status().clone();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.reconnects, 1);

        // The count starts over: the next failure is number one again.
        assert_eq!(worker.poll_once(), PollOutcome::Failed(1));
    }

    #[test]
    fn failure_count_resets_even_when_reopen_fails() {
        let (connection, handles) = scripted(vec![], Step::Error, false);
        let config = SupervisorConfig {
            failure_threshold: 3,
            ..test_config()
        };
        let mut supervisor = worker_for(connection, config);
        let worker = supervisor.worker.as_mut().unwrap();
        worker.shared.running.store(true, Ordering::SeqCst);
        worker.open();

        for _ in 0..3 {
            assert!(matches!(worker.poll_once(), PollOutcome::Failed(_)));
        }
        assert_eq!(worker.poll_once(), PollOutcome::ReconnectDue);
        worker.reconnect();

        assert_eq!(handles.connects.load(Ordering::SeqCst), 2);
        assert_eq!(worker.consecutive_failures, 0);
        assert!(!worker.connection.is_open());
        assert_eq!(worker.poll_once(), PollOutcome::Failed(1));
    }

    #[test]
    fn success_resets_failure_count() {
        let steps = vec![Step::NoData, Step::NoData, Step::Frame(3), Step::NoData];
        let (connection, _handles) = scripted(steps, Step::NoData, true);
        let mut supervisor = worker_for(connection, test_config());
        let worker = supervisor.worker.as_mut().unwrap();
        worker.open();

        assert_eq!(worker.poll_once(), PollOutcome::Failed(1));
        assert_eq!(worker.poll_once(), PollOutcome::Failed(2));
        assert_eq!(worker.poll_once(), PollOutcome::Frame);
        assert_eq!(worker.poll_once(), PollOutcome::Failed(1));
    }

    #[test]
    fn background_thread_publishes_frames_and_stops() -> Result<()> {
        let (connection, handles) = scripted(vec![], Step::Frame(42), true);
        let mut supervisor = worker_for(connection, test_config());
        assert!(supervisor.get_frame().is_none());

        supervisor.start()?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.get_frame().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let frame = supervisor.get_frame().expect("frame from capture thread");
        assert_eq!(frame.image.get_pixel(1, 1), &Rgb([42; 3]));
        assert_eq!(supervisor.status().state, StreamState::Streaming);

        supervisor.stop()?;
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.status().state, StreamState::Stopped);
        assert!(handles.releases.load(Ordering::SeqCst) >= 1);
        Ok(())
    }

    #[test]
    fn start_is_one_shot() -> Result<()> {
        let (connection, _handles) = scripted(vec![], Step::NoData, true);
        let mut supervisor = worker_for(connection, test_config());
        supervisor.start()?;
        supervisor.stop()?;
        assert!(supervisor.start().is_err());
        Ok(())
    }

    #[test]
    fn stop_interrupts_cooldown() -> Result<()> {
        let (connection, _handles) = scripted(vec![], Step::NoData, true);
        let config = SupervisorConfig {
            failure_threshold: 0,
            reconnect_cooldown: Duration::from_secs(60),
            poll_interval: Duration::from_millis(1),
        };
        let mut supervisor = worker_for(connection, config);
        supervisor.start()?;

        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.status().state != StreamState::Backoff && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(supervisor.status().state, StreamState::Backoff);

        let started = Instant::now();
        supervisor.stop()?;
        assert!(started.elapsed() < Duration::from_secs(5));
        Ok(())
    }

    #[test]
    fn stopping_unstarted_supervisor_releases_handle() -> Result<()> {
        let (connection, handles) = scripted(vec![], Step::NoData, true);
        let mut supervisor = worker_for(connection, test_config());
        supervisor.stop()?;
        assert_eq!(handles.releases.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.status().state, StreamState::Stopped);
        Ok(())
    }

    #[test]
    fn stub_address_streams_through_supervisor() -> Result<()> {
        let mut supervisor = StreamSupervisor::for_address(
            SourceId(1),
            "stub://door?width=16&height=9",
            test_config(),
        )?;
        supervisor.start()?;
        let deadline = Instant::now() + Duration::from_secs(5);
        while supervisor.get_frame().is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        let frame = supervisor.get_frame().expect("stub frame");
        assert_eq!((frame.width(), frame.height()), (16, 9));
        Ok(())
    }
}
