//! Per-camera capture pipeline.
//!
//! Each pipeline owns two threads while recording: a capture thread driving
//! capture -> encode, and a writer thread appending encoded units to storage.
//! The pipeline transitions only in response to commands from the session or
//! to fatal collaborator conditions; any command not permitted in the current
//! state returns `InvalidState` without mutating anything.

use buffer_pool::{BufferPool, ReleaseOutcome};
use camera::CameraSource;
use common_io::{PipelineState, RecorderError, Result, SurfaceStorage};
use config::{CameraConfig, SessionConfig};
use encoder::VideoEncoder;
use monitor::{AlertLevel, PipelineMonitor};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use storage::RecordSink;
use stream_sync::StreamSync;
use tracing::{debug, error, info, warn};

/// Runtime knobs for one pipeline, derived from the session configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub camera: CameraConfig,
    pub post_encode_queue: usize,
    pub backpressure_error: Duration,
    pub drain_deadline: Duration,
}

impl PipelineConfig {
    pub fn from_session(session: &SessionConfig, camera: CameraConfig) -> Self {
        Self {
            camera,
            post_encode_queue: session.post_encode_queue,
            backpressure_error: Duration::from_millis(session.backpressure_error_ms),
            drain_deadline: Duration::from_secs(session.drain_deadline_secs),
        }
    }
}

/// Notifications surfaced to the session supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    FirstFrame { camera_id: u32 },
    Fatal { camera_id: u32, reason: String },
}

/// Counter snapshot, safe to read from any thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct PipelineCounters {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub frames_encoded: u64,
    pub bytes_written: u64,
    pub last_timestamp_ns: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub camera_id: u32,
    pub state: PipelineState,
    pub paused: bool,
    pub counters: PipelineCounters,
    pub elapsed: Duration,
}

#[derive(Default)]
struct Counters {
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    frames_encoded: AtomicU64,
    bytes_written: AtomicU64,
    last_timestamp_ns: AtomicU64,
}

/// Collaborator fault accounting: a second fault inside the window is fatal.
struct FaultWindow {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl FaultWindow {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    /// Record one fault; returns true when it should be fatal.
    fn record(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        let fatal = matches!(*last, Some(t) if now.duration_since(t) <= self.window);
        *last = Some(now);
        fatal
    }
}

struct Shared {
    camera_id: u32,
    state: Mutex<PipelineState>,
    paused: AtomicBool,
    stop_requested: AtomicBool,
    force_stop: AtomicBool,
    fatal: AtomicBool,
    counters: Counters,
    faults: FaultWindow,
}

impl Shared {
    fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: PipelineState) {
        *self.state.lock().unwrap() = state;
    }

    /// Classify one collaborator error; escalates to Error state when the
    /// fault window trips. Only transient errors get the retry-next-frame
    /// grace; anything else is fatal on first sight. Returns true when the
    /// pipeline became fatal.
    fn on_fault(
        &self,
        monitor: &PipelineMonitor,
        events: &mpsc::Sender<PipelineEvent>,
        what: &str,
        err: &RecorderError,
    ) -> bool {
        if !err.is_transient() || self.faults.record() {
            self.fatal.store(true, Ordering::SeqCst);
            self.set_state(PipelineState::Error);
            let reason = format!("{}: {}", what, err);
            error!(camera = self.camera_id, %reason, "pipeline fault is fatal");
            monitor.raise(
                AlertLevel::Error,
                &format!("Camera{}", self.camera_id),
                &reason,
            );
            let _ = events.send(PipelineEvent::Fatal {
                camera_id: self.camera_id,
                reason,
            });
            true
        } else {
            warn!(camera = self.camera_id, %err, "transient {} fault, retrying next frame", what);
            false
        }
    }
}

/// Cloneable read-only view of a pipeline, for supervisors and health
/// probes running on other threads.
#[derive(Clone)]
pub struct PipelineHandle {
    shared: Arc<Shared>,
}

impl PipelineHandle {
    pub fn camera_id(&self) -> u32 {
        self.shared.camera_id
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn is_fatal(&self) -> bool {
        self.shared.fatal.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> PipelineCounters {
        let c = &self.shared.counters;
        PipelineCounters {
            frames_captured: c.frames_captured.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            frames_encoded: c.frames_encoded.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            last_timestamp_ns: c.last_timestamp_ns.load(Ordering::Relaxed),
        }
    }
}

/// State machine and thread supervisor for one camera.
pub struct CapturePipeline {
    shared: Arc<Shared>,
    config: Option<PipelineConfig>,
    capture_thread: Option<thread::JoinHandle<()>>,
    writer_thread: Option<thread::JoinHandle<()>>,
    drained_rx: Option<Receiver<()>>,
    start_instant: Option<Instant>,
}

impl CapturePipeline {
    pub fn new(camera_id: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                camera_id,
                state: Mutex::new(PipelineState::Idle),
                paused: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                force_stop: AtomicBool::new(false),
                fatal: AtomicBool::new(false),
                counters: Counters::default(),
                faults: FaultWindow::new(Duration::from_secs(1)),
            }),
            config: None,
            capture_thread: None,
            writer_thread: None,
            drained_rx: None,
            start_instant: None,
        }
    }

    pub fn camera_id(&self) -> u32 {
        self.shared.camera_id
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state()
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Store configuration and move Idle -> Ready.
    pub fn init(&mut self, config: PipelineConfig) -> Result<()> {
        let state = self.shared.state();
        if state != PipelineState::Idle {
            return Err(RecorderError::InvalidState(format!(
                "init not permitted in {}",
                state
            )));
        }
        config.camera.validate()?;
        if config.post_encode_queue == 0 {
            return Err(RecorderError::InvalidArgument(
                "post-encode queue of 0".into(),
            ));
        }
        info!(
            camera = self.shared.camera_id,
            width = config.camera.width,
            height = config.camera.height,
            fps = config.camera.framerate,
            "pipeline initialized"
        );
        self.config = Some(config);
        self.shared.set_state(PipelineState::Ready);
        Ok(())
    }

    /// Spawn the capture and writer threads. Recording begins when the first
    /// frame arrives.
    pub fn start<S, E, W>(
        &mut self,
        source: S,
        encoder: E,
        sink: W,
        pool: Arc<BufferPool>,
        sync: Arc<StreamSync>,
        monitor: PipelineMonitor,
        events: mpsc::Sender<PipelineEvent>,
    ) -> Result<()>
    where
        S: CameraSource + 'static,
        E: VideoEncoder + 'static,
        W: RecordSink + 'static,
    {
        let state = self.shared.state();
        match state {
            PipelineState::Ready => {}
            PipelineState::Recording | PipelineState::Starting => {
                return Err(RecorderError::InvalidState("already running".into()));
            }
            other => {
                return Err(RecorderError::InvalidState(format!(
                    "start not permitted in {}",
                    other
                )));
            }
        }
        let config = self
            .config
            .clone()
            .ok_or_else(|| RecorderError::InvalidState("start before init".into()))?;

        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.force_stop.store(false, Ordering::SeqCst);
        self.shared.fatal.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.set_state(PipelineState::Starting);
        self.start_instant = Some(Instant::now());

        let (post_tx, post_rx) = mpsc::sync_channel::<common_io::EncodedUnit>(config.post_encode_queue);
        let (drained_tx, drained_rx) = mpsc::channel::<()>();
        self.drained_rx = Some(drained_rx);

        let writer_shared = Arc::clone(&self.shared);
        let writer_monitor = monitor.clone();
        let writer_events = events.clone();
        self.writer_thread = Some(
            thread::Builder::new()
                .name(format!("writer-cam{}", self.shared.camera_id))
                .spawn(move || {
                    writer_loop(sink, post_rx, writer_shared, writer_monitor, writer_events)
                })
                .map_err(|e| RecorderError::Resource(format!("writer thread: {}", e)))?,
        );

        let capture_shared = Arc::clone(&self.shared);
        self.capture_thread = Some(
            thread::Builder::new()
                .name(format!("capture-cam{}", self.shared.camera_id))
                .spawn(move || {
                    capture_loop(
                        source,
                        encoder,
                        capture_shared,
                        pool,
                        sync,
                        monitor,
                        events,
                        post_tx,
                        drained_tx,
                        config,
                    )
                })
                .map_err(|e| RecorderError::Resource(format!("capture thread: {}", e)))?,
        );
        Ok(())
    }

    /// Drain in-flight work and return to Idle. Honors the configured drain
    /// deadline; past it the remaining unwritten units are abandoned rather
    /// than corrupting the output.
    pub fn stop(&mut self) -> Result<()> {
        let state = self.shared.state();
        match state {
            PipelineState::Idle | PipelineState::Ready => return Ok(()),
            PipelineState::Recording | PipelineState::Starting => {}
            other => {
                return Err(RecorderError::InvalidState(format!(
                    "stop not permitted in {}",
                    other
                )));
            }
        }

        let deadline = self
            .config
            .as_ref()
            .map(|c| c.drain_deadline)
            .unwrap_or(Duration::from_secs(5));
        self.shared.set_state(PipelineState::Stopping);
        self.shared.stop_requested.store(true, Ordering::SeqCst);

        if let Some(drained) = self.drained_rx.take() {
            if drained.recv_timeout(deadline).is_err() {
                warn!(
                    camera = self.shared.camera_id,
                    "drain deadline exceeded, forcing flush"
                );
                self.shared.force_stop.store(true, Ordering::SeqCst);
            }
        }
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }

        self.shared.set_state(PipelineState::Finalizing);
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }

        self.shared.set_state(PipelineState::Idle);
        info!(camera = self.shared.camera_id, "pipeline stopped");
        Ok(())
    }

    /// Leave Error through Recovery and back to Ready for a restart attempt.
    pub fn remediate(&mut self) -> Result<()> {
        if self.shared.state() != PipelineState::Error {
            return Err(RecorderError::InvalidState(
                "remediate only applies to a failed pipeline".into(),
            ));
        }
        self.shared.set_state(PipelineState::Recovery);
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
        self.drained_rx = None;
        self.shared.fatal.store(false, Ordering::SeqCst);
        self.shared.set_state(PipelineState::Ready);
        info!(camera = self.shared.camera_id, "pipeline remediated");
        Ok(())
    }

    /// Quiesce output while the source keeps producing; every produced frame
    /// is discarded and accounted as a drop.
    pub fn pause(&mut self) -> Result<()> {
        if self.shared.state() != PipelineState::Recording {
            return Err(RecorderError::InvalidState("pause requires Recording".into()));
        }
        self.shared.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        if self.shared.state() != PipelineState::Recording {
            return Err(RecorderError::InvalidState(
                "resume requires Recording".into(),
            ));
        }
        self.shared.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn counters(&self) -> PipelineCounters {
        self.handle().counters()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            camera_id: self.shared.camera_id,
            state: self.shared.state(),
            paused: self.shared.paused.load(Ordering::SeqCst),
            counters: self.counters(),
            elapsed: self
                .start_instant
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO),
        }
    }

    /// A pipeline is healthy iff it is Recording and no fatal condition has
    /// been observed since entering that state.
    pub fn is_healthy(&self) -> bool {
        self.shared.state() == PipelineState::Recording
            && !self.shared.fatal.load(Ordering::SeqCst)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        match self.shared.state() {
            PipelineState::Recording | PipelineState::Starting => {
                let _ = self.stop();
            }
            PipelineState::Error => {
                let _ = self.remediate();
            }
            _ => {}
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn capture_loop<S, E>(
    mut source: S,
    mut encoder: E,
    shared: Arc<Shared>,
    pool: Arc<BufferPool>,
    sync: Arc<StreamSync>,
    monitor: PipelineMonitor,
    events: mpsc::Sender<PipelineEvent>,
    post_tx: SyncSender<common_io::EncodedUnit>,
    drained_tx: mpsc::Sender<()>,
    config: PipelineConfig,
) where
    S: CameraSource,
    E: VideoEncoder,
{
    let camera_id = shared.camera_id;
    let component = format!("Camera{}", camera_id);
    let frame_interval = config.camera.frame_interval();
    let mut first_frame_seen = false;
    let mut backpressure_since: Option<Instant> = None;

    loop {
        if shared.stop_requested.load(Ordering::SeqCst) || shared.fatal.load(Ordering::SeqCst) {
            break;
        }

        let frame = match source.next_frame(frame_interval) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                // source timeout for this interval
                shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                monitor.record_drop(camera_id);
                continue;
            }
            Err(err) => {
                if shared.on_fault(&monitor, &events, "capture source", &err) {
                    break;
                }
                continue;
            }
        };

        if !first_frame_seen {
            first_frame_seen = true;
            let mut state = shared.state.lock().unwrap();
            if *state == PipelineState::Starting {
                *state = PipelineState::Recording;
            }
            drop(state);
            debug!(camera = camera_id, "first frame, recording");
            let _ = events.send(PipelineEvent::FirstFrame { camera_id });
        }

        if shared.paused.load(Ordering::SeqCst) {
            shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            monitor.record_drop(camera_id);
            continue;
        }

        let Some(mut surface) = pool.acquire() else {
            // never block the capture source on a starved pool
            shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            monitor.record_drop(camera_id);
            monitor.raise(AlertLevel::Warning, &component, "buffer pool exhausted");
            continue;
        };

        surface.stamp(camera_id, frame.timestamp_ns);
        if let SurfaceStorage::Host { data } = &mut surface.storage {
            let n = frame.data.len().min(data.len());
            data[..n].copy_from_slice(&frame.data[..n]);
        }

        let _ = sync.on_frame(camera_id as usize, frame.timestamp_ns);
        monitor.record_capture(camera_id);
        shared.counters.frames_captured.fetch_add(1, Ordering::Relaxed);
        shared
            .counters
            .last_timestamp_ns
            .store(frame.timestamp_ns, Ordering::Relaxed);

        let encode_start = Instant::now();
        match encoder.encode(&surface) {
            Ok(Some(unit)) => {
                monitor.record_encode_latency(camera_id, encode_start.elapsed().as_nanos() as u64);
                match post_tx.try_send(unit) {
                    Ok(()) => {
                        shared.counters.frames_encoded.fetch_add(1, Ordering::Relaxed);
                        backpressure_since = None;
                    }
                    Err(TrySendError::Full(_)) => {
                        // drop-for-backpressure keeps the capture thread live
                        shared.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        monitor.record_drop(camera_id);
                        monitor.raise(AlertLevel::Warning, &component, "writer backpressure");
                        let now = Instant::now();
                        let since = *backpressure_since.get_or_insert(now);
                        if now.duration_since(since) > config.backpressure_error {
                            let err = RecorderError::Timeout(format!(
                                "writer backpressure sustained past {:?}",
                                config.backpressure_error
                            ));
                            shared.fatal.store(true, Ordering::SeqCst);
                            shared.set_state(PipelineState::Error);
                            monitor.raise(AlertLevel::Error, &component, &err.to_string());
                            let _ = events.send(PipelineEvent::Fatal {
                                camera_id,
                                reason: err.to_string(),
                            });
                        }
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        let err = RecorderError::Collaborator("writer thread gone".into());
                        if shared.on_fault(&monitor, &events, "writer", &err) {
                            pool_release(&pool, &monitor, &component, surface);
                            break;
                        }
                    }
                }
            }
            Ok(None) => {
                // encoder deferred output to a key-frame boundary
                monitor.record_encode_latency(camera_id, encode_start.elapsed().as_nanos() as u64);
            }
            Err(err) => {
                if shared.on_fault(&monitor, &events, "encoder", &err) {
                    pool_release(&pool, &monitor, &component, surface);
                    break;
                }
            }
        }

        pool_release(&pool, &monitor, &component, surface);
    }

    // drain: emit whatever the encoder still buffers, then the terminator
    if !shared.force_stop.load(Ordering::SeqCst) && !shared.fatal.load(Ordering::SeqCst) {
        match encoder.flush() {
            Ok(units) => {
                'drain: for unit in units {
                    let mut pending = unit;
                    loop {
                        if shared.force_stop.load(Ordering::SeqCst) {
                            break 'drain;
                        }
                        match post_tx.try_send(pending) {
                            Ok(()) => break,
                            Err(TrySendError::Full(back)) => {
                                pending = back;
                                thread::sleep(Duration::from_millis(1));
                            }
                            Err(TrySendError::Disconnected(_)) => break 'drain,
                        }
                    }
                }
            }
            Err(err) => {
                warn!(camera = camera_id, %err, "encoder flush failed during drain");
            }
        }
    }

    drop(post_tx);
    source.close();
    let _ = drained_tx.send(());
}

fn pool_release(
    pool: &BufferPool,
    monitor: &PipelineMonitor,
    component: &str,
    surface: common_io::ImageSurface,
) {
    match pool.release(surface) {
        ReleaseOutcome::Returned => {}
        ReleaseOutcome::DoubleRelease => {
            monitor.raise(AlertLevel::Error, component, "double release of pool surface");
        }
        ReleaseOutcome::Foreign => {
            monitor.raise(AlertLevel::Error, component, "foreign surface returned to pool");
        }
    }
}

fn writer_loop<W: RecordSink>(
    mut sink: W,
    post_rx: Receiver<common_io::EncodedUnit>,
    shared: Arc<Shared>,
    monitor: PipelineMonitor,
    events: mpsc::Sender<PipelineEvent>,
) {
    let camera_id = shared.camera_id;
    let component = format!("Camera{}", camera_id);

    while let Ok(unit) = post_rx.recv() {
        if shared.force_stop.load(Ordering::SeqCst) {
            // forced teardown abandons queued units, never tears records
            continue;
        }
        match sink.append_unit(&unit) {
            Ok(accepted) => {
                shared
                    .counters
                    .bytes_written
                    .fetch_add(accepted, Ordering::Relaxed);
            }
            Err(err) => {
                if shared.on_fault(&monitor, &events, "storage writer", &err) {
                    break;
                }
            }
        }
    }

    if let Err(err) = sink.finalize() {
        monitor.raise(
            AlertLevel::Error,
            &component,
            &format!("finalize failed: {}", err),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_window_requires_two_hits_within_window() {
        let window = FaultWindow::new(Duration::from_millis(50));
        assert!(!window.record());
        thread::sleep(Duration::from_millis(80));
        assert!(!window.record());
        assert!(window.record());
    }

    #[test]
    fn init_only_from_idle() {
        let mut pipeline = CapturePipeline::new(0);
        let config = PipelineConfig::from_session(&SessionConfig::default(), CameraConfig::default());
        pipeline.init(config.clone()).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Ready);
        assert!(matches!(
            pipeline.init(config),
            Err(RecorderError::InvalidState(_))
        ));
    }

    #[test]
    fn init_validates_camera_ranges() {
        let mut pipeline = CapturePipeline::new(0);
        let mut camera = CameraConfig::default();
        camera.exposure_time_us = 499;
        let config = PipelineConfig::from_session(&SessionConfig::default(), camera);
        assert!(matches!(
            pipeline.init(config),
            Err(RecorderError::InvalidArgument(_))
        ));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn stop_in_idle_is_a_noop() {
        let mut pipeline = CapturePipeline::new(0);
        assert!(pipeline.stop().is_ok());
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[test]
    fn pause_requires_recording() {
        let mut pipeline = CapturePipeline::new(0);
        assert!(matches!(
            pipeline.pause(),
            Err(RecorderError::InvalidState(_))
        ));
    }

    #[test]
    fn double_release_raises_error_alert() {
        let pool = BufferPool::new(buffer_pool::PoolConfig {
            num_buffers: 6,
            width: 64,
            height: 48,
            storage: buffer_pool::StorageClass::Device,
        })
        .unwrap();
        let monitor = PipelineMonitor::new();

        let surface = pool.acquire().unwrap();
        let copy = surface.clone();
        pool_release(&pool, &monitor, "Camera0", surface);
        pool_release(&pool, &monitor, "Camera0", copy);

        assert!(monitor
            .recent_alerts(10)
            .iter()
            .any(|a| a.level == AlertLevel::Error && a.message.contains("double release")));
        let stats = pool.stats();
        assert_eq!(stats.free, 6);
        assert_eq!(stats.in_use, 0);
        monitor.shutdown();
    }
}
