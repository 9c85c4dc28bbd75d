//! Recording session manager: composes the buffer pool, per-camera
//! pipelines, synchronizer, writers, monitor and recovery into one
//! start/stop lifecycle.
//!
//! The session is the sole mutator of session lifecycle. Pipelines report
//! fatal conditions through an event channel; a supervisor thread reacts and
//! keeps the recovery checkpoint fresh.

use buffer_pool::{BufferPool, PoolConfig, StorageClass};
use camera::{CameraControl, SyncRole};
use common_io::{
    PipelineState, RecorderError, RecordingResult, Result, SessionStatus, NUM_CAMERAS,
};
use config::{CameraConfig, SessionConfig, WriterConfig};
use encoder::VideoEncoder;
use monitor::{Alert, AlertCallback, AlertLevel, MonitorMetrics, PipelineMonitor};
use pipeline::{CapturePipeline, PipelineConfig, PipelineEvent, PipelineHandle};
use recovery::RecoverySystem;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use storage::StorageWriter;
use stream_sync::StreamSync;
use tracing::{error, info, warn};

/// Combined metrics: monitor counters plus synchronizer telemetry.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub monitor: MonitorMetrics,
    pub drift_ns: i64,
    pub sync_corrections: u32,
    pub synchronized: bool,
}

struct SupervisorContext {
    handles: [PipelineHandle; NUM_CAMERAS],
    recovery: Arc<RecoverySystem>,
    monitor: PipelineMonitor,
    aggregate: Arc<Mutex<PipelineState>>,
    fatal: Arc<[AtomicBool; NUM_CAMERAS]>,
    output_paths: Arc<Mutex<[Option<PathBuf>; NUM_CAMERAS]>>,
    started_at: Instant,
    checkpoint_interval: Duration,
    stop: Arc<AtomicBool>,
}

/// Top-level coordinator for one dual-camera recording.
pub struct RecordingSession<C, E>
where
    C: CameraControl,
    E: VideoEncoder + 'static,
{
    session_cfg: SessionConfig,
    camera_template: CameraConfig,
    writer_cfg: WriterConfig,
    cameras: [C; NUM_CAMERAS],
    encoders: Option<[E; NUM_CAMERAS]>,
    pipelines: [CapturePipeline; NUM_CAMERAS],
    pool: Option<Arc<BufferPool>>,
    sync: Option<Arc<StreamSync>>,
    monitor: PipelineMonitor,
    recovery: Arc<RecoverySystem>,
    aggregate: Arc<Mutex<PipelineState>>,
    fatal: Arc<[AtomicBool; NUM_CAMERAS]>,
    output_paths: Arc<Mutex<[Option<PathBuf>; NUM_CAMERAS]>>,
    metadata: Mutex<HashMap<String, String>>,
    events_tx: Option<mpsc::Sender<PipelineEvent>>,
    supervisor: Option<thread::JoinHandle<()>>,
    supervisor_stop: Arc<AtomicBool>,
    game_id: Option<String>,
    started_at: Option<Instant>,
}

impl<C, E> RecordingSession<C, E>
where
    C: CameraControl,
    E: VideoEncoder + 'static,
{
    pub fn new(
        session_cfg: SessionConfig,
        camera_template: CameraConfig,
        writer_cfg: WriterConfig,
        cameras: [C; NUM_CAMERAS],
        encoders: [E; NUM_CAMERAS],
    ) -> Result<Self> {
        session_cfg.validate()?;
        camera_template.validate()?;
        let recovery = Arc::new(RecoverySystem::new(&session_cfg.state_dir)?);
        Ok(Self {
            session_cfg,
            camera_template,
            writer_cfg,
            cameras,
            encoders: Some(encoders),
            pipelines: [CapturePipeline::new(0), CapturePipeline::new(1)],
            pool: None,
            sync: None,
            monitor: PipelineMonitor::new(),
            recovery,
            aggregate: Arc::new(Mutex::new(PipelineState::Idle)),
            fatal: Arc::new([AtomicBool::new(false), AtomicBool::new(false)]),
            output_paths: Arc::new(Mutex::new([None, None])),
            metadata: Mutex::new(HashMap::new()),
            events_tx: None,
            supervisor: None,
            supervisor_stop: Arc::new(AtomicBool::new(false)),
            game_id: None,
            started_at: None,
        })
    }

    fn aggregate_state(&self) -> PipelineState {
        *self.aggregate.lock().unwrap()
    }

    fn set_aggregate(&self, state: PipelineState) {
        *self.aggregate.lock().unwrap() = state;
    }

    /// Bring the whole rig up for one game. No two concurrent sessions may
    /// share a game id; output names are derived from it deterministically.
    pub fn start_recording(&mut self, game_id: &str) -> Result<()> {
        if self.aggregate_state() != PipelineState::Idle {
            return Err(RecorderError::InvalidState(
                "session already active".into(),
            ));
        }
        if game_id.is_empty() || game_id.contains('/') || game_id.contains('\0') {
            return Err(RecorderError::InvalidArgument(format!(
                "game id {:?} is not usable in a filename",
                game_id
            )));
        }

        info!(game_id, "starting recording session");

        // buffers first: without them nothing else can run
        let pool = Arc::new(
            BufferPool::new(PoolConfig {
                num_buffers: self.session_cfg.buffer_count,
                width: self.camera_template.width,
                height: self.camera_template.height,
                storage: StorageClass::Host,
            })
            .map_err(|e| RecorderError::Resource(format!("buffer pool: {}", e)))?,
        );

        // act on whatever a previous run left behind, before any new file
        // is opened
        self.consult_recovery();

        let sync = Arc::new(StreamSync::new(NUM_CAMERAS)?);
        sync.start();

        let handles = [self.pipelines[0].handle(), self.pipelines[1].handle()];
        {
            let pool_probe = Arc::clone(&pool);
            let h0 = handles[0].clone();
            let h1 = handles[1].clone();
            self.monitor.set_health_probes(
                Arc::new(move || pool_probe.is_healthy()),
                Arc::new(move || vec![h0.state(), h1.state()]),
            );
        }
        self.monitor.start();

        let [encoder0, encoder1] = self
            .encoders
            .take()
            .ok_or_else(|| RecorderError::InvalidState("session already consumed".into()))?;

        for camera_id in 0..NUM_CAMERAS as u32 {
            let camera_cfg = self.camera_template.clone().for_sensor(camera_id);
            self.pipelines[camera_id as usize]
                .init(PipelineConfig::from_session(&self.session_cfg, camera_cfg.clone()))?;
            self.cameras[camera_id as usize].initialize(&camera_cfg)?;
        }
        self.cameras[0].set_sync_role(SyncRole::Leader)?;
        self.cameras[1].set_sync_role(SyncRole::Follower { leader_id: 0 })?;

        let mut writers = Vec::with_capacity(NUM_CAMERAS);
        for (camera_id, ext) in [(0u32, encoder0.container_ext()), (1, encoder1.container_ext())]
        {
            let mut writer =
                StorageWriter::new(&self.session_cfg.output_dir, self.writer_cfg.clone())?;
            if !writer.has_space(self.writer_cfg.preallocate_bytes)? {
                return Err(RecorderError::Resource(format!(
                    "not enough free space for camera {} output",
                    camera_id
                )));
            }
            let filename = format!("{}_cam{}.{}", game_id, camera_id, ext);
            let path = writer.open(&filename, camera_id)?;
            if writer.fell_back_to_buffered() {
                self.monitor.raise(
                    AlertLevel::Warning,
                    "Storage",
                    "preallocation unsupported, falling back to buffered IO",
                );
            }
            self.output_paths.lock().unwrap()[camera_id as usize] = Some(path);
            writers.push(writer);
        }
        let writer1 = writers.pop().unwrap();
        let writer0 = writers.pop().unwrap();

        let (events_tx, events_rx) = mpsc::channel();
        self.fatal[0].store(false, Ordering::SeqCst);
        self.fatal[1].store(false, Ordering::SeqCst);
        self.set_aggregate(PipelineState::Starting);
        let started_at = Instant::now();
        self.started_at = Some(started_at);

        // fixed start order: camera 0 first, then its follower
        let source0 = self.cameras[0].start()?;
        self.pipelines[0].start(
            source0,
            encoder0,
            writer0,
            Arc::clone(&pool),
            Arc::clone(&sync),
            self.monitor.clone(),
            events_tx.clone(),
        )?;
        let source1 = self.cameras[1].start()?;
        self.pipelines[1].start(
            source1,
            encoder1,
            writer1,
            Arc::clone(&pool),
            Arc::clone(&sync),
            self.monitor.clone(),
            events_tx.clone(),
        )?;

        self.supervisor_stop.store(false, Ordering::SeqCst);
        let context = SupervisorContext {
            handles,
            recovery: Arc::clone(&self.recovery),
            monitor: self.monitor.clone(),
            aggregate: Arc::clone(&self.aggregate),
            fatal: Arc::clone(&self.fatal),
            output_paths: Arc::clone(&self.output_paths),
            started_at,
            checkpoint_interval: Duration::from_secs(self.session_cfg.checkpoint_interval_secs),
            stop: Arc::clone(&self.supervisor_stop),
        };
        self.supervisor = Some(
            thread::Builder::new()
                .name("session-control".into())
                .spawn(move || supervisor_loop(context, events_rx))
                .map_err(|e| RecorderError::Resource(format!("supervisor thread: {}", e)))?,
        );

        self.events_tx = Some(events_tx);
        self.pool = Some(pool);
        self.sync = Some(sync);
        self.game_id = Some(game_id.to_string());
        Ok(())
    }

    /// Before opening new files, act on whatever a previous run left behind.
    fn consult_recovery(&self) {
        if !self.recovery.can_recover() {
            return;
        }
        match self.recovery.load() {
            Ok(Some(prior)) => {
                let action = self.recovery.determine_action();
                info!(
                    prior_state = %prior.state,
                    %action,
                    "previous session state found"
                );
                if let Err(e) = self.recovery.execute(action) {
                    warn!(%e, "recovery action failed");
                }
                for path in prior.output_paths.iter().flatten() {
                    if path.exists() {
                        match self.recovery.salvage(path) {
                            Ok(report) => info!(
                                path = %path.display(),
                                frames = report.frames_recovered,
                                "partial recording salvaged"
                            ),
                            Err(e) => warn!(path = %path.display(), %e, "salvage failed"),
                        }
                    }
                }
                let _ = self.recovery.clear();
            }
            Ok(None) => {}
            Err(RecorderError::Corruption(reason)) => {
                warn!(%reason, "checkpoint unreadable, performing full reset");
                let _ = self.recovery.clear();
            }
            Err(e) => warn!(%e, "checkpoint load failed"),
        }
    }

    /// Ordered teardown; returns the result of the recording.
    pub fn stop_recording(&mut self) -> Result<RecordingResult> {
        let state = self.aggregate_state();
        if state == PipelineState::Idle {
            return Err(RecorderError::InvalidState("no active session".into()));
        }

        info!("stopping recording session");
        self.supervisor_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        self.events_tx = None;
        self.set_aggregate(PipelineState::Stopping);

        // teardown order: pipelines, synchronizer, monitor, then the pool;
        // each pipeline closes its own writer while draining
        for pipeline in self.pipelines.iter_mut() {
            let result = match pipeline.state() {
                PipelineState::Error => pipeline.remediate(),
                _ => pipeline.stop(),
            };
            if let Err(e) = result {
                warn!(camera = pipeline.camera_id(), %e, "pipeline teardown");
            }
        }
        if let Some(sync) = &self.sync {
            sync.stop();
        }
        self.monitor.shutdown();
        for camera in self.cameras.iter_mut() {
            if let Err(e) = camera.stop() {
                warn!(%e, "camera stop failed");
            }
        }

        let totals = [
            self.pipelines[0].counters(),
            self.pipelines[1].counters(),
        ];
        let duration_ns = self
            .started_at
            .take()
            .map(|t| t.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        let paths = self.output_paths.lock().unwrap().clone();

        if let Some(pool) = self.pool.take() {
            let stats = pool.stats();
            if stats.in_use != 0 {
                warn!(in_use = stats.in_use, "surfaces still in flight at teardown");
            }
        }
        self.sync = None;

        let cam0_fatal = self.fatal[0].load(Ordering::SeqCst);
        let cam1_fatal = self.fatal[1].load(Ordering::SeqCst);
        let dual_failure = cam0_fatal && cam1_fatal;
        if dual_failure {
            // leave a checkpoint marked for salvage on the next run
            let mut status = self.build_status(duration_ns, &totals, &paths);
            status.state = PipelineState::Error;
            if let Err(e) = self.recovery.checkpoint(&status) {
                error!(%e, "failed to write salvage checkpoint");
            }
        } else {
            let _ = self.recovery.clear();
        }

        self.set_aggregate(PipelineState::Idle);
        let error = match (cam0_fatal, cam1_fatal) {
            (false, false) => None,
            (true, true) => Some("both pipelines failed".to_string()),
            (true, false) => Some("camera 0 pipeline failed".to_string()),
            (false, true) => Some("camera 1 pipeline failed".to_string()),
        };
        let result = RecordingResult {
            success: !dual_failure,
            camera0_path: paths[0].clone(),
            camera1_path: paths[1].clone(),
            duration_ns,
            total_frames: [totals[0].frames_encoded, totals[1].frames_encoded],
            error,
        };
        info!(
            frames0 = result.total_frames[0],
            frames1 = result.total_frames[1],
            duration_s = duration_ns / 1_000_000_000,
            success = result.success,
            "recording session finished"
        );
        Ok(result)
    }

    fn build_status(
        &self,
        elapsed_ns: u64,
        totals: &[pipeline::PipelineCounters; NUM_CAMERAS],
        paths: &[Option<PathBuf>; NUM_CAMERAS],
    ) -> SessionStatus {
        SessionStatus {
            state: self.aggregate_state(),
            frames_recorded: [totals[0].frames_encoded, totals[1].frames_encoded],
            frames_dropped: [totals[0].frames_dropped, totals[1].frames_dropped],
            bytes_written: [totals[0].bytes_written, totals[1].bytes_written],
            elapsed_ns,
            output_paths: paths.clone(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        let totals = [
            self.pipelines[0].counters(),
            self.pipelines[1].counters(),
        ];
        let elapsed_ns = self
            .started_at
            .map(|t| t.elapsed().as_nanos() as u64)
            .unwrap_or(0);
        let paths = self.output_paths.lock().unwrap().clone();
        self.build_status(elapsed_ns, &totals, &paths)
    }

    pub fn metrics(&self) -> SessionMetrics {
        let sync_status = self
            .sync
            .as_ref()
            .map(|s| s.status())
            .unwrap_or(stream_sync::SyncStatus {
                drift_ns: 0,
                corrections: 0,
                synchronized: true,
                confidence: 1.0,
            });
        SessionMetrics {
            monitor: self.monitor.metrics(),
            drift_ns: sync_status.drift_ns,
            sync_corrections: sync_status.corrections,
            synchronized: sync_status.synchronized,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.aggregate_state() == PipelineState::Recording
    }

    /// True once the session has lost both pipelines and cannot continue.
    pub fn has_failed(&self) -> bool {
        self.aggregate_state() == PipelineState::Error
    }

    pub fn is_healthy(&self) -> bool {
        self.monitor.is_healthy()
    }

    pub fn recent_alerts(&self, max: usize) -> Vec<Alert> {
        self.monitor.recent_alerts(max)
    }

    pub fn register_alert_callback(&self, callback: AlertCallback) {
        self.monitor.register_alert_callback(callback)
    }

    pub fn set_metadata(&self, key: &str, value: &str) {
        self.metadata
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        self.metadata.lock().unwrap().get(key).cloned()
    }

    pub fn set_camera_exposure(&mut self, camera_id: u32, exposure_us: u32) -> Result<()> {
        let camera = self
            .cameras
            .get_mut(camera_id as usize)
            .ok_or_else(|| RecorderError::InvalidArgument(format!("camera {}", camera_id)))?;
        camera.set_exposure(exposure_us)
    }

    pub fn set_camera_gain(&mut self, camera_id: u32, gain: f64) -> Result<()> {
        let camera = self
            .cameras
            .get_mut(camera_id as usize)
            .ok_or_else(|| RecorderError::InvalidArgument(format!("camera {}", camera_id)))?;
        camera.set_gain(gain)
    }

    pub fn pause(&mut self) -> Result<()> {
        for pipeline in self.pipelines.iter_mut() {
            pipeline.pause()?;
        }
        Ok(())
    }

    pub fn resume(&mut self) -> Result<()> {
        for pipeline in self.pipelines.iter_mut() {
            pipeline.resume()?;
        }
        Ok(())
    }
}

fn supervisor_loop(context: SupervisorContext, events_rx: mpsc::Receiver<PipelineEvent>) {
    let mut last_checkpoint = Instant::now();

    loop {
        if context.stop.load(Ordering::SeqCst) {
            break;
        }
        match events_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(PipelineEvent::FirstFrame { camera_id }) => {
                let mut aggregate = context.aggregate.lock().unwrap();
                if *aggregate == PipelineState::Starting {
                    *aggregate = PipelineState::Recording;
                    info!(camera = camera_id, "session recording");
                }
            }
            Ok(PipelineEvent::Fatal { camera_id, reason }) => {
                if let Some(flag) = context.fatal.get(camera_id as usize) {
                    flag.store(true, Ordering::SeqCst);
                }
                let dual = context.fatal.iter().all(|f| f.load(Ordering::SeqCst));
                if dual {
                    *context.aggregate.lock().unwrap() = PipelineState::Error;
                    context.monitor.raise(
                        AlertLevel::Critical,
                        "Session",
                        "both pipelines failed, terminating session",
                    );
                } else {
                    context.monitor.raise(
                        AlertLevel::Error,
                        "Session",
                        &format!(
                            "camera {} failed ({}), continuing with surviving camera",
                            camera_id, reason
                        ),
                    );
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if last_checkpoint.elapsed() >= context.checkpoint_interval {
            let counters = [context.handles[0].counters(), context.handles[1].counters()];
            let status = SessionStatus {
                state: *context.aggregate.lock().unwrap(),
                frames_recorded: [counters[0].frames_encoded, counters[1].frames_encoded],
                frames_dropped: [counters[0].frames_dropped, counters[1].frames_dropped],
                bytes_written: [counters[0].bytes_written, counters[1].bytes_written],
                elapsed_ns: context.started_at.elapsed().as_nanos() as u64,
                output_paths: context.output_paths.lock().unwrap().clone(),
            };
            if let Err(e) = context.recovery.checkpoint(&status) {
                context.monitor.raise(
                    AlertLevel::Error,
                    "Recovery",
                    &format!("checkpoint failed: {}", e),
                );
            }
            last_checkpoint = Instant::now();
        }
    }
}
