//! Deterministic software camera used by tests and the demo recorder.

use crate::{CameraControl, CameraSource, SourceFrame, SyncRole};
use common_io::{RecorderError, Result};
use config::{validate_exposure, validate_framerate, validate_gain, CameraConfig, WhiteBalanceMode};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Behavior knobs for the simulated sensor.
#[derive(Debug, Clone)]
pub struct SimCameraConfig {
    /// Fixed timestamp offset added to every frame, for drift scenarios.
    pub timestamp_skew_ns: i64,
    /// Stop producing after this many frames; `None` means unbounded.
    pub max_frames: Option<u64>,
    /// Sleep one frame interval per produced frame. Tests leave this off.
    pub realtime: bool,
    /// Bytes of synthetic payload attached to each frame.
    pub payload_len: usize,
}

impl Default for SimCameraConfig {
    fn default() -> Self {
        Self {
            timestamp_skew_ns: 0,
            max_frames: None,
            realtime: false,
            payload_len: 256,
        }
    }
}

struct Shared {
    running: AtomicBool,
    frame_interval_ns: AtomicU64,
    produced: AtomicU64,
}

/// Simulated dual-rig sensor. Frames carry timestamps advancing by exactly
/// one frame interval plus the configured skew.
pub struct SimCamera {
    config: CameraConfig,
    sim: SimCameraConfig,
    shared: Arc<Shared>,
    sync_role: SyncRole,
    initialized: bool,
}

impl SimCamera {
    pub fn new(sensor_id: u32, sim: SimCameraConfig) -> Self {
        let config = CameraConfig::default().for_sensor(sensor_id);
        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            frame_interval_ns: AtomicU64::new(1_000_000_000 / config.framerate as u64),
            produced: AtomicU64::new(0),
        });
        Self {
            config,
            sim,
            shared,
            sync_role: SyncRole::Leader,
            initialized: false,
        }
    }

    pub fn sync_role(&self) -> SyncRole {
        self.sync_role
    }
}

impl CameraControl for SimCamera {
    type Source = SimSource;

    fn initialize(&mut self, config: &CameraConfig) -> Result<()> {
        config.validate()?;
        info!(
            sensor = config.sensor_id,
            width = config.width,
            height = config.height,
            fps = config.framerate,
            "initializing camera"
        );
        self.config = config.clone();
        self.shared
            .frame_interval_ns
            .store(1_000_000_000 / config.framerate as u64, Ordering::Relaxed);
        self.initialized = true;
        Ok(())
    }

    fn start(&mut self) -> Result<SimSource> {
        if !self.initialized {
            return Err(RecorderError::InvalidState(
                "camera started before initialize".into(),
            ));
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(RecorderError::InvalidState(format!(
                "camera {} already running",
                self.config.sensor_id
            )));
        }
        self.shared.produced.store(0, Ordering::SeqCst);
        info!(sensor = self.config.sensor_id, "camera started");
        Ok(SimSource {
            shared: Arc::clone(&self.shared),
            sim: self.sim.clone(),
        })
    }

    fn stop(&mut self) -> Result<()> {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            info!(sensor = self.config.sensor_id, "camera stopped");
        }
        Ok(())
    }

    fn set_exposure(&mut self, exposure_us: u32) -> Result<()> {
        validate_exposure(exposure_us)?;
        debug!(sensor = self.config.sensor_id, exposure_us, "exposure updated");
        self.config.exposure_time_us = exposure_us;
        Ok(())
    }

    fn set_gain(&mut self, gain: f64) -> Result<()> {
        validate_gain(gain)?;
        debug!(sensor = self.config.sensor_id, gain, "gain updated");
        self.config.gain = gain;
        Ok(())
    }

    fn set_white_balance(&mut self, mode: WhiteBalanceMode) -> Result<()> {
        self.config.white_balance = mode;
        Ok(())
    }

    fn enable_auto_exposure(&mut self, enable: bool) -> Result<()> {
        self.config.auto_exposure = enable;
        Ok(())
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<()> {
        validate_framerate(fps)?;
        self.config.framerate = fps;
        self.shared
            .frame_interval_ns
            .store(1_000_000_000 / fps as u64, Ordering::Relaxed);
        Ok(())
    }

    fn trigger_auto_white_balance(&mut self) -> Result<()> {
        // One-shot convergence is instantaneous for the simulated sensor.
        debug!(sensor = self.config.sensor_id, "auto white balance triggered");
        Ok(())
    }

    fn set_sync_role(&mut self, role: SyncRole) -> Result<()> {
        if let SyncRole::Follower { leader_id } = role {
            if leader_id == self.config.sensor_id {
                return Err(RecorderError::InvalidArgument(
                    "camera cannot follow itself".into(),
                ));
            }
        }
        self.sync_role = role;
        Ok(())
    }

    fn exposure_us(&self) -> u32 {
        self.config.exposure_time_us
    }

    fn gain(&self) -> f64 {
        self.config.gain
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn sensor_id(&self) -> u32 {
        self.config.sensor_id
    }
}

/// Frame tap handed out by [`SimCamera::start`].
pub struct SimSource {
    shared: Arc<Shared>,
    sim: SimCameraConfig,
}

impl CameraSource for SimSource {
    fn next_frame(&mut self, _timeout: Duration) -> Result<Option<SourceFrame>> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let seq = self.shared.produced.load(Ordering::SeqCst);
        if let Some(max) = self.sim.max_frames {
            if seq >= max {
                return Ok(None);
            }
        }

        let interval_ns = self.shared.frame_interval_ns.load(Ordering::Relaxed);
        if self.sim.realtime {
            std::thread::sleep(Duration::from_nanos(interval_ns));
        }

        self.shared.produced.fetch_add(1, Ordering::SeqCst);
        // Timestamps start one interval in so frame 0 is never at t=0.
        let base = (seq + 1) * interval_ns;
        let timestamp_ns = (base as i64 + self.sim.timestamp_skew_ns).max(0) as u64;
        let data = vec![(seq % 251) as u8; self.sim.payload_len];
        Ok(Some(SourceFrame {
            timestamp_ns,
            seq_no: seq,
            data,
        }))
    }

    fn close(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }
}
