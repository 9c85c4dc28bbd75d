//! Crash recovery: atomic session checkpoints, restart remediation, and
//! salvage of partial outputs.
//!
//! The checkpoint file is only ever replaced by an fsync + rename, so at any
//! moment it is absent, the previous valid checkpoint, or the new one; a
//! partial write is never observable.

use chrono::{DateTime, Utc};
use common_io::{PipelineState, RecorderError, Result, SessionStatus, NUM_CAMERAS};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use storage::clip;
use tracing::{info, warn};

const STATE_FILE: &str = "session_state";
const STATE_TMP: &str = "session_state.tmp";
const CHECKPOINT_VERSION: u32 = 1;

/// How many drops make a prior run look encoder-bound.
const DROP_REMEDIATION_THRESHOLD: u64 = 100;

/// Remediation chosen from the last checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    RestartPipeline,
    RestartCamera,
    RestartEncoder,
    SalvageRecording,
    FullReset,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecoveryAction::RestartPipeline => "restart-pipeline",
            RecoveryAction::RestartCamera => "restart-camera",
            RecoveryAction::RestartEncoder => "restart-encoder",
            RecoveryAction::SalvageRecording => "salvage-recording",
            RecoveryAction::FullReset => "full-reset",
        };
        write!(f, "{}", name)
    }
}

/// Snapshot of recovery progress for one restart.
#[derive(Debug, Clone)]
pub struct RecoveryState {
    pub last_known_state: PipelineState,
    pub frames_salvaged: [u64; NUM_CAMERAS],
    pub partial_files_valid: bool,
}

/// Outcome of salvaging one partial output.
#[derive(Debug, Clone)]
pub struct SalvageReport {
    pub path: PathBuf,
    pub camera_id: u32,
    pub frames_recovered: u64,
    pub truncated: bool,
    pub bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    version: u32,
    saved_at: DateTime<Utc>,
    status: SessionStatus,
}

/// Persistent state owner under `<state_dir>`.
pub struct RecoverySystem {
    state_dir: PathBuf,
    recovery_state: Mutex<RecoveryState>,
}

impl RecoverySystem {
    pub fn new(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).map_err(|e| {
            RecorderError::Resource(format!("state dir {}: {}", state_dir.display(), e))
        })?;
        info!(dir = %state_dir.display(), "recovery system initialized");
        Ok(Self {
            state_dir: state_dir.to_path_buf(),
            recovery_state: Mutex::new(RecoveryState {
                last_known_state: PipelineState::Idle,
                frames_salvaged: [0; NUM_CAMERAS],
                partial_files_valid: false,
            }),
        })
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    /// Atomically persist a status snapshot: write the temp file, fsync it,
    /// rename over the checkpoint, fsync the directory.
    pub fn checkpoint(&self, status: &SessionStatus) -> Result<()> {
        let payload = CheckpointFile {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            status: status.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&payload)
            .map_err(|e| RecorderError::Corruption(format!("checkpoint encode: {}", e)))?;

        let tmp_path = self.state_dir.join(STATE_TMP);
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, self.state_path())?;
        File::open(&self.state_dir)?.sync_all()?;
        Ok(())
    }

    /// Load the prior checkpoint. Missing file means a clean start; an
    /// unreadable or mismatched file is `Corruption` (callers fall back to
    /// `FullReset`).
    pub fn load(&self) -> Result<Option<SessionStatus>> {
        let path = self.state_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RecorderError::Io(e)),
        };
        let checkpoint: CheckpointFile = serde_json::from_slice(&bytes)
            .map_err(|e| RecorderError::Corruption(format!("checkpoint decode: {}", e)))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(RecorderError::Corruption(format!(
                "checkpoint version {} unsupported",
                checkpoint.version
            )));
        }
        self.recovery_state.lock().unwrap().last_known_state = checkpoint.status.state;
        Ok(Some(checkpoint.status))
    }

    pub fn can_recover(&self) -> bool {
        self.state_path().exists()
    }

    /// Choose a remediation from the prior checkpoint.
    pub fn determine_action(&self) -> RecoveryAction {
        let status = match self.load() {
            Ok(Some(status)) => status,
            Ok(None) => return RecoveryAction::FullReset,
            Err(_) => return RecoveryAction::FullReset,
        };

        if status.state == PipelineState::Error {
            return RecoveryAction::RestartPipeline;
        }
        if status
            .frames_dropped
            .iter()
            .any(|&drops| drops > DROP_REMEDIATION_THRESHOLD)
        {
            return RecoveryAction::RestartEncoder;
        }
        RecoveryAction::RestartPipeline
    }

    /// Log and acknowledge a remediation decision. The structural work
    /// (re-initializing pipelines, reopening devices) belongs to the session
    /// that owns those components.
    pub fn execute(&self, action: RecoveryAction) -> Result<()> {
        info!(%action, "executing recovery action");
        match action {
            RecoveryAction::FullReset => {
                self.clear()?;
            }
            RecoveryAction::SalvageRecording
            | RecoveryAction::RestartPipeline
            | RecoveryAction::RestartCamera
            | RecoveryAction::RestartEncoder => {}
        }
        Ok(())
    }

    /// Salvage a partial output file: verify the container, truncate the
    /// torn tail, rebuild the trailing index. Valid finalized files are
    /// reported and left untouched.
    pub fn salvage(&self, partial_file: &Path) -> Result<SalvageReport> {
        let repair = clip::repair(partial_file)?;
        let report = SalvageReport {
            path: partial_file.to_path_buf(),
            camera_id: repair.camera_id,
            frames_recovered: repair.frames,
            truncated: repair.truncated,
            bytes: repair.bytes,
        };

        let mut state = self.recovery_state.lock().unwrap();
        if let Some(slot) = state.frames_salvaged.get_mut(repair.camera_id as usize) {
            *slot = repair.frames;
        }
        state.partial_files_valid = true;
        info!(
            path = %partial_file.display(),
            camera = report.camera_id,
            frames = report.frames_recovered,
            truncated = report.truncated,
            "salvage complete"
        );
        Ok(report)
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery_state.lock().unwrap().clone()
    }

    /// Consume the checkpoint so recovery runs at most once per crash.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(self.state_path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(%e, "failed to clear checkpoint");
                Err(RecorderError::Io(e))
            }
        }
    }
}
