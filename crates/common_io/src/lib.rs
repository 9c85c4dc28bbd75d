use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of cameras in a dual recording rig.
pub const NUM_CAMERAS: usize = 2;

/// Lifecycle state shared by capture pipelines and the session aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Ready,
    Starting,
    Recording,
    Stopping,
    Finalizing,
    Error,
    Recovery,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Ready => "ready",
            PipelineState::Starting => "starting",
            PipelineState::Recording => "recording",
            PipelineState::Stopping => "stopping",
            PipelineState::Finalizing => "finalizing",
            PipelineState::Error => "error",
            PipelineState::Recovery => "recovery",
        };
        write!(f, "{}", name)
    }
}

/// Backing storage for an image surface.
///
/// `Device` carries an opaque zero-copy handle owned by the vendor media
/// stack; `Host` owns the pixel bytes directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceStorage {
    Device { handle: u64 },
    Host { data: Vec<u8> },
}

impl SurfaceStorage {
    pub fn payload_len(&self) -> usize {
        match self {
            SurfaceStorage::Device { .. } => 0,
            SurfaceStorage::Host { data } => data.len(),
        }
    }
}

/// A fixed-shape frame bound to one buffer pool slot.
///
/// A surface whose `camera_id` is set is in flight; returning it to the pool
/// clears the stamp. Exactly one logical owner exists at any time.
#[derive(Debug, Clone)]
pub struct ImageSurface {
    pub slot: usize,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub storage: SurfaceStorage,
    pub timestamp_ns: u64,
    pub camera_id: Option<u32>,
}

impl ImageSurface {
    /// Stamp the surface for a captured frame.
    pub fn stamp(&mut self, camera_id: u32, timestamp_ns: u64) {
        self.camera_id = Some(camera_id);
        self.timestamp_ns = timestamp_ns;
    }

    /// Clear the in-flight stamp when the surface returns to the pool.
    pub fn clear_stamp(&mut self) {
        self.camera_id = None;
        self.timestamp_ns = 0;
    }

    pub fn is_in_flight(&self) -> bool {
        self.camera_id.is_some()
    }

    pub fn payload_len(&self) -> usize {
        self.storage.payload_len()
    }
}

/// One compressed unit emitted by the encoder, owned by the producing
/// pipeline until handed to the writer.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Vec<u8>,
    pub pts_ns: u64,
    pub key_frame: bool,
}

impl EncodedUnit {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Value snapshot of a session, and the only thing the recovery subsystem
/// ever persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: PipelineState,
    pub frames_recorded: [u64; NUM_CAMERAS],
    pub frames_dropped: [u64; NUM_CAMERAS],
    pub bytes_written: [u64; NUM_CAMERAS],
    pub elapsed_ns: u64,
    pub output_paths: [Option<PathBuf>; NUM_CAMERAS],
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            state: PipelineState::Idle,
            frames_recorded: [0; NUM_CAMERAS],
            frames_dropped: [0; NUM_CAMERAS],
            bytes_written: [0; NUM_CAMERAS],
            elapsed_ns: 0,
            output_paths: [None, None],
        }
    }

    pub fn total_drops(&self) -> u64 {
        self.frames_dropped.iter().sum()
    }
}

/// Outcome of a completed (or aborted) recording session.
#[derive(Debug, Clone)]
pub struct RecordingResult {
    pub success: bool,
    pub camera0_path: Option<PathBuf>,
    pub camera1_path: Option<PathBuf>,
    pub duration_ns: u64,
    pub total_frames: [u64; NUM_CAMERAS],
    pub error: Option<String>,
}

/// Error taxonomy for the recording engine.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("resource exhausted: {0}")]
    Resource(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("collaborator failure: {0}")]
    Collaborator(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("corrupt data: {0}")]
    Corruption(String),
}

impl RecorderError {
    /// Transient errors are retried once on the next frame; everything else
    /// is fatal for the pipeline that observed it.
    pub fn is_transient(&self) -> bool {
        matches!(self, RecorderError::Io(_) | RecorderError::Collaborator(_))
    }
}

pub type Result<T> = std::result::Result<T, RecorderError>;
