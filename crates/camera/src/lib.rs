//! Capture source and camera control contracts.
//!
//! The vendor sensor stack is an opaque collaborator: it hands out frames
//! with monotonic nanosecond timestamps and accepts a bounded set of control
//! commands. Everything behind these traits is out of scope for the
//! recording engine.

use common_io::Result;
use config::{CameraConfig, WhiteBalanceMode};
use std::time::Duration;

mod sim;

pub use sim::{SimCamera, SimCameraConfig, SimSource};

/// One frame produced by a capture source.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    /// Monotonic acquisition timestamp.
    pub timestamp_ns: u64,
    /// Sequence number assigned by the source.
    pub seq_no: u64,
    /// Pixel payload for host-memory sources; empty when the frame lives
    /// behind a device handle.
    pub data: Vec<u8>,
}

/// Blocking frame tap on an opened camera.
pub trait CameraSource: Send {
    /// Wait up to `timeout` for the next frame. A timeout yields `Ok(None)`,
    /// not an error; the caller accounts the missed interval as a drop.
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<SourceFrame>>;

    fn close(&mut self);
}

/// Reported pairing of the two sensors. The link is bookkeeping only:
/// actual timestamp alignment is observed downstream by the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    Leader,
    Follower { leader_id: u32 },
}

/// Control surface of one camera.
pub trait CameraControl: Send {
    type Source: CameraSource + 'static;

    /// Store and validate configuration. Out-of-range numeric input fails
    /// with `InvalidArgument` and leaves the camera untouched.
    fn initialize(&mut self, config: &CameraConfig) -> Result<()>;

    /// Begin producing frames; hands the frame tap to the caller.
    fn start(&mut self) -> Result<Self::Source>;

    fn stop(&mut self) -> Result<()>;

    fn set_exposure(&mut self, exposure_us: u32) -> Result<()>;
    fn set_gain(&mut self, gain: f64) -> Result<()>;
    fn set_white_balance(&mut self, mode: WhiteBalanceMode) -> Result<()>;
    fn enable_auto_exposure(&mut self, enable: bool) -> Result<()>;
    fn set_frame_rate(&mut self, fps: u32) -> Result<()>;
    fn trigger_auto_white_balance(&mut self) -> Result<()>;
    fn set_sync_role(&mut self, role: SyncRole) -> Result<()>;

    fn exposure_us(&self) -> u32;
    fn gain(&self) -> f64;
    fn is_running(&self) -> bool;
    fn sensor_id(&self) -> u32;
}
