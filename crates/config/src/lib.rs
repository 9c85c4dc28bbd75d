use common_io::{RecorderError, Result};
use serde::Deserialize;
use std::path::PathBuf;

/// Valid exposure window for sports capture, in microseconds.
pub const EXPOSURE_RANGE_US: (u32, u32) = (500, 2000);
/// Valid analog gain window.
pub const GAIN_RANGE: (f64, f64) = (1.0, 4.0);
/// Valid frame rate window.
pub const FRAMERATE_RANGE: (u32, u32) = (1, 60);

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub writer: WriterConfig,
}

impl AppConfig {
    pub fn from_path(p: &str) -> Result<Self> {
        let content = std::fs::read_to_string(p)?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| RecorderError::InvalidArgument(format!("bad config {}: {}", p, e)))?;
        Ok(config)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            camera: CameraConfig::default(),
            encoder: EncoderConfig::default(),
            writer: WriterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhiteBalanceMode {
    Off,
    Auto,
    Incandescent,
    Fluorescent,
    Daylight,
}

/// Per-sensor capture configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub sensor_id: u32,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub exposure_time_us: u32,
    pub gain: f64,
    pub white_balance: WhiteBalanceMode,
    pub auto_exposure: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        // 1/1000s shutter and ISO 200 equivalent for daylight sports fields.
        Self {
            sensor_id: 0,
            width: 4056,
            height: 3040,
            framerate: 30,
            exposure_time_us: 1000,
            gain: 2.0,
            white_balance: WhiteBalanceMode::Daylight,
            auto_exposure: false,
        }
    }
}

impl CameraConfig {
    pub fn for_sensor(mut self, sensor_id: u32) -> Self {
        self.sensor_id = sensor_id;
        self
    }

    /// Validate numeric windows; out-of-range input never mutates anything.
    pub fn validate(&self) -> Result<()> {
        validate_exposure(self.exposure_time_us)?;
        validate_gain(self.gain)?;
        validate_framerate(self.framerate)?;
        if self.width == 0 || self.height == 0 {
            return Err(RecorderError::InvalidArgument(format!(
                "resolution {}x{} is not capturable",
                self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(1_000_000_000 / self.framerate.max(1) as u64)
    }
}

pub fn validate_exposure(exposure_us: u32) -> Result<()> {
    let (lo, hi) = EXPOSURE_RANGE_US;
    if exposure_us < lo || exposure_us > hi {
        return Err(RecorderError::InvalidArgument(format!(
            "exposure {}us out of range [{}, {}]",
            exposure_us, lo, hi
        )));
    }
    Ok(())
}

pub fn validate_gain(gain: f64) -> Result<()> {
    let (lo, hi) = GAIN_RANGE;
    if gain < lo || gain > hi {
        return Err(RecorderError::InvalidArgument(format!(
            "gain {}x out of range [{}, {}]",
            gain, lo, hi
        )));
    }
    Ok(())
}

pub fn validate_framerate(fps: u32) -> Result<()> {
    let (lo, hi) = FRAMERATE_RANGE;
    if fps < lo || fps > hi {
        return Err(RecorderError::InvalidArgument(format!(
            "framerate {} out of range [{}, {}]",
            fps, lo, hi
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderProfile {
    Baseline,
    Main,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderPreset {
    UltraFast,
    Fast,
    Medium,
}

/// Encoder collaborator configuration, forwarded opaquely.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    pub bitrate_bps: u32,
    pub peak_bitrate_bps: u32,
    pub iframe_interval: u32,
    pub profile: EncoderProfile,
    pub preset: EncoderPreset,
    pub insert_parameter_sets: bool,
    pub insert_vui: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            bitrate_bps: 100_000_000,
            peak_bitrate_bps: 120_000_000,
            iframe_interval: 30,
            profile: EncoderProfile::High,
            preset: EncoderPreset::UltraFast,
            insert_parameter_sets: true,
            insert_vui: true,
        }
    }
}

impl EncoderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.bitrate_bps == 0 {
            return Err(RecorderError::InvalidArgument("bitrate of 0".into()));
        }
        if self.iframe_interval == 0 {
            return Err(RecorderError::InvalidArgument(
                "iframe interval of 0".into(),
            ));
        }
        Ok(())
    }
}

/// Storage writer tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Extent pre-allocated when a file is opened, to limit fragmentation.
    pub preallocate_bytes: u64,
    /// Free-space floor withheld from recording.
    pub reserved_bytes: u64,
    /// Durability flush cadence, in encoded units.
    pub flush_interval_units: u32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            preallocate_bytes: 50 * 1024 * 1024 * 1024,
            reserved_bytes: 10 * 1024 * 1024 * 1024,
            flush_interval_units: 300,
        }
    }
}

/// Session-wide layout and cadence settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub output_dir: PathBuf,
    pub state_dir: PathBuf,
    pub buffer_count: usize,
    pub checkpoint_interval_secs: u64,
    pub stats_interval_secs: u64,
    /// Bounded queue between encode and write, in units.
    pub post_encode_queue: usize,
    /// Sustained writer backpressure beyond this is fatal.
    pub backpressure_error_ms: u64,
    /// Drain deadline honored by stop().
    pub drain_deadline_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/mnt/recordings"),
            state_dir: PathBuf::from("/var/lib/pitchvision/state"),
            buffer_count: 30,
            checkpoint_interval_secs: 5,
            stats_interval_secs: 5,
            post_encode_queue: 100,
            backpressure_error_ms: 500,
            drain_deadline_secs: 5,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count < 6 {
            return Err(RecorderError::InvalidArgument(format!(
                "buffer count {} below minimum of 6",
                self.buffer_count
            )));
        }
        if self.post_encode_queue == 0 {
            return Err(RecorderError::InvalidArgument(
                "post-encode queue of 0".into(),
            ));
        }
        Ok(())
    }
}
