//! Shared fakes and fixtures for the recording engine test suites.

use camera::{CameraSource, SourceFrame};
use common_io::{EncodedUnit, ImageSurface, RecorderError, Result};
use config::EncoderConfig;
use encoder::VideoEncoder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::RecordSink;

/// Source that replays a fixed list of timestamps, then times out forever.
pub struct ScriptedSource {
    timestamps: Vec<u64>,
    cursor: usize,
    /// Frames (by index) that fail with a collaborator error instead.
    pub faulty_frames: Vec<usize>,
}

impl ScriptedSource {
    pub fn new(timestamps: Vec<u64>) -> Self {
        Self {
            timestamps,
            cursor: 0,
            faulty_frames: Vec::new(),
        }
    }
}

impl CameraSource for ScriptedSource {
    fn next_frame(&mut self, _timeout: Duration) -> Result<Option<SourceFrame>> {
        let idx = self.cursor;
        if idx >= self.timestamps.len() {
            return Ok(None);
        }
        self.cursor += 1;
        if self.faulty_frames.contains(&idx) {
            return Err(RecorderError::Collaborator(format!(
                "scripted source fault at frame {}",
                idx
            )));
        }
        Ok(Some(SourceFrame {
            timestamp_ns: self.timestamps[idx],
            seq_no: idx as u64,
            data: vec![idx as u8; 64],
        }))
    }

    fn close(&mut self) {}
}

/// Encoder that accepts every surface but never emits a unit.
pub struct StallingEncoder {
    frames_in: u64,
}

impl StallingEncoder {
    pub fn new() -> Self {
        Self { frames_in: 0 }
    }
}

impl Default for StallingEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoEncoder for StallingEncoder {
    fn configure(&mut self, _config: &EncoderConfig) -> Result<()> {
        Ok(())
    }

    fn encode(&mut self, _surface: &ImageSurface) -> Result<Option<EncodedUnit>> {
        self.frames_in += 1;
        Ok(None)
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>> {
        Ok(Vec::new())
    }

    fn container_ext(&self) -> &'static str {
        "pvc"
    }

    fn encoded_frames(&self) -> u64 {
        0
    }

    fn average_bitrate(&self) -> f64 {
        0.0
    }
}

/// Encoder that fails every submission.
pub struct FailingEncoder;

impl VideoEncoder for FailingEncoder {
    fn configure(&mut self, _config: &EncoderConfig) -> Result<()> {
        Ok(())
    }

    fn encode(&mut self, _surface: &ImageSurface) -> Result<Option<EncodedUnit>> {
        Err(RecorderError::Collaborator("encoder rejected frame".into()))
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>> {
        Ok(Vec::new())
    }

    fn container_ext(&self) -> &'static str {
        "pvc"
    }

    fn encoded_frames(&self) -> u64 {
        0
    }

    fn average_bitrate(&self) -> f64 {
        0.0
    }
}

/// In-memory sink capturing appended units for assertions.
#[derive(Clone, Default)]
pub struct MemorySink {
    pub units: Arc<Mutex<Vec<EncodedUnit>>>,
    pub finalized: Arc<AtomicBool>,
    bytes: Arc<Mutex<u64>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit_count(&self) -> usize {
        self.units.lock().unwrap().len()
    }

    pub fn pts_sequence(&self) -> Vec<u64> {
        self.units.lock().unwrap().iter().map(|u| u.pts_ns).collect()
    }
}

impl RecordSink for MemorySink {
    fn append_unit(&mut self, unit: &EncodedUnit) -> Result<u64> {
        let accepted = unit.data.len() as u64;
        self.units.lock().unwrap().push(unit.clone());
        *self.bytes.lock().unwrap() += accepted;
        Ok(accepted)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        *self.bytes.lock().unwrap()
    }
}

/// Sink that blocks every append while the gate is closed, simulating a
/// stalled storage device.
#[derive(Clone)]
pub struct GatedSink {
    gate_open: Arc<AtomicBool>,
    inner: MemorySink,
}

impl GatedSink {
    pub fn new() -> (Self, Arc<AtomicBool>) {
        let gate = Arc::new(AtomicBool::new(false));
        (
            Self {
                gate_open: Arc::clone(&gate),
                inner: MemorySink::new(),
            },
            gate,
        )
    }

    pub fn unit_count(&self) -> usize {
        self.inner.unit_count()
    }
}

impl RecordSink for GatedSink {
    fn append_unit(&mut self, unit: &EncodedUnit) -> Result<u64> {
        while !self.gate_open.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
        self.inner.append_unit(unit)
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.inner.finalize()
    }

    fn bytes_written(&self) -> u64 {
        self.inner.bytes_written()
    }
}
