//! Video encoder contract.
//!
//! The hardware encoder is an opaque collaborator: one surface in, at most
//! one compressed unit out, and the surface is never retained past the call.

use common_io::{EncodedUnit, ImageSurface, RecorderError, Result, SurfaceStorage};
use config::EncoderConfig;
use tracing::info;

/// Function from image surfaces to compressed units.
pub trait VideoEncoder: Send {
    /// Apply (or re-apply) encoder configuration.
    fn configure(&mut self, config: &EncoderConfig) -> Result<()>;

    /// Consume one surface. May defer output until a key-frame boundary, in
    /// which case `Ok(None)` is returned and the bytes arrive with a later
    /// call or at flush.
    fn encode(&mut self, surface: &ImageSurface) -> Result<Option<EncodedUnit>>;

    /// Emit everything still buffered, ending with the terminating unit.
    fn flush(&mut self) -> Result<Vec<EncodedUnit>>;

    /// File extension of the container this encoder's output is stored in.
    fn container_ext(&self) -> &'static str;

    fn encoded_frames(&self) -> u64;

    /// Mean output bitrate over the encode so far, in bits per second.
    fn average_bitrate(&self) -> f64;
}

/// Software stand-in encoder that frames surface payloads without
/// compression. Used by tests and the demo recorder; the unit payload is the
/// surface bytes prefixed with a tiny sequence header.
pub struct PassthroughEncoder {
    config: EncoderConfig,
    frames_in: u64,
    bytes_out: u64,
    first_pts_ns: Option<u64>,
    last_pts_ns: u64,
}

impl PassthroughEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            frames_in: 0,
            bytes_out: 0,
            first_pts_ns: None,
            last_pts_ns: 0,
        })
    }
}

impl VideoEncoder for PassthroughEncoder {
    fn configure(&mut self, config: &EncoderConfig) -> Result<()> {
        config.validate()?;
        info!(
            bitrate = config.bitrate_bps,
            iframe_interval = config.iframe_interval,
            "encoder reconfigured"
        );
        self.config = config.clone();
        Ok(())
    }

    fn encode(&mut self, surface: &ImageSurface) -> Result<Option<EncodedUnit>> {
        let camera_id = surface.camera_id.ok_or_else(|| {
            RecorderError::Collaborator("unstamped surface submitted to encoder".into())
        })?;
        if surface.timestamp_ns <= self.last_pts_ns && self.frames_in > 0 {
            return Err(RecorderError::Collaborator(format!(
                "non-monotonic timestamp {} after {}",
                surface.timestamp_ns, self.last_pts_ns
            )));
        }

        let key_frame = self.frames_in % self.config.iframe_interval as u64 == 0;
        let mut data = Vec::with_capacity(16 + surface.payload_len());
        data.extend_from_slice(&self.frames_in.to_le_bytes());
        data.extend_from_slice(&camera_id.to_le_bytes());
        data.extend_from_slice(&(surface.payload_len() as u32).to_le_bytes());
        if let SurfaceStorage::Host { data: payload } = &surface.storage {
            data.extend_from_slice(payload);
        }

        self.frames_in += 1;
        self.bytes_out += data.len() as u64;
        self.first_pts_ns.get_or_insert(surface.timestamp_ns);
        self.last_pts_ns = surface.timestamp_ns;

        Ok(Some(EncodedUnit {
            data,
            pts_ns: surface.timestamp_ns,
            key_frame,
        }))
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>> {
        // Passthrough holds nothing back; emit only the terminating unit.
        let terminator = EncodedUnit {
            data: b"PVEND".to_vec(),
            pts_ns: self.last_pts_ns + 1,
            key_frame: false,
        };
        self.bytes_out += terminator.data.len() as u64;
        Ok(vec![terminator])
    }

    fn container_ext(&self) -> &'static str {
        "pvc"
    }

    fn encoded_frames(&self) -> u64 {
        self.frames_in
    }

    fn average_bitrate(&self) -> f64 {
        let span_ns = match self.first_pts_ns {
            Some(first) if self.last_pts_ns > first => self.last_pts_ns - first,
            _ => return 0.0,
        };
        (self.bytes_out as f64 * 8.0) / (span_ns as f64 / 1_000_000_000.0)
    }
}
