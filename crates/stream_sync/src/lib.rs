//! Dual-stream timestamp alignment telemetry.
//!
//! The synchronizer observes per-camera frame arrivals and reports skew; it
//! never rewrites timestamps. The corrections counter is telemetry for the
//! muxing stage downstream, which owns any actual rebasing.

use common_io::{RecorderError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Half a frame at 30 fps. Drift beyond this counts a correction.
pub const CORRECTION_THRESHOLD_NS: i64 = 16_000_000;
/// One frame at 30 fps. Drift at or beyond this clears `synchronized`.
pub const SYNC_THRESHOLD_NS: i64 = 33_000_000;

/// Snapshot of synchronization quality.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncStatus {
    pub drift_ns: i64,
    pub corrections: u32,
    pub synchronized: bool,
    pub confidence: f64,
}

struct Inner {
    last_timestamps: Vec<u64>,
    corrections: u32,
    max_drift_ns: i64,
}

/// Shared timeline context for a fixed set of streams.
pub struct StreamSync {
    inner: Mutex<Inner>,
    running: AtomicBool,
    num_streams: usize,
}

impl StreamSync {
    pub fn new(num_streams: usize) -> Result<Self> {
        if num_streams == 0 {
            return Err(RecorderError::InvalidArgument(
                "synchronizer needs at least one stream".into(),
            ));
        }
        info!(num_streams, "stream synchronizer initialized");
        Ok(Self {
            inner: Mutex::new(Inner {
                last_timestamps: vec![0; num_streams],
                corrections: 0,
                max_drift_ns: 0,
            }),
            running: AtomicBool::new(false),
            num_streams,
        })
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Record the latest timestamp for one stream. O(1).
    pub fn on_frame(&self, stream_id: usize, timestamp_ns: u64) -> Result<()> {
        if stream_id >= self.num_streams {
            return Err(RecorderError::InvalidArgument(format!(
                "stream {} out of range for {} streams",
                stream_id, self.num_streams
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        inner.last_timestamps[stream_id] = timestamp_ns;

        if self.num_streams == 2 {
            let drift = drift_of(&inner.last_timestamps);
            inner.max_drift_ns = inner.max_drift_ns.max(drift.abs());
            if drift.abs() > CORRECTION_THRESHOLD_NS {
                inner.corrections += 1;
                debug!(drift_ns = drift, "drift beyond half-frame threshold");
            }
        }
        Ok(())
    }

    /// Signed skew between the most recent pair of timestamps. This is a
    /// conservative estimate, not a time-aligned comparison.
    pub fn drift_ns(&self) -> i64 {
        if self.num_streams != 2 {
            return 0;
        }
        let inner = self.inner.lock().unwrap();
        drift_of(&inner.last_timestamps)
    }

    pub fn max_drift_ns(&self) -> i64 {
        self.inner.lock().unwrap().max_drift_ns
    }

    pub fn status(&self) -> SyncStatus {
        let drift_ns = self.drift_ns();
        let corrections = self.inner.lock().unwrap().corrections;
        let synchronized = drift_ns.abs() < SYNC_THRESHOLD_NS;
        SyncStatus {
            drift_ns,
            corrections,
            synchronized,
            confidence: if synchronized { 1.0 } else { 0.5 },
        }
    }

    /// Zero the corrections counter and max drift; last timestamps stand.
    pub fn recalibrate(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.corrections = 0;
        inner.max_drift_ns = 0;
        info!("synchronizer recalibrated");
    }
}

fn drift_of(last: &[u64]) -> i64 {
    last[0] as i64 - last[1] as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_streams() {
        assert!(StreamSync::new(0).is_err());
    }

    #[test]
    fn rejects_unknown_stream_id() {
        let sync = StreamSync::new(2).unwrap();
        assert!(sync.on_frame(2, 1_000).is_err());
    }

    #[test]
    fn drift_is_signed_first_minus_second() {
        let sync = StreamSync::new(2).unwrap();
        sync.on_frame(0, 100_000_000).unwrap();
        sync.on_frame(1, 120_000_000).unwrap();
        assert_eq!(sync.drift_ns(), -20_000_000);
    }

    #[test]
    fn equal_timestamps_mean_zero_drift_and_no_correction() {
        let sync = StreamSync::new(2).unwrap();
        sync.on_frame(0, 1_000_000_000).unwrap();
        sync.on_frame(1, 1_000_000_000).unwrap();
        let status = sync.status();
        assert_eq!(status.drift_ns, 0);
        assert_eq!(status.corrections, 0);
        assert!(status.synchronized);
    }

    #[test]
    fn correction_threshold_is_exclusive() {
        let sync = StreamSync::new(2).unwrap();
        sync.on_frame(0, 16_000_000).unwrap();
        sync.on_frame(1, 0).unwrap();
        assert_eq!(sync.status().corrections, 0);

        let sync = StreamSync::new(2).unwrap();
        sync.on_frame(0, 16_000_001).unwrap();
        sync.on_frame(1, 0).unwrap();
        assert_eq!(sync.status().corrections, 1);
    }

    #[test]
    fn sync_threshold_is_exclusive() {
        let sync = StreamSync::new(2).unwrap();
        sync.on_frame(0, 32_999_999).unwrap();
        sync.on_frame(1, 0).unwrap();
        assert!(sync.status().synchronized);
        assert_eq!(sync.status().confidence, 1.0);

        let sync = StreamSync::new(2).unwrap();
        sync.on_frame(0, 33_000_000).unwrap();
        sync.on_frame(1, 0).unwrap();
        assert!(!sync.status().synchronized);
        assert_eq!(sync.status().confidence, 0.5);
    }

    #[test]
    fn steady_skew_counts_a_correction_per_pair() {
        let sync = StreamSync::new(2).unwrap();
        // camera 1 trails camera 0 by 20ms on every frame
        for i in 1..=10u64 {
            sync.on_frame(0, i * 33_000_000).unwrap();
            sync.on_frame(1, i * 33_000_000 - 20_000_000).unwrap();
        }
        let status = sync.status();
        assert_eq!(status.drift_ns, 20_000_000);
        assert!(status.synchronized);
        // one correction per arrival once drift exceeds the half-frame mark;
        // camera-0 arrivals see the larger interleaved gap as well
        assert!(status.corrections >= 10);
    }

    #[test]
    fn forty_ms_skew_desynchronizes() {
        let sync = StreamSync::new(2).unwrap();
        for i in 2..=6u64 {
            sync.on_frame(0, i * 33_000_000).unwrap();
            sync.on_frame(1, i * 33_000_000 - 40_000_000).unwrap();
        }
        let status = sync.status();
        assert_eq!(status.drift_ns, 40_000_000);
        assert!(!status.synchronized);
    }

    #[test]
    fn recalibrate_resets_counters_only() {
        let sync = StreamSync::new(2).unwrap();
        sync.on_frame(0, 100_000_000).unwrap();
        sync.on_frame(1, 0).unwrap();
        assert!(sync.status().corrections > 0);
        assert!(sync.max_drift_ns() > 0);

        sync.recalibrate();
        assert_eq!(sync.status().corrections, 0);
        assert_eq!(sync.max_drift_ns(), 0);
        // last timestamps survive, so drift is still observable
        assert_eq!(sync.drift_ns(), 100_000_000);
    }

    #[test]
    fn single_stream_reports_no_drift() {
        let sync = StreamSync::new(1).unwrap();
        sync.on_frame(0, 5_000).unwrap();
        assert_eq!(sync.drift_ns(), 0);
        assert!(sync.status().synchronized);
    }
}
