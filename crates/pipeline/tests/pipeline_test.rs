//! End-to-end scenarios for a single capture pipeline with simulated
//! collaborators.

use buffer_pool::{BufferPool, PoolConfig, StorageClass};
use camera::{CameraControl, SimCamera, SimCameraConfig};
use common_io::PipelineState;
use config::{CameraConfig, EncoderConfig, SessionConfig};
use encoder::PassthroughEncoder;
use monitor::{AlertLevel, PipelineMonitor};
use pipeline::{CapturePipeline, PipelineConfig, PipelineEvent};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use storage::RecordSink;
use stream_sync::StreamSync;
use testsupport::{FailingEncoder, GatedSink, MemorySink, ScriptedSource, StallingEncoder};

fn small_camera_config(sensor_id: u32) -> CameraConfig {
    let mut cfg = CameraConfig::default().for_sensor(sensor_id);
    cfg.width = 64;
    cfg.height = 48;
    cfg
}

fn small_pool(n: usize) -> Arc<BufferPool> {
    Arc::new(
        BufferPool::new(PoolConfig {
            num_buffers: n,
            width: 64,
            height: 48,
            storage: StorageClass::Host,
        })
        .unwrap(),
    )
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn started_sim_source(sensor_id: u32, sim: SimCameraConfig) -> camera::SimSource {
    let mut cam = SimCamera::new(sensor_id, sim);
    cam.initialize(&small_camera_config(sensor_id)).unwrap();
    cam.start().unwrap()
}

#[test]
fn clean_record_and_stop() {
    let pool = small_pool(30);
    let sync = Arc::new(StreamSync::new(2).unwrap());
    let monitor = PipelineMonitor::new();
    let (events_tx, events_rx) = mpsc::channel();

    let source = started_sim_source(0, SimCameraConfig::default());
    let encoder = PassthroughEncoder::new(EncoderConfig::default()).unwrap();
    let sink = MemorySink::new();
    let sink_view = sink.clone();

    // an unpaced source can outrun the sink briefly; a deep queue keeps the
    // zero-drop expectation honest
    let mut session_cfg = SessionConfig::default();
    session_cfg.post_encode_queue = 10_000;

    let mut pipeline = CapturePipeline::new(0);
    pipeline
        .init(PipelineConfig::from_session(
            &session_cfg,
            small_camera_config(0),
        ))
        .unwrap();
    pipeline
        .start(source, encoder, sink, pool.clone(), sync, monitor.clone(), events_tx)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.counters().frames_encoded >= 300
    }));
    assert_eq!(pipeline.state(), PipelineState::Recording);
    assert!(pipeline.is_healthy());
    assert_eq!(
        events_rx.try_recv().unwrap(),
        PipelineEvent::FirstFrame { camera_id: 0 }
    );

    pipeline.stop().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Idle);

    let counters = pipeline.counters();
    assert_eq!(counters.frames_dropped, 0);
    assert_eq!(counters.frames_captured, counters.frames_encoded);

    // every accepted unit is accounted, plus the flush terminator
    assert!(sink_view.finalized.load(Ordering::SeqCst));
    assert_eq!(counters.bytes_written, sink_view.bytes_written());
    assert_eq!(sink_view.unit_count() as u64, counters.frames_encoded + 1);

    // within one pipeline, written timestamps are strictly monotonic
    let pts = sink_view.pts_sequence();
    assert!(pts.windows(2).all(|w| w[0] < w[1]));

    // all surfaces came back
    assert_eq!(pool.stats().in_use, 0);
}

#[test]
fn pool_exhaustion_drops_frames_without_leaking() {
    let pool = small_pool(6);
    let sync = Arc::new(StreamSync::new(2).unwrap());
    let monitor = PipelineMonitor::new();
    let (events_tx, _events_rx) = mpsc::channel();

    // hold the entire pool, as if every surface were still in flight
    let mut held = Vec::new();
    for _ in 0..6 {
        held.push(pool.acquire().unwrap());
    }

    let source = started_sim_source(0, SimCameraConfig::default());
    let mut pipeline = CapturePipeline::new(0);
    pipeline
        .init(PipelineConfig::from_session(
            &SessionConfig::default(),
            small_camera_config(0),
        ))
        .unwrap();
    pipeline
        .start(
            source,
            StallingEncoder::new(),
            MemorySink::new(),
            pool.clone(),
            sync,
            monitor.clone(),
            events_tx,
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.counters().frames_dropped >= 7
    }));
    assert!(monitor
        .recent_alerts(50)
        .iter()
        .any(|a| a.level == AlertLevel::Warning && a.message.contains("buffer pool exhausted")));

    // free the pool; the pipeline recovers and captures again
    for surface in held {
        pool.release(surface);
    }
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.counters().frames_captured >= 5
    }));

    pipeline.stop().unwrap();
    assert_eq!(pool.stats().in_use, 0);
}

#[test]
fn sustained_writer_backpressure_is_fatal() {
    let pool = small_pool(8);
    let sync = Arc::new(StreamSync::new(2).unwrap());
    let monitor = PipelineMonitor::new();
    let (events_tx, events_rx) = mpsc::channel();

    let mut session_cfg = SessionConfig::default();
    session_cfg.post_encode_queue = 2;

    let (gated, gate) = GatedSink::new();
    let source = started_sim_source(0, SimCameraConfig::default());
    let encoder = PassthroughEncoder::new(EncoderConfig::default()).unwrap();

    let mut pipeline = CapturePipeline::new(0);
    pipeline
        .init(PipelineConfig::from_session(&session_cfg, small_camera_config(0)))
        .unwrap();
    pipeline
        .start(source, encoder, gated, pool.clone(), sync, monitor.clone(), events_tx)
        .unwrap();

    // the stalled writer should escalate to Error shortly past 500ms
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.state() == PipelineState::Error
    }));
    let counters = pipeline.counters();
    assert!(counters.frames_dropped > 0);
    assert!(monitor
        .recent_alerts(2000)
        .iter()
        .any(|a| a.message.contains("writer backpressure")));
    let mut saw_fatal = false;
    while let Ok(event) = events_rx.try_recv() {
        if matches!(event, PipelineEvent::Fatal { camera_id: 0, .. }) {
            saw_fatal = true;
        }
    }
    assert!(saw_fatal);

    // unblock storage and verify teardown completes without deadlock
    gate.store(true, Ordering::SeqCst);
    pipeline.remediate().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Ready);
    assert_eq!(pool.stats().in_use, 0);
}

#[test]
fn repeated_encoder_faults_drive_pipeline_to_error() {
    let pool = small_pool(8);
    let sync = Arc::new(StreamSync::new(2).unwrap());
    let monitor = PipelineMonitor::new();
    let (events_tx, events_rx) = mpsc::channel();

    let source = started_sim_source(0, SimCameraConfig::default());
    let mut pipeline = CapturePipeline::new(0);
    pipeline
        .init(PipelineConfig::from_session(
            &SessionConfig::default(),
            small_camera_config(0),
        ))
        .unwrap();
    pipeline
        .start(
            source,
            FailingEncoder,
            MemorySink::new(),
            pool.clone(),
            sync,
            monitor.clone(),
            events_tx,
        )
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.state() == PipelineState::Error
    }));
    assert!(!pipeline.is_healthy());

    let fatal_seen = wait_until(Duration::from_secs(1), || {
        matches!(events_rx.try_recv(), Ok(PipelineEvent::Fatal { .. }))
    });
    assert!(fatal_seen);

    // surfaces owned at the moment of failure were still released
    pipeline.remediate().unwrap();
    assert_eq!(pool.stats().in_use, 0);
}

#[test]
fn single_transient_fault_is_retried() {
    let pool = small_pool(8);
    let sync = Arc::new(StreamSync::new(2).unwrap());
    let monitor = PipelineMonitor::new();
    let (events_tx, _events_rx) = mpsc::channel();

    // one isolated source fault among good frames must not kill the pipeline
    let mut source = ScriptedSource::new(vec![
        33_000_000,
        66_000_000,
        99_000_000,
        132_000_000,
        165_000_000,
    ]);
    source.faulty_frames = vec![1];

    let encoder = PassthroughEncoder::new(EncoderConfig::default()).unwrap();
    let sink = MemorySink::new();
    let sink_view = sink.clone();

    let mut pipeline = CapturePipeline::new(0);
    pipeline
        .init(PipelineConfig::from_session(
            &SessionConfig::default(),
            small_camera_config(0),
        ))
        .unwrap();
    pipeline
        .start(source, encoder, sink, pool, sync, monitor, events_tx)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.counters().frames_encoded >= 4
    }));
    assert_eq!(pipeline.state(), PipelineState::Recording);

    pipeline.stop().unwrap();
    assert_eq!(pipeline.counters().frames_encoded, 4);
    assert_eq!(sink_view.unit_count(), 5); // 4 frames + terminator
}

#[test]
fn pause_discards_frames_as_drops() {
    let pool = small_pool(8);
    let sync = Arc::new(StreamSync::new(2).unwrap());
    let monitor = PipelineMonitor::new();
    let (events_tx, _events_rx) = mpsc::channel();

    let source = started_sim_source(0, SimCameraConfig::default());
    let encoder = PassthroughEncoder::new(EncoderConfig::default()).unwrap();
    let sink = MemorySink::new();

    let mut pipeline = CapturePipeline::new(0);
    pipeline
        .init(PipelineConfig::from_session(
            &SessionConfig::default(),
            small_camera_config(0),
        ))
        .unwrap();
    pipeline
        .start(source, encoder, sink, pool, sync, monitor, events_tx)
        .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.state() == PipelineState::Recording
    }));
    pipeline.pause().unwrap();
    // quiesce: in-flight frames settle, then drops accumulate
    let encoded_at_pause = pipeline.counters().frames_encoded;
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.counters().frames_dropped > 10
    }));
    assert!(pipeline.counters().frames_encoded <= encoded_at_pause + 2);

    pipeline.resume().unwrap();
    let encoded_at_resume = pipeline.counters().frames_encoded;
    assert!(wait_until(Duration::from_secs(5), || {
        pipeline.counters().frames_encoded > encoded_at_resume
    }));

    pipeline.stop().unwrap();
    assert_eq!(pipeline.state(), PipelineState::Idle);
}
