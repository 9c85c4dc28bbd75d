//! Full-rig scenarios: two simulated cameras, passthrough encoders, real
//! storage writers in a temp directory.

use camera::{SimCamera, SimCameraConfig};
use common_io::PipelineState;
use config::{CameraConfig, EncoderConfig, SessionConfig, WriterConfig};
use encoder::PassthroughEncoder;
use recovery::{RecoveryAction, RecoverySystem};
use session::RecordingSession;
use std::path::Path;
use std::time::{Duration, Instant};
use testsupport::FailingEncoder;

fn test_session_cfg(root: &Path) -> SessionConfig {
    let mut cfg = SessionConfig::default();
    cfg.output_dir = root.join("recordings");
    cfg.state_dir = root.join("state");
    std::fs::create_dir_all(&cfg.output_dir).unwrap();
    cfg.buffer_count = 8;
    cfg.checkpoint_interval_secs = 1;
    cfg
}

fn test_camera_cfg() -> CameraConfig {
    let mut cfg = CameraConfig::default();
    cfg.width = 64;
    cfg.height = 48;
    cfg
}

fn test_writer_cfg() -> WriterConfig {
    WriterConfig {
        preallocate_bytes: 0,
        reserved_bytes: 0,
        flush_interval_units: 32,
    }
}

/// Paced cameras: frame timestamps on both sensors advance in lockstep wall
/// time, with an optional fixed skew on camera 1.
fn sim_cameras(skew_ns: i64) -> [SimCamera; 2] {
    [
        SimCamera::new(
            0,
            SimCameraConfig {
                realtime: true,
                ..Default::default()
            },
        ),
        SimCamera::new(
            1,
            SimCameraConfig {
                timestamp_skew_ns: skew_ns,
                realtime: true,
                ..Default::default()
            },
        ),
    ]
}

/// Unpaced cameras for tests that only need frames as fast as possible.
fn flooding_cameras() -> [SimCamera; 2] {
    [
        SimCamera::new(0, SimCameraConfig::default()),
        SimCamera::new(1, SimCameraConfig::default()),
    ]
}

fn passthrough_pair() -> [PassthroughEncoder; 2] {
    [
        PassthroughEncoder::new(EncoderConfig::default()).unwrap(),
        PassthroughEncoder::new(EncoderConfig::default()).unwrap(),
    ]
}

fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn clean_dual_record_and_stop() {
    let root = tempfile::tempdir().unwrap();
    let mut session = RecordingSession::new(
        test_session_cfg(root.path()),
        test_camera_cfg(),
        test_writer_cfg(),
        sim_cameras(0),
        passthrough_pair(),
    )
    .unwrap();

    session.start_recording("match_42").unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        let s = session.status();
        s.frames_recorded[0] >= 60 && s.frames_recorded[1] >= 60
    }));
    assert!(session.is_recording());
    assert!(session.is_healthy());
    assert_eq!(session.status().total_drops(), 0);

    let result = session.stop_recording().unwrap();
    assert!(result.success);
    assert!(result.error.is_none());
    assert!(result.total_frames[0] >= 60);
    assert!(result.total_frames[1] >= 60);

    // deterministic names, both files finalized and playable
    for (idx, path) in [&result.camera0_path, &result.camera1_path]
        .into_iter()
        .enumerate()
    {
        let path = path.as_ref().unwrap();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&format!("match_42_cam{}", idx)));
        let mut file = std::fs::File::open(path).unwrap();
        let len = file.metadata().unwrap().len();
        let index = storage::clip::read_trailer(&mut file, len).unwrap().unwrap();
        assert_eq!(index.len() as u64, result.total_frames[idx] + 1); // + terminator
    }

    // a clean stop consumes the checkpoint
    let recovery = RecoverySystem::new(&root.path().join("state")).unwrap();
    assert!(!recovery.can_recover());
}

#[test]
fn drift_telemetry_flows_through_session() {
    let root = tempfile::tempdir().unwrap();
    let mut session = RecordingSession::new(
        test_session_cfg(root.path()),
        test_camera_cfg(),
        test_writer_cfg(),
        sim_cameras(20_000_000),
        passthrough_pair(),
    )
    .unwrap();

    session.start_recording("driftgame").unwrap();
    // a steady 20ms skew sits inside one frame but past the half-frame
    // correction threshold
    assert!(wait_until(Duration::from_secs(10), || {
        let metrics = session.metrics();
        metrics.synchronized
            && metrics.sync_corrections > 0
            && metrics.drift_ns.abs() <= 33_000_000
    }));

    session.stop_recording().unwrap();
}

#[test]
fn lifecycle_commands_validate_state() {
    let root = tempfile::tempdir().unwrap();
    let mut session = RecordingSession::new(
        test_session_cfg(root.path()),
        test_camera_cfg(),
        test_writer_cfg(),
        sim_cameras(0),
        passthrough_pair(),
    )
    .unwrap();

    assert!(session.stop_recording().is_err());
    session.start_recording("once").unwrap();
    assert!(session.start_recording("twice").is_err());
    session.stop_recording().unwrap();
}

#[test]
fn metadata_round_trips() {
    let root = tempfile::tempdir().unwrap();
    let session = RecordingSession::new(
        test_session_cfg(root.path()),
        test_camera_cfg(),
        test_writer_cfg(),
        sim_cameras(0),
        passthrough_pair(),
    )
    .unwrap();

    session.set_metadata("venue", "city stadium");
    assert_eq!(session.metadata("venue").as_deref(), Some("city stadium"));
    assert!(session.metadata("absent").is_none());
}

#[test]
fn dual_pipeline_failure_terminates_and_leaves_salvage_checkpoint() {
    let root = tempfile::tempdir().unwrap();
    let mut session = RecordingSession::new(
        test_session_cfg(root.path()),
        test_camera_cfg(),
        test_writer_cfg(),
        flooding_cameras(),
        [FailingEncoder, FailingEncoder],
    )
    .unwrap();

    session.start_recording("doomed").unwrap();
    assert!(wait_until(Duration::from_secs(5), || session.has_failed()));

    let result = session.stop_recording().unwrap();
    assert!(!result.success);
    assert!(result.error.is_some());

    // the checkpoint survives, marked so the next run salvages
    let recovery = RecoverySystem::new(&root.path().join("state")).unwrap();
    assert!(recovery.can_recover());
    assert_eq!(recovery.determine_action(), RecoveryAction::RestartPipeline);
    let prior = recovery.load().unwrap().unwrap();
    assert_eq!(prior.state, PipelineState::Error);
}

#[test]
fn restart_salvages_previous_torn_outputs() {
    let root = tempfile::tempdir().unwrap();
    let session_cfg = test_session_cfg(root.path());

    // fabricate a crashed run: torn clip plus a checkpoint pointing at it
    let torn_path = session_cfg.output_dir.join("prior_cam0.pvc");
    let mut bytes = storage::clip::encode_header(0);
    for i in 1..=25u64 {
        bytes.extend_from_slice(&storage::clip::encode_record(&common_io::EncodedUnit {
            data: vec![3u8; 80],
            pts_ns: i * 33_000_000,
            key_frame: i == 1,
        }));
    }
    bytes.extend_from_slice(&vec![0u8; 256]);
    std::fs::write(&torn_path, &bytes).unwrap();

    {
        let recovery = RecoverySystem::new(&session_cfg.state_dir).unwrap();
        let mut status = common_io::SessionStatus::idle();
        status.state = PipelineState::Recording;
        status.frames_recorded = [25, 0];
        status.output_paths[0] = Some(torn_path.clone());
        recovery.checkpoint(&status).unwrap();
    }

    let mut session = RecordingSession::new(
        session_cfg.clone(),
        test_camera_cfg(),
        test_writer_cfg(),
        sim_cameras(0),
        passthrough_pair(),
    )
    .unwrap();
    session.start_recording("fresh_game").unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        session.status().frames_recorded[0] > 0
    }));
    session.stop_recording().unwrap();

    // the torn clip from the prior run is now a finalized, indexed file
    let mut file = std::fs::File::open(&torn_path).unwrap();
    let len = file.metadata().unwrap().len();
    let index = storage::clip::read_trailer(&mut file, len).unwrap().unwrap();
    assert_eq!(index.len(), 25);
}
