//! Dual-camera recorder entry point.
//!
//! Wires the simulated capture and encode collaborators into a recording
//! session, maps SIGINT/SIGTERM onto a graceful stop, and prints a stats
//! line every few seconds until the session ends.

use anyhow::{Context, Result};
use camera::{SimCamera, SimCameraConfig};
use clap::Parser;
use config::AppConfig;
use encoder::PassthroughEncoder;
use monitor::AlertLevel;
use session::RecordingSession;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "recorder", about = "Dual-camera sports recorder")]
struct Args {
    /// Game identifier; output files are named <game_id>_cam<N>.<ext>
    #[arg(default_value = "game_test")]
    game_id: String,

    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => AppConfig::from_path(path).context("loading configuration")?,
        None => AppConfig::default(),
    };

    let cameras = [
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
                realtime: true,
                ..Default::default()
            },
        ),
    ];
    let encoders = [
        PassthroughEncoder::new(config.encoder.clone()).context("camera 0 encoder")?,
        PassthroughEncoder::new(config.encoder.clone()).context("camera 1 encoder")?,
    ];

    let stats_interval = Duration::from_secs(config.session.stats_interval_secs.max(1));
    let mut session = RecordingSession::new(
        config.session,
        config.camera,
        config.writer,
        cameras,
        encoders,
    )
    .context("building recording session")?;

    session.register_alert_callback(Box::new(|alert| {
        if alert.level >= AlertLevel::Error {
            warn!(
                component = %alert.component,
                level = %alert.level,
                "{}",
                alert.message
            );
        }
    }));

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("installing signal handler")?;
    }

    session
        .start_recording(&args.game_id)
        .context("starting recording")?;
    info!(game_id = %args.game_id, "recording; press Ctrl+C to stop");

    let mut last_stats = std::time::Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
        if session.has_failed() {
            warn!("session lost both pipelines, stopping");
            break;
        }
        if last_stats.elapsed() >= stats_interval {
            print_stats(&session);
            last_stats = std::time::Instant::now();
        }
    }

    let result = session.stop_recording().context("stopping recording")?;
    info!(
        cam0 = %result
            .camera0_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        frames0 = result.total_frames[0],
        frames1 = result.total_frames[1],
        duration_s = result.duration_ns / 1_000_000_000,
        "recording complete"
    );
    if !result.success {
        anyhow::bail!(
            "recording failed: {}",
            result.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}

fn print_stats(session: &RecordingSession<SimCamera, PassthroughEncoder>) {
    let status = session.status();
    let metrics = session.metrics();
    info!(
        cam0_frames = status.frames_recorded[0],
        cam0_drops = status.frames_dropped[0],
        cam1_frames = status.frames_recorded[1],
        cam1_drops = status.frames_dropped[1],
        drift_ms = metrics.drift_ns / 1_000_000,
        healthy = session.is_healthy(),
        "stats"
    );
}
