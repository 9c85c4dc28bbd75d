//! Pipeline health monitor.
//!
//! Collects per-camera counters on the hot path with plain atomics
//! (single writer per pipeline thread, relaxed readers), keeps a bounded
//! alert ring, and fans alerts out to registered callbacks. The monitor
//! observes and warns; it never commands the pipelines.

use common_io::{PipelineState, NUM_CAMERAS};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::System;
use tracing::{info, warn};

/// Alert ring capacity per session; oldest entries fall off first.
const ALERT_RING_CAPACITY: usize = 1000;
/// Per-callback delivery queue bound.
const CALLBACK_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub message: String,
    pub timestamp_ns: u64,
}

pub type AlertCallback = Box<dyn Fn(&Alert) + Send + 'static>;

/// Per-camera counter snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CameraMetrics {
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub current_fps: f64,
    pub average_fps: f64,
    pub encode_latency_ns: u64,
}

/// Full metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct MonitorMetrics {
    pub cameras: [CameraMetrics; NUM_CAMERAS],
    pub cpu_usage_percent: f64,
    pub memory_used_bytes: u64,
}

struct CallbackQueue {
    queue: VecDeque<Alert>,
    overflowed: bool,
    shutdown: bool,
}

struct CallbackSlot {
    state: Arc<(Mutex<CallbackQueue>, Condvar)>,
    worker: Option<thread::JoinHandle<()>>,
}

type HealthProbe = Arc<dyn Fn() -> bool + Send + Sync>;
type StateProbe = Arc<dyn Fn() -> Vec<PipelineState> + Send + Sync>;

struct FpsWindow {
    last_counts: [u64; NUM_CAMERAS],
    last_sample: Instant,
    current_fps: [f64; NUM_CAMERAS],
}

struct Inner {
    epoch: Instant,
    running: AtomicBool,
    frames_captured: [AtomicU64; NUM_CAMERAS],
    frames_dropped: [AtomicU64; NUM_CAMERAS],
    encode_latency_ns: [AtomicU64; NUM_CAMERAS],
    cpu_permille: AtomicU64,
    memory_used: AtomicU64,
    alerts: Mutex<VecDeque<Alert>>,
    callbacks: Mutex<Vec<CallbackSlot>>,
    fps: Mutex<FpsWindow>,
    pool_probe: Mutex<Option<HealthProbe>>,
    state_probe: Mutex<Option<StateProbe>>,
    sampler_stop: AtomicBool,
}

/// Cheap cloneable handle shared with every pipeline.
#[derive(Clone)]
pub struct PipelineMonitor {
    inner: Arc<Inner>,
    sampler: Arc<Mutex<Option<thread::JoinHandle<()>>>>,
}

impl PipelineMonitor {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                epoch: now,
                running: AtomicBool::new(false),
                frames_captured: Default::default(),
                frames_dropped: Default::default(),
                encode_latency_ns: Default::default(),
                cpu_permille: AtomicU64::new(0),
                memory_used: AtomicU64::new(0),
                alerts: Mutex::new(VecDeque::with_capacity(64)),
                callbacks: Mutex::new(Vec::new()),
                fps: Mutex::new(FpsWindow {
                    last_counts: [0; NUM_CAMERAS],
                    last_sample: now,
                    current_fps: [0.0; NUM_CAMERAS],
                }),
                pool_probe: Mutex::new(None),
                state_probe: Mutex::new(None),
                sampler_stop: AtomicBool::new(false),
            }),
            sampler: Arc::new(Mutex::new(None)),
        }
    }

    /// Register health inputs owned by other components.
    pub fn set_health_probes(&self, pool: HealthProbe, states: StateProbe) {
        *self.inner.pool_probe.lock().unwrap() = Some(pool);
        *self.inner.state_probe.lock().unwrap() = Some(states);
    }

    /// Start the background system sampler.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.sampler_stop.store(false, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("monitor-sampler".into())
            .spawn(move || sampler_loop(inner))
            .expect("spawn monitor sampler");
        *self.sampler.lock().unwrap() = Some(handle);
        self.raise(AlertLevel::Info, "Monitor", "pipeline monitoring started");
    }

    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.sampler_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sampler.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn record_capture(&self, camera_id: u32) {
        if let Some(counter) = self.inner.frames_captured.get(camera_id as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// A drop is a frame the source produced that never reached the output.
    pub fn record_drop(&self, camera_id: u32) {
        if let Some(counter) = self.inner.frames_dropped.get(camera_id as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
            self.raise(
                AlertLevel::Warning,
                &format!("Camera{}", camera_id),
                "frame drop detected",
            );
        }
    }

    pub fn record_encode_latency(&self, camera_id: u32, latency_ns: u64) {
        if let Some(cell) = self.inner.encode_latency_ns.get(camera_id as usize) {
            cell.store(latency_ns, Ordering::Relaxed);
        }
    }

    pub fn total_drops(&self) -> u64 {
        self.inner
            .frames_dropped
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    /// Raise an alert: ring first, then per-callback delivery queues.
    pub fn raise(&self, level: AlertLevel, component: &str, message: &str) {
        let alert = Alert {
            level,
            component: component.to_string(),
            message: message.to_string(),
            timestamp_ns: self.inner.epoch.elapsed().as_nanos() as u64,
        };
        if level >= AlertLevel::Error {
            warn!(component, message, "alert raised");
        }

        {
            let mut ring = self.inner.alerts.lock().unwrap();
            if ring.len() == ALERT_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(alert.clone());
        }

        let mut overflow_episodes = 0usize;
        {
            let callbacks = self.inner.callbacks.lock().unwrap();
            for slot in callbacks.iter() {
                let (lock, cv) = &*slot.state;
                let mut state = lock.lock().unwrap();
                if state.queue.len() == CALLBACK_QUEUE_CAPACITY {
                    state.queue.pop_front();
                    if !state.overflowed {
                        state.overflowed = true;
                        overflow_episodes += 1;
                    }
                }
                state.queue.push_back(alert.clone());
                cv.notify_one();
            }
        }
        for _ in 0..overflow_episodes {
            self.raise(
                AlertLevel::Error,
                "Monitor",
                "alert delivery queue overflowed, oldest deliveries dropped",
            );
        }
    }

    /// Up to `max` newest alerts, newest first.
    pub fn recent_alerts(&self, max: usize) -> Vec<Alert> {
        let ring = self.inner.alerts.lock().unwrap();
        ring.iter().rev().take(max).cloned().collect()
    }

    /// Callbacks observe alerts in raise order; a slow callback delays only
    /// its own queue.
    pub fn register_alert_callback(&self, callback: AlertCallback) {
        let state = Arc::new((
            Mutex::new(CallbackQueue {
                queue: VecDeque::new(),
                overflowed: false,
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let worker_state = Arc::clone(&state);
        let worker = thread::Builder::new()
            .name("monitor-alerts".into())
            .spawn(move || callback_loop(worker_state, callback))
            .expect("spawn alert worker");
        self.inner.callbacks.lock().unwrap().push(CallbackSlot {
            state,
            worker: Some(worker),
        });
    }

    pub fn metrics(&self) -> MonitorMetrics {
        let mut metrics = MonitorMetrics {
            cpu_usage_percent: self.inner.cpu_permille.load(Ordering::Relaxed) as f64 / 10.0,
            memory_used_bytes: self.inner.memory_used.load(Ordering::Relaxed),
            ..Default::default()
        };

        let elapsed = self.inner.epoch.elapsed().as_secs_f64();
        let mut fps = self.inner.fps.lock().unwrap();
        let window = fps.last_sample.elapsed().as_secs_f64();
        for cam in 0..NUM_CAMERAS {
            let captured = self.inner.frames_captured[cam].load(Ordering::Relaxed);
            if window >= 0.5 {
                fps.current_fps[cam] = (captured - fps.last_counts[cam]) as f64 / window;
                fps.last_counts[cam] = captured;
            }
            metrics.cameras[cam] = CameraMetrics {
                frames_captured: captured,
                frames_dropped: self.inner.frames_dropped[cam].load(Ordering::Relaxed),
                current_fps: fps.current_fps[cam],
                average_fps: if elapsed > 0.0 {
                    captured as f64 / elapsed
                } else {
                    0.0
                },
                encode_latency_ns: self.inner.encode_latency_ns[cam].load(Ordering::Relaxed),
            };
        }
        if window >= 0.5 {
            fps.last_sample = Instant::now();
        }
        metrics
    }

    /// Healthy means: running, zero drops, pool headroom intact, and every
    /// pipeline outside Error/Recovery.
    pub fn is_healthy(&self) -> bool {
        if !self.is_running() || self.total_drops() != 0 {
            return false;
        }
        if let Some(probe) = self.inner.pool_probe.lock().unwrap().as_ref() {
            if !probe() {
                return false;
            }
        }
        if let Some(probe) = self.inner.state_probe.lock().unwrap().as_ref() {
            for state in probe() {
                if matches!(state, PipelineState::Error | PipelineState::Recovery) {
                    return false;
                }
            }
        }
        true
    }

    /// Tear down callback workers. Called once by the owning session.
    pub fn shutdown(&self) {
        self.stop();
        let mut callbacks = self.inner.callbacks.lock().unwrap();
        for slot in callbacks.iter_mut() {
            let (lock, cv) = &*slot.state;
            lock.lock().unwrap().shutdown = true;
            cv.notify_all();
        }
        for slot in callbacks.iter_mut() {
            if let Some(worker) = slot.worker.take() {
                let _ = worker.join();
            }
        }
        callbacks.clear();
        info!("monitor shut down");
    }
}

impl Default for PipelineMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn callback_loop(state: Arc<(Mutex<CallbackQueue>, Condvar)>, callback: AlertCallback) {
    let (lock, cv) = &*state;
    loop {
        let alert = {
            let mut queue_state = lock.lock().unwrap();
            loop {
                if let Some(alert) = queue_state.queue.pop_front() {
                    if queue_state.queue.is_empty() {
                        // episode over once the backlog fully drains
                        queue_state.overflowed = false;
                    }
                    break Some(alert);
                }
                if queue_state.shutdown {
                    break None;
                }
                queue_state = cv.wait(queue_state).unwrap();
            }
        };
        match alert {
            Some(alert) => callback(&alert),
            None => return,
        }
    }
}

fn sampler_loop(inner: Arc<Inner>) {
    let mut system = System::new();
    let mut last_refresh: Option<Instant> = None;
    while !inner.sampler_stop.load(Ordering::SeqCst) {
        if last_refresh.map_or(true, |t| t.elapsed() >= Duration::from_secs(1)) {
            system.refresh_cpu();
            system.refresh_memory();
            let cpu = system.global_cpu_info().cpu_usage() as f64;
            inner
                .cpu_permille
                .store((cpu * 10.0) as u64, Ordering::Relaxed);
            inner
                .memory_used
                .store(system.used_memory(), Ordering::Relaxed);
            last_refresh = Some(Instant::now());
        }
        thread::sleep(Duration::from_millis(50));
    }
}
