//! Periodic background jobs
//!
//! Each job runs on its own named thread with a fixed delay between runs.
//! The loop wakes every 100ms to check for shutdown and for an early-run
//! request, so neither waits for a full cadence. Jobs never share a thread
//! with request-path work.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::{PulseError, PulseResult};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lets request paths ask a job to run before its next scheduled cycle.
#[derive(Debug, Default)]
pub struct RefreshSignal {
    requested: AtomicBool,
    requests: AtomicU64,
}

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for an early run. Repeated requests before the run coalesce.
    pub fn request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.requested.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Clear a pending request, returning whether there was one.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::AcqRel)
    }

    /// Requests made since creation.
    pub fn total_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// How a periodic job is scheduled.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: &'static str,
    pub cadence: Duration,
    /// Early-run trigger shared with request paths
    pub signal: Option<Arc<RefreshSignal>>,
    /// Run once more after shutdown is requested (final flush)
    pub final_run: bool,
}

impl JobSpec {
    pub fn new(name: &'static str, cadence: Duration) -> Self {
        Self { name, cadence, signal: None, final_run: false }
    }

    pub fn with_signal(mut self, signal: Arc<RefreshSignal>) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_final_run(mut self) -> Self {
        self.final_run = true;
        self
    }
}

#[derive(Debug, Default)]
struct StatsCell {
    cycles: AtomicU64,
    early_runs: AtomicU64,
    panics: AtomicU64,
    last_duration_us: AtomicU64,
}

/// Point-in-time job statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStats {
    pub cycles: u64,
    /// Cycles started by a [`RefreshSignal`] rather than the cadence
    pub early_runs: u64,
    /// Cycles that panicked; the job keeps running
    pub panics: u64,
    pub last_duration: Duration,
}

/// Handle to a running periodic job.
/// Dropping this handle stops the job.
pub struct JobHandle {
    name: &'static str,
    shutdown: Arc<AtomicBool>,
    stats: Arc<StatsCell>,
    thread: Option<thread::JoinHandle<()>>,
}

impl JobHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Request shutdown and wait for the job thread to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stats(&self) -> JobStats {
        JobStats {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            early_runs: self.stats.early_runs.load(Ordering::Relaxed),
            panics: self.stats.panics.load(Ordering::Relaxed),
            last_duration: Duration::from_micros(self.stats.last_duration_us.load(Ordering::Relaxed)),
        }
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start `task` on a dedicated thread according to `spec`.
pub fn spawn_periodic<F>(spec: JobSpec, task: F) -> PulseResult<JobHandle>
where
    F: FnMut() + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let stats = Arc::new(StatsCell::default());
    let name = spec.name;

    let thread = {
        let shutdown = Arc::clone(&shutdown);
        let stats = Arc::clone(&stats);
        thread::Builder::new()
            .name(format!("pulse-{name}"))
            .spawn(move || job_loop(spec, task, &shutdown, &stats))
            .map_err(|e| PulseError::JobSpawn { name: name.to_string(), message: e.to_string() })?
    };

    info!(job = name, "job started");
    Ok(JobHandle { name, shutdown, stats, thread: Some(thread) })
}

fn job_loop<F: FnMut()>(spec: JobSpec, mut task: F, shutdown: &AtomicBool, stats: &StatsCell) {
    let mut next_run = Instant::now() + spec.cadence;
    loop {
        if shutdown.load(Ordering::Acquire) {
            if spec.final_run {
                run_once(spec.name, &mut task, stats);
            }
            info!(job = spec.name, "job stopped");
            return;
        }

        let early = spec.signal.as_ref().is_some_and(|s| s.take());
        if early || Instant::now() >= next_run {
            if early {
                stats.early_runs.fetch_add(1, Ordering::Relaxed);
                debug!(job = spec.name, "early run requested");
            }
            run_once(spec.name, &mut task, stats);
            next_run = Instant::now() + spec.cadence;
            continue;
        }

        let wait = next_run.saturating_duration_since(Instant::now()).min(POLL_INTERVAL);
        thread::sleep(wait);
    }
}

fn run_once<F: FnMut()>(name: &'static str, task: &mut F, stats: &StatsCell) {
    let start = Instant::now();
    if panic::catch_unwind(AssertUnwindSafe(|| task())).is_err() {
        stats.panics.fetch_add(1, Ordering::Relaxed);
        error!(alert = "job_cycle_panicked", job = name, "job cycle panicked, continuing on next cadence");
    }
    let elapsed = start.elapsed();
    stats.cycles.fetch_add(1, Ordering::Relaxed);
    stats.last_duration_us.store(elapsed.as_micros() as u64, Ordering::Relaxed);
    debug!(job = name, elapsed_us = elapsed.as_micros() as u64, "job cycle finished");
}
