//! Background polling loops, one per sampler.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::sampler::Sampler;

/// How a call to [`PollingLoop::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// There was no loop to stop
    NotRunning,
    /// The loop observed cancellation and exited within the grace period
    Stopped,
    /// The loop overran the grace period and was aborted
    Abandoned,
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Invokes a sampler's `update` on a fixed period until stopped.
///
/// At most one background task exists per loop, so a sampler is never
/// updated concurrently with itself.
pub struct PollingLoop {
    name: String,
    sampler: Arc<dyn Sampler>,
    interval: Duration,
    grace: Duration,
    task: Mutex<Option<RunningTask>>,
    active: Arc<AtomicUsize>,
}

impl PollingLoop {
    pub fn new(sampler: Arc<dyn Sampler>, interval: Duration, grace: Duration) -> Self {
        Self {
            name: sampler.name().to_string(),
            sampler,
            interval,
            grace,
            task: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of background tasks currently alive for this loop
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Spawn the background task. Must be called from within a tokio runtime;
    /// a second call while running only logs a warning.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            warn!(collector = %self.name, "Collector is already running, ignoring request to start it");
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(collector = %self.name, error = %e, "Cannot start collector outside a runtime");
                return;
            }
        };

        info!(collector = %self.name, interval_ms = self.interval.as_millis() as u64, "Starting collector");
        let token = CancellationToken::new();
        let handle = runtime.spawn(run(
            self.name.clone(),
            self.sampler.clone(),
            self.interval,
            token.clone(),
            ActiveGuard::enter(self.active.clone()),
        ));
        *task = Some(RunningTask { token, handle });
    }

    /// Cancel the background task and wait up to the grace period for it to exit.
    /// Safe to call when never started and idempotent.
    pub async fn stop(&self) -> StopOutcome {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(RunningTask { token, mut handle }) = task else {
            debug!(collector = %self.name, "Collector not running");
            return StopOutcome::NotRunning;
        };

        info!(collector = %self.name, "Stopping collector");
        token.cancel();

        match tokio::time::timeout(self.grace, &mut handle).await {
            Ok(Ok(())) => {
                info!(collector = %self.name, "Stopped collector");
                StopOutcome::Stopped
            }
            Ok(Err(e)) => {
                warn!(collector = %self.name, error = %e, "Collector task ended abnormally");
                StopOutcome::Stopped
            }
            Err(_) => {
                warn!(
                    collector = %self.name,
                    grace_ms = self.grace.as_millis() as u64,
                    "Collector did not stop in time, abandoning it"
                );
                handle.abort();
                StopOutcome::Abandoned
            }
        }
    }
}

impl Drop for PollingLoop {
    fn drop(&mut self) {
        let task = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.token.cancel();
        }
    }
}

/// Counts live loop tasks; released even when the task is aborted
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn run(
    name: String,
    sampler: Arc<dyn Sampler>,
    interval: Duration,
    token: CancellationToken,
    _active: ActiveGuard,
) {
    while !token.is_cancelled() {
        let update = AssertUnwindSafe(sampler.update()).catch_unwind();
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            outcome = update => match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(collector = %name, error = %e, "Collection failed"),
                Err(_) => error!(collector = %name, "Collector update panicked"),
            },
        }

        if token.is_cancelled() {
            break;
        }

        if interval.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    debug!(collector = %name, "Collector loop exited");
}
