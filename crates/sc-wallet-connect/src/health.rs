use crate::error::ConnectError;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type ProbeFn = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ConnectError>> + Send + Sync>;
pub type UnhealthyFn = Box<dyn FnOnce() + Send>;
pub type SpawnFn = Arc<dyn Fn(BoxFuture<'static, ()>) -> JoinHandle<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub max_consecutive_failures: u32,
}

struct HealthTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic liveness probe. At most one probe loop runs at a time, and the
/// next probe is only scheduled after the previous one settles.
pub struct HealthMonitor {
    config: HealthConfig,
    consecutive_failures: Arc<AtomicU32>,
    task: Mutex<Option<HealthTask>>,
    spawn: SpawnFn,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            consecutive_failures: Arc::new(AtomicU32::new(0)),
            task: Mutex::new(None),
            spawn: Arc::new(|task: BoxFuture<'static, ()>| tokio::spawn(task)),
        }
    }

    /// Runs the probe loop through `spawn` instead of `tokio::spawn`.
    pub fn with_spawner(mut self, spawn: SpawnFn) -> Self {
        self.spawn = spawn;
        self
    }

    pub fn config(&self) -> HealthConfig {
        self.config
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Replaces any running loop. `on_unhealthy` fires at most once, after
    /// which the loop ends and must be restarted by the caller.
    pub fn start_health_check(&self, probe: ProbeFn, on_unhealthy: Option<UnhealthyFn>) {
        // Held across stop, spawn and store: one loop at a time.
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        halt(slot.take());
        self.consecutive_failures.store(0, Ordering::Release);

        let (stop, stop_rx) = watch::channel(false);
        let handle = (self.spawn)(
            probe_loop(
                self.config,
                self.consecutive_failures.clone(),
                probe,
                on_unhealthy,
                stop_rx,
            )
            .boxed(),
        );
        *slot = Some(HealthTask { stop, handle });
    }

    pub fn stop_health_check(&self) {
        let previous = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        halt(previous);
    }
}

fn halt(task: Option<HealthTask>) {
    if let Some(task) = task {
        let _ = task.stop.send(true);
        task.handle.abort();
        debug!("health check stopped");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop_health_check();
    }
}

async fn probe_loop(
    config: HealthConfig,
    failures: Arc<AtomicU32>,
    probe: ProbeFn,
    mut on_unhealthy: Option<UnhealthyFn>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = tokio::time::sleep(config.interval) => {}
        }

        let outcome = tokio::select! {
            _ = stop.changed() => return,
            outcome = tokio::time::timeout(config.probe_timeout, probe()) => outcome,
        };

        let result = outcome.unwrap_or(Err(ConnectError::Timeout {
            operation: "health probe",
            after: config.probe_timeout,
        }));

        match result {
            Ok(()) => {
                failures.store(0, Ordering::Release);
            }
            Err(err) => {
                let count = failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!(
                    consecutive_failures = count,
                    max = config.max_consecutive_failures,
                    error = %err,
                    "health probe failed"
                );
                if count >= config.max_consecutive_failures {
                    if let Some(callback) = on_unhealthy.take() {
                        callback();
                    }
                    return;
                }
            }
        }
    }
}
