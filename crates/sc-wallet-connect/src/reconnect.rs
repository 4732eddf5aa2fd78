use crate::error::ConnectError;
use crate::retry::{Jitter, RetryPolicy};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RetryFailure {
    /// Another attempt is already running.
    Busy,
    /// The error is not retryable; no further attempts were made.
    Aborted(ConnectError),
    /// `max_retries` attempts failed.
    Exhausted(ConnectError),
    Cancelled,
}

impl RetryFailure {
    pub fn into_error(self) -> ConnectError {
        match self {
            RetryFailure::Busy => ConnectError::Busy,
            RetryFailure::Aborted(err) | RetryFailure::Exhausted(err) => err,
            RetryFailure::Cancelled => ConnectError::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconnectStats {
    pub retry_count: u32,
    pub consecutive_failures: u32,
    pub in_flight: bool,
}

/// Drives retries with exponential backoff, one attempt sequence at a time.
pub struct ReconnectionController {
    policy: RetryPolicy,
    jitter: Jitter,
    in_flight: AtomicBool,
    retry_count: AtomicU32,
    consecutive_failures: AtomicU32,
    cancel: watch::Sender<u64>,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ReconnectionController {
    pub fn new(policy: RetryPolicy, jitter: Jitter) -> Self {
        let (cancel, _) = watch::channel(0);
        Self {
            policy,
            jitter,
            in_flight: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            cancel,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReconnectStats {
        ReconnectStats {
            retry_count: self.retry_count.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            in_flight: self.is_in_flight(),
        }
    }

    /// Stops any attempt sequence that is waiting for its next retry.
    pub fn cancel(&self) {
        self.cancel.send_modify(|generation| *generation += 1);
    }

    /// Changes whenever [`ReconnectionController::cancel`] is called.
    pub fn cancellation(&self) -> watch::Receiver<u64> {
        self.cancel.subscribe()
    }

    /// Runs `attempt_fn` until it succeeds, fails with a non-retryable error,
    /// or `max_retries` attempts have failed. The attempt index passed in
    /// starts at 0.
    pub async fn run<T, F, Fut>(&self, mut attempt_fn: F) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ConnectError>>,
    {
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!("reconnection already in flight");
            return Err(RetryFailure::Busy);
        };
        let mut cancelled = self.cancel.subscribe();
        self.retry_count.store(0, Ordering::Release);

        let mut attempt: u32 = 0;
        loop {
            let err = match attempt_fn(attempt).await {
                Ok(value) => {
                    self.retry_count.store(0, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Release);
                    if attempt > 0 {
                        info!(attempts = attempt + 1, "reconnection succeeded");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            self.consecutive_failures.fetch_add(1, Ordering::AcqRel);

            if !err.is_retryable() {
                warn!(error = %err, "attempt failed with non-retryable error");
                return Err(RetryFailure::Aborted(err));
            }

            attempt += 1;
            if attempt >= self.policy.max_retries() {
                warn!(attempts = attempt, error = %err, "retries exhausted");
                return Err(RetryFailure::Exhausted(err));
            }

            let delay = self
                .jitter
                .apply(self.policy.delay_for(attempt - 1), self.policy.max_delay());
            self.retry_count.store(attempt, Ordering::Release);
            info!(
                retry = attempt,
                max_retries = self.policy.max_retries(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "scheduling retry"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled.changed() => {
                    debug!("retry sequence cancelled");
                    return Err(RetryFailure::Cancelled);
                }
            }
        }
    }

    /// Returns `true` once `reconnect` succeeds. A call made while another
    /// sequence is running returns `false` without invoking either callback.
    pub async fn attempt_reconnection<F, Fut>(
        &self,
        mut reconnect: F,
        on_success: impl FnOnce(),
        on_failure: impl FnOnce(&ConnectError),
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ConnectError>>,
    {
        match self.run(|_| reconnect()).await {
            Ok(()) => {
                on_success();
                true
            }
            Err(RetryFailure::Busy) => false,
            Err(failure) => {
                on_failure(&failure.into_error());
                false
            }
        }
    }
}
