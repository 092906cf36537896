//! Background task supervision
//!
//! Long-lived loops (tick flush, health sweep) run under a supervisor that
//! retries failed iterations with exponential backoff. Failure handling is
//! decided per task: a loop whose failures are an expected backpressure
//! signal (a flush against an unavailable store) retries indefinitely,
//! while a loop that has no legitimate failure mode aborts the process
//! once a cap is hit rather than degrading silently.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

/// What the supervisor does when a task keeps failing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Keep retrying with backoff forever. The task's own next iteration
    /// is the retry, so a long outage costs latency, never the loop.
    RetryIndefinitely,
    /// Abort after this many consecutive failures.
    AbortAfter(u32),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub policy: FailurePolicy,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl SupervisorConfig {
    /// For loops where failure means "the dependency is down, try again":
    /// backoff never exceeds the loop's own cadence.
    pub fn retry_indefinitely(max_backoff: Duration) -> Self {
        Self {
            policy: FailurePolicy::RetryIndefinitely,
            initial_backoff: Duration::from_secs(1).min(max_backoff),
            max_backoff,
        }
    }

    /// For loops that must not fail at all.
    pub fn abort_after(max_failures: u32) -> Self {
        Self {
            policy: FailurePolicy::AbortAfter(max_failures),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Run one iteration of a background task forever, injecting a backoff
/// delay after each failed iteration. The task function owns its own
/// pacing (interval tick or sleep) on the success path.
///
/// # Panics
/// Only under `FailurePolicy::AbortAfter`, once the consecutive-failure
/// cap is reached.
pub async fn supervise<F, Fut>(task_name: &str, config: SupervisorConfig, mut task_fn: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), String>>,
{
    let mut failures: u32 = 0;
    let mut backoff = config.initial_backoff;

    loop {
        match task_fn().await {
            Ok(()) => {
                if failures > 0 {
                    warn!(
                        "Task '{}' recovered after {} failed attempts",
                        task_name, failures
                    );
                }
                failures = 0;
                backoff = config.initial_backoff;
            }
            Err(e) => {
                failures += 1;
                match config.policy {
                    FailurePolicy::AbortAfter(cap) if failures >= cap => {
                        panic!(
                            "Task '{}' failed {} times in a row, aborting. Last error: {}",
                            task_name, failures, e
                        );
                    }
                    FailurePolicy::AbortAfter(cap) => {
                        error!(
                            "Task '{}' failed ({}/{}): {}",
                            task_name, failures, cap, e
                        );
                    }
                    FailurePolicy::RetryIndefinitely => {
                        error!(
                            "Task '{}' failed ({} consecutive, retrying in {:?}): {}",
                            task_name, failures, backoff, e
                        );
                    }
                }

                sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
            }
        }
    }
}
