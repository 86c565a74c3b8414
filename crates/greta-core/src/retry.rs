//! Outer retry loop around one full run of the bot.
//!
//! Recoverable failures are retried after a fixed delay, without bound in
//! production. Fatal and unclassified failures end the loop at once.

use std::{future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_attempts: None,
        }
    }
}

/// Passed to each attempt. `last_error` is the failure that caused this retry.
#[derive(Debug)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub last_error: Option<Error>,
}

/// How a run that did not fail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
    Restart,
}

/// Drives `attempt` until it asks to shut down or fails fatally.
///
/// Cancelling `shutdown` during the retry delay ends the loop with `Ok`.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    shutdown: &CancellationToken,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut(RetryAttempt) -> Fut,
    Fut: Future<Output = Result<RunExit>>,
{
    let mut attempt_number = 0u32;
    let mut last_error = None;

    loop {
        attempt_number += 1;
        let outcome = attempt(RetryAttempt {
            attempt_number,
            last_error: last_error.take(),
        })
        .await;

        let err = match outcome {
            Ok(RunExit::Shutdown) => return Ok(()),
            Ok(RunExit::Restart) => {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                tracing::info!(attempt = attempt_number, "restart requested");
                continue;
            }
            Err(e) => e,
        };

        if !err.is_recoverable() {
            tracing::error!(
                attempt = attempt_number,
                error = %err,
                error_kind = err.as_label(),
                "run failed; not retrying"
            );
            return Err(err);
        }
        if policy.max_attempts.is_some_and(|max| attempt_number >= max) {
            tracing::error!(attempt = attempt_number, error = %err, "giving up after last attempt");
            return Err(err);
        }

        tracing::warn!(
            attempt = attempt_number,
            error = %err,
            error_kind = err.as_label(),
            delay_secs = policy.delay.as_secs(),
            "run failed; retrying"
        );

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(policy.delay) => {}
        }
        last_error = Some(err);
    }
}
