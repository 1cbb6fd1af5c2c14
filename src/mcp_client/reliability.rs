//! Reliability executor — per-attempt timeout and bounded retry with backoff.
//!
//! Every attempt gets its own deadline. The attempt itself is expected to
//! stop at that deadline and release its transport; the executor enforces
//! the same deadline (plus a short grace for cleanup) as a backstop, so a
//! hung attempt is abandoned either way.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout_at, Instant};

use super::errors::McpError;
use super::registry::ServerDescriptor;
use super::types::CallOptions;
use crate::config::ClientDefaults;

/// Time an attempt may spend releasing its transport after the deadline.
const RELEASE_GRACE: Duration = Duration::from_secs(3);

// ─── RetryPolicy ─────────────────────────────────────────────────────────────

/// Effective reliability settings for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub retryable_patterns: Vec<String>,
}

impl RetryPolicy {
    /// Per-call value, else per-server default, else client default.
    pub fn resolve(
        options: &CallOptions,
        descriptor: &ServerDescriptor,
        defaults: &ClientDefaults,
    ) -> Self {
        let timeout_ms = options
            .timeout_ms
            .or(descriptor.timeout_ms)
            .unwrap_or(defaults.timeout_ms);
        Self {
            timeout: Duration::from_millis(timeout_ms),
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            base_delay: Duration::from_millis(
                options
                    .retry_delay_ms_base
                    .unwrap_or(defaults.retry_delay_ms_base),
            ),
            retryable_patterns: options
                .retryable_error_patterns
                .clone()
                .unwrap_or_else(|| defaults.retryable_error_patterns.clone()),
        }
    }

    /// Total attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry `n` (1-based): `base × 2^(n-1)`.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
    }

    /// Whether `err` may succeed on a fresh attempt.
    ///
    /// Terminal errors never are; anything else is retried when its message
    /// contains one of the configured patterns (case-insensitive).
    pub fn is_retryable(&self, err: &McpError) -> bool {
        if err.is_terminal() {
            return false;
        }
        let message = err.to_string().to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|p| !p.is_empty() && message.contains(&p.to_lowercase()))
    }
}

// ─── Executor ────────────────────────────────────────────────────────────────

/// One attempt as seen by the attempt function.
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    pub deadline: Instant,
    pub timeout: Duration,
}

impl Attempt {
    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// Run `attempt_fn` under `policy`.
///
/// Attempts are strictly sequential. A terminal or non-matching error is
/// returned as is. When every attempt fails with a retryable error the last
/// one is wrapped in [`McpError::RetriesExhausted`]; with a single attempt
/// allowed there is nothing to aggregate and the error is returned unchanged.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut attempt_fn: F,
) -> Result<T, McpError>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, McpError>>,
{
    let max_attempts = policy.max_attempts();
    let mut number = 1;

    loop {
        if number > 1 {
            let delay = policy.backoff_delay(number - 1);
            tracing::debug!(attempt = number, delay_ms = delay.as_millis() as u64, "backing off");
            sleep(delay).await;
        }

        let deadline = Instant::now() + policy.timeout;
        let attempt = Attempt {
            number,
            deadline,
            timeout: policy.timeout,
        };

        let outcome = match timeout_at(deadline + RELEASE_GRACE, attempt_fn(attempt)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(label, attempt = number, "attempt abandoned past deadline");
                Err(McpError::Timeout {
                    tool: label.to_string(),
                    timeout_ms: attempt.timeout_ms(),
                })
            }
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !policy.is_retryable(&err) {
            return Err(err);
        }

        if number >= max_attempts {
            if number == 1 {
                return Err(err);
            }
            tracing::warn!(label, attempts = number, error = %err, "retries exhausted");
            return Err(McpError::RetriesExhausted {
                attempts: number,
                last: Box::new(err),
            });
        }

        tracing::warn!(
            label,
            attempt = number,
            max_attempts,
            error = %err,
            "transient failure, retrying"
        );
        number += 1;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
