//! Classification-driven retry with exponential backoff and jitter.
//!
//! Wraps a unit of work that performs exactly one provider call. Retryable
//! failures are retried up to a configured attempt budget; each attempt runs
//! through its own limiter admission cycle, so an exhausted bucket fails the
//! invocation without consuming retries.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Error;
use crate::handler::{FailureKind, ProviderResponse};
use crate::limiter::{BucketKey, RateLimiter};
use crate::types::InvocationContext;

/// Configuration for retry behavior on transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of call attempts (default: 5)
    pub max_attempts: usize,
    /// Base delay in milliseconds for exponential backoff (default: 500ms)
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 30000ms)
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Information about a scheduled retry.
#[derive(Debug, Clone)]
pub struct RetryInfo {
    /// Which attempt just failed (1-based).
    pub attempt: usize,
    /// Maximum attempts configured.
    pub max_attempts: usize,
    /// How long we'll wait before retrying.
    pub delay: Duration,
    /// The failure that triggered the retry.
    pub error: String,
}

/// Callback type for retry events.
pub type RetryCallback = Arc<dyn Fn(RetryInfo) + Send + Sync>;

/// Callback invoked after admission, before each call attempt (1-based).
pub type AttemptCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// How a classified failure interacts with the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retryable for idempotent operations only.
    Retryable,
    /// Retryable regardless of idempotency: the request provably had no
    /// server-side effect.
    SafelyRetryable,
    /// Never retried.
    NonRetryable,
    /// The call may have partially taken effect; surfaced immediately for
    /// caller intervention.
    Ambiguous,
}

/// Classify a provider failure kind for the retry policy.
pub fn classify(kind: FailureKind) -> RetryClass {
    match kind {
        // The provider rejected the request outright; nothing happened.
        FailureKind::Throttled => RetryClass::SafelyRetryable,
        FailureKind::ConnectionReset => RetryClass::SafelyRetryable,

        FailureKind::Transient => RetryClass::Retryable,
        FailureKind::Unavailable => RetryClass::Retryable,

        FailureKind::Ambiguous => RetryClass::Ambiguous,

        FailureKind::PermissionDenied => RetryClass::NonRetryable,
        FailureKind::NotFound => RetryClass::NonRetryable,
        FailureKind::InvalidInput => RetryClass::NonRetryable,
        FailureKind::Other => RetryClass::NonRetryable,
    }
}

/// Calculate backoff delay for a given attempt using exponential backoff
/// with jitter.
pub fn backoff_delay(attempt: usize, config: &RetryConfig) -> Duration {
    let shift = (attempt.saturating_sub(1)).min(10) as u32;
    let exp = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    let base = config.base_delay_ms.saturating_mul(exp);
    let capped = base.min(config.max_delay_ms);
    Duration::from_millis(jitter_ms(capped))
}

/// Apply ±20% jitter to a base delay.
fn jitter_ms(base_ms: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as i64;
    let jitter_pct = (nanos % 41) - 20; // -20..20
    let base = base_ms as i64;
    let jittered = base + (base * jitter_pct / 100);
    jittered.max(0) as u64
}

/// What the executor did, for envelope reporting.
#[derive(Debug, Clone, Copy)]
pub struct RetryReport {
    /// Provider calls performed.
    pub attempts: usize,
    /// Whether a retryable failure ran out the attempt budget.
    pub retries_exhausted: bool,
}

/// Execute `op` with per-attempt limiter admission and bounded retry.
///
/// `op` is called once per attempt and must perform exactly one provider
/// call. Idempotent operations retry on any retryable failure; non-idempotent
/// operations retry only on failures that provably had no server-side
/// effect. Ambiguous outcomes surface immediately.
pub async fn execute<F, Fut>(
    mut op: F,
    idempotent: bool,
    config: &RetryConfig,
    limiter: &RateLimiter,
    bucket: &BucketKey,
    ctx: &InvocationContext,
    on_attempt: &Option<AttemptCallback>,
    on_retry: &Option<RetryCallback>,
) -> (Result<ProviderResponse, Error>, RetryReport)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<ProviderResponse, crate::handler::ProviderFailure>>,
{
    let mut attempts = 0usize;
    loop {
        // Admission is per attempt; waiting out a bucket does not consume
        // the retry budget.
        let token = match limiter.acquire(bucket, ctx).await {
            Ok(token) => token,
            Err(err) => {
                return (
                    Err(err.into()),
                    RetryReport {
                        attempts,
                        retries_exhausted: false,
                    },
                )
            }
        };

        attempts += 1;
        if let Some(callback) = on_attempt {
            callback(attempts);
        }

        let outcome = op().await;
        drop(token);

        let failure = match outcome {
            Ok(response) => {
                return (
                    Ok(response),
                    RetryReport {
                        attempts,
                        retries_exhausted: false,
                    },
                )
            }
            Err(failure) => failure,
        };

        let may_retry = match classify(failure.kind) {
            RetryClass::SafelyRetryable => true,
            RetryClass::Retryable => idempotent,
            RetryClass::NonRetryable | RetryClass::Ambiguous => false,
        };
        if !may_retry {
            return (
                Err(Error::Provider(failure)),
                RetryReport {
                    attempts,
                    retries_exhausted: false,
                },
            );
        }
        if attempts >= config.max_attempts {
            return (
                Err(Error::Provider(failure)),
                RetryReport {
                    attempts,
                    retries_exhausted: true,
                },
            );
        }

        let delay = backoff_delay(attempts, config);
        if let Some(callback) = on_retry {
            callback(RetryInfo {
                attempt: attempts,
                max_attempts: config.max_attempts,
                delay,
                error: failure.to_string(),
            });
        }
        if let Err(err) = ctx.bounded_sleep(delay).await {
            return (
                Err(err),
                RetryReport {
                    attempts,
                    retries_exhausted: false,
                },
            );
        }
    }
}
