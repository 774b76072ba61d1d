//! Rate and concurrency limiting per (account, region, service) bucket.
//!
//! Each bucket combines two independent controls behind one `acquire`: a
//! FIFO semaphore bounding concurrently outstanding calls, and a token
//! bucket pacing requests per second. A [`SlotToken`] releases its
//! concurrency slot on drop, so a token can never be released twice.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::{Directory, RateLimitSettings};
use crate::types::InvocationContext;

/// Errors from `acquire`.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// The bucket stayed exhausted past the configured wait timeout.
    #[error("rate limited: bucket {bucket} exhausted after waiting {waited_ms}ms")]
    Exhausted { bucket: String, waited_ms: u64 },

    /// The invocation was cancelled while queued.
    #[error("limiter wait cancelled")]
    Cancelled,

    /// The invocation deadline expired while queued.
    #[error("limiter wait exceeded the invocation deadline")]
    DeadlineExceeded,
}

/// Accounting key: one bucket per (account, region, service) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub account: String,
    pub region: String,
    pub service: String,
}

impl BucketKey {
    /// Key for the given triple.
    pub fn new(
        account: impl Into<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.account, self.region, self.service)
    }
}

/// Single-use admission ticket for one call attempt.
///
/// Holds the bucket's concurrency permit; dropping the token releases the
/// slot exactly once. There is no manual `release`, by construction.
#[derive(Debug)]
pub struct SlotToken {
    _permit: OwnedSemaphorePermit,
    bucket: BucketKey,
}

impl SlotToken {
    /// The bucket this token was issued for.
    pub fn bucket(&self) -> &BucketKey {
        &self.bucket
    }
}

struct PaceState {
    tokens: f64,
    last_refill: Instant,
}

struct Bucket {
    semaphore: Arc<Semaphore>,
    pace: tokio::sync::Mutex<PaceState>,
    settings: RateLimitSettings,
}

impl Bucket {
    fn new(settings: RateLimitSettings) -> Self {
        let burst = settings.requests_per_second.max(1.0);
        Self {
            semaphore: Arc::new(Semaphore::new(settings.max_concurrent)),
            pace: tokio::sync::Mutex::new(PaceState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            settings,
        }
    }

    /// Refill, then either take a token now or reserve one in the future.
    ///
    /// Returns how long the caller must sleep before its reservation is
    /// valid, or `None` if the reservation would land past `deadline`.
    async fn reserve(&self, deadline: Instant) -> Option<Duration> {
        let rps = self.settings.requests_per_second;
        let burst = rps.max(1.0);
        let mut state = self.pace.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rps).min(burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Some(Duration::ZERO);
        }

        let wait = Duration::from_secs_f64((1.0 - state.tokens) / rps);
        if now + wait > deadline {
            // Leave the bucket untouched; this caller is not admitted.
            return None;
        }
        state.tokens -= 1.0;
        Some(wait)
    }
}

/// Keyed rate/concurrency limiter.
///
/// Buckets are created lazily from the per-account settings captured at
/// startup; unrelated buckets never contend.
pub struct RateLimiter {
    buckets: parking_lot::Mutex<HashMap<BucketKey, Arc<Bucket>>>,
    default_settings: RateLimitSettings,
    account_settings: HashMap<String, RateLimitSettings>,
}

impl RateLimiter {
    /// Limiter applying `default_settings` to every bucket.
    pub fn new(default_settings: RateLimitSettings) -> Self {
        Self {
            buckets: parking_lot::Mutex::new(HashMap::new()),
            default_settings,
            account_settings: HashMap::new(),
        }
    }

    /// Limiter with ceilings taken from the account directory.
    pub fn from_directory(directory: &Directory) -> Self {
        let mut limiter = Self::new(directory.rate_limits_for("").clone());
        for account in directory.accounts() {
            if let Some(settings) = &account.rate_limits {
                limiter
                    .account_settings
                    .insert(account.name.clone(), settings.clone());
            }
        }
        limiter
    }

    /// Override settings for one account's buckets.
    pub fn with_account_settings(
        mut self,
        account: impl Into<String>,
        settings: RateLimitSettings,
    ) -> Self {
        self.account_settings.insert(account.into(), settings);
        self
    }

    /// Acquire an admission token for `key`.
    ///
    /// Queues FIFO behind other waiters on the same bucket, up to the
    /// bucket's wait timeout; both the concurrency ceiling and the request
    /// rate must admit the caller before this returns.
    pub async fn acquire(
        &self,
        key: &BucketKey,
        ctx: &InvocationContext,
    ) -> Result<SlotToken, LimiterError> {
        let bucket = self.bucket(key);
        let started = Instant::now();
        let wait_deadline = started + bucket.settings.acquire_timeout();

        // The invocation deadline may be tighter than the bucket timeout.
        let (deadline, deadline_is_invocation) = match ctx.deadline {
            Some(d) if d < wait_deadline => (d, true),
            _ => (wait_deadline, false),
        };
        let timeout_error = move |waited: Duration| {
            if deadline_is_invocation {
                LimiterError::DeadlineExceeded
            } else {
                LimiterError::Exhausted {
                    bucket: key.to_string(),
                    waited_ms: waited.as_millis() as u64,
                }
            }
        };

        // Concurrency ceiling first: FIFO among waiters on this bucket.
        let permit = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return Err(LimiterError::Cancelled),
            acquired = tokio::time::timeout_at(deadline, bucket.semaphore.clone().acquire_owned()) => {
                match acquired {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(LimiterError::Exhausted {
                            bucket: key.to_string(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        })
                    }
                    Err(_) => return Err(timeout_error(started.elapsed())),
                }
            }
        };

        // Then the request-rate bucket.
        let wait = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => return Err(LimiterError::Cancelled),
            wait = bucket.reserve(deadline) => match wait {
                Some(wait) => wait,
                None => return Err(timeout_error(started.elapsed())),
            },
        };
        if !wait.is_zero() {
            tokio::select! {
                biased;
                _ = ctx.cancellation.cancelled() => return Err(LimiterError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        Ok(SlotToken {
            _permit: permit,
            bucket: key.clone(),
        })
    }

    /// Outstanding concurrency capacity for a bucket (mainly for tests and
    /// introspection).
    pub fn available_slots(&self, key: &BucketKey) -> usize {
        self.bucket(key).semaphore.available_permits()
    }

    fn bucket(&self, key: &BucketKey) -> Arc<Bucket> {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(key.clone())
            .or_insert_with(|| {
                let settings = self
                    .account_settings
                    .get(&key.account)
                    .cloned()
                    .unwrap_or_else(|| self.default_settings.clone());
                Arc::new(Bucket::new(settings))
            })
            .clone()
    }
}
