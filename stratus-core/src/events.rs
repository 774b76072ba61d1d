//! Events emitted during dispatch.
//!
//! Every state transition of an invocation produces one event, which is the
//! audit trail for the system: hooks can ship these to a log file, a metrics
//! pipeline, or a terminal without the core knowing.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::limiter::BucketKey;
use crate::types::ErrorKind;

/// Events emitted while an invocation moves through the dispatcher.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// An invocation entered the dispatcher.
    Received {
        /// Invocation id.
        invocation_id: String,
        /// Requested tool name.
        tool: String,
        /// Argument mapping as received.
        arguments: Value,
    },

    /// Arguments passed schema validation.
    Validated {
        invocation_id: String,
        tool: String,
    },

    /// The policy gate classified the invocation.
    PolicyChecked {
        invocation_id: String,
        /// Classification summary ("allow", "require_approval", "deny").
        decision: String,
    },

    /// Credentials were resolved for the effective account/region.
    CredentialsResolved {
        invocation_id: String,
        account: String,
        region: String,
    },

    /// A limiter token was acquired for the first attempt.
    Admitted {
        invocation_id: String,
        bucket: BucketKey,
    },

    /// A call attempt is starting (fires once per attempt).
    Executing {
        invocation_id: String,
        /// 1-based attempt number.
        attempt: usize,
    },

    /// A retry was scheduled after a retryable failure.
    RetryScheduled {
        invocation_id: String,
        /// The attempt that just failed (1-based).
        attempt: usize,
        /// Backoff before the next attempt.
        delay: Duration,
        /// The failure that triggered the retry.
        error: String,
    },

    /// The invocation completed with a success envelope.
    Completed {
        invocation_id: String,
        tool: String,
        /// Provider calls performed.
        attempts: usize,
        duration: Duration,
    },

    /// The invocation failed with an error envelope.
    Failed {
        invocation_id: String,
        tool: String,
        kind: ErrorKind,
        message: String,
        duration: Duration,
    },
}

impl DispatchEvent {
    /// The invocation this event belongs to.
    pub fn invocation_id(&self) -> &str {
        match self {
            DispatchEvent::Received { invocation_id, .. }
            | DispatchEvent::Validated { invocation_id, .. }
            | DispatchEvent::PolicyChecked { invocation_id, .. }
            | DispatchEvent::CredentialsResolved { invocation_id, .. }
            | DispatchEvent::Admitted { invocation_id, .. }
            | DispatchEvent::Executing { invocation_id, .. }
            | DispatchEvent::RetryScheduled { invocation_id, .. }
            | DispatchEvent::Completed { invocation_id, .. }
            | DispatchEvent::Failed { invocation_id, .. } => invocation_id,
        }
    }
}

/// Callback type for dispatch events.
pub type DispatchHook = Arc<dyn Fn(&DispatchEvent) + Send + Sync>;
