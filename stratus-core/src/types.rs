//! Invocation and envelope types shared across the dispatch core.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;

/// Kind tag on error envelopes, mirroring the dispatch error taxonomy.
///
/// `RetryableProviderError` never appears here: retryable failures are
/// internal to the retry executor and surface as `ProviderError` with
/// `retries_exhausted` set once the budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaViolation,
    UnknownTool,
    UnknownAccount,
    RegionDisabled,
    MfaRequired,
    MfaRejected,
    CredentialExchangeFailed,
    RateLimited,
    PolicyDenied,
    ApprovalRequired,
    ProviderError,
    Cancelled,
    Timeout,
}

/// Per-invocation call context: approval/MFA material plus cancellation.
///
/// Cloning shares the underlying cancellation token, so a clone handed to a
/// component observes the same cancel signal as the original.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Approval token covering this exact invocation (see
    /// [`approval_token_for`]).
    pub approval_token: Option<String>,

    /// One-time MFA code for accounts whose credential source requires one.
    pub mfa_code: Option<String>,

    /// Cooperative cancellation signal.
    pub cancellation: CancellationToken,

    /// Hard deadline for the whole invocation.
    pub deadline: Option<tokio::time::Instant>,
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self {
            approval_token: None,
            mfa_code: None,
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }
}

impl InvocationContext {
    /// Whether the invocation has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Whether the deadline has already passed.
    pub fn deadline_expired(&self) -> bool {
        self.deadline
            .map(|d| tokio::time::Instant::now() >= d)
            .unwrap_or(false)
    }

    /// Fail fast if the invocation is cancelled or past its deadline.
    ///
    /// Checked between dispatch states so a dead invocation never enters
    /// another blocking wait.
    pub fn ensure_live(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.deadline_expired() {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Time remaining until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(tokio::time::Instant::now()))
    }

    /// Sleep for `delay`, waking early on cancellation or deadline expiry.
    pub async fn bounded_sleep(&self, delay: Duration) -> Result<(), Error> {
        let capped = match self.remaining() {
            Some(remaining) if remaining < delay => remaining,
            _ => delay,
        };
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(capped) => {}
        }
        if capped < delay {
            return Err(Error::Timeout);
        }
        Ok(())
    }
}

/// One request to execute a named tool with arguments.
///
/// Transient: exists only for the duration of a single dispatch.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Unique id for correlating events and envelopes.
    pub id: String,

    /// Registered tool name.
    pub tool: String,

    /// Argument mapping, validated against the tool's schema.
    pub arguments: Value,

    /// Target account override; directory default when absent.
    pub account: Option<String>,

    /// Target region override; account/directory default when absent.
    pub region: Option<String>,

    /// Call context (approval token, MFA code, cancellation, deadline).
    pub context: InvocationContext,
}

impl Invocation {
    /// Create an invocation for the given tool and arguments.
    pub fn new(tool: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool: tool.into(),
            arguments,
            account: None,
            region: None,
            context: InvocationContext::default(),
        }
    }

    /// Target a specific account.
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Target a specific region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Attach an approval token.
    pub fn with_approval_token(mut self, token: impl Into<String>) -> Self {
        self.context.approval_token = Some(token.into());
        self
    }

    /// Attach a one-time MFA code.
    pub fn with_mfa_code(mut self, code: impl Into<String>) -> Self {
        self.context.mfa_code = Some(code.into());
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.context.cancellation = token;
        self
    }

    /// Fail the invocation if it has not completed within `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.context.deadline = Some(tokio::time::Instant::now() + timeout);
        self
    }

    /// The approval token that would authorize this exact invocation.
    pub fn expected_approval_token(&self) -> String {
        approval_token_for(&self.tool, &self.arguments)
    }
}

/// Compute the approval token covering one (tool, arguments) pair.
///
/// SHA-256 over canonical JSON (object keys sorted), so an approval is bound
/// to the exact invocation the approver saw and nothing else.
pub fn approval_token_for(tool: &str, arguments: &Value) -> String {
    use sha2::{Digest, Sha256};

    let canonical = serde_json::json!({
        "tool": tool,
        "arguments": canonicalize_json(arguments),
    });
    let json = serde_json::to_string(&canonical).unwrap_or_default();
    let hash = Sha256::digest(json.as_bytes());
    format!("{:x}", hash)
}

/// Convert a JSON value to canonical form with sorted keys.
fn canonicalize_json(value: &Value) -> Value {
    use std::collections::BTreeMap;

    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize_json(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

/// Successful dispatch outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ResultEnvelope {
    /// Invocation id this envelope answers.
    pub invocation_id: String,

    /// Tool that produced the payload.
    pub tool: String,

    /// Provider payload, passed through as structured JSON.
    pub payload: Value,

    /// Provider request id, when the provider returned one.
    pub request_id: Option<String>,

    /// Provider calls performed (1 unless retries occurred).
    pub attempts: usize,
}

/// Failed dispatch outcome.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// Invocation id this envelope answers.
    pub invocation_id: String,

    /// Tool that was requested.
    pub tool: String,

    /// Error taxonomy kind.
    pub kind: ErrorKind,

    /// Provider error code, when the failure came from the provider.
    pub code: Option<String>,

    /// Human-readable message.
    pub message: String,

    /// Provider request id, when one was issued before the failure.
    pub request_id: Option<String>,

    /// Provider calls performed before failing.
    pub attempts: usize,

    /// Whether the retry budget was exhausted on a retryable failure.
    pub retries_exhausted: bool,
}

/// The one envelope every dispatch produces.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Envelope {
    /// The operation executed and returned a payload.
    Success(ResultEnvelope),

    /// The invocation failed at some dispatch state.
    Error(ErrorEnvelope),
}

impl Envelope {
    /// Whether this is a success envelope.
    pub fn is_success(&self) -> bool {
        matches!(self, Envelope::Success(_))
    }

    /// The success payload, if any.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Envelope::Success(result) => Some(&result.payload),
            Envelope::Error(_) => None,
        }
    }

    /// The error kind, if this is an error envelope.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Envelope::Success(_) => None,
            Envelope::Error(err) => Some(err.kind),
        }
    }

    /// The error envelope, if any.
    pub fn error(&self) -> Option<&ErrorEnvelope> {
        match self {
            Envelope::Success(_) => None,
            Envelope::Error(err) => Some(err),
        }
    }
}
