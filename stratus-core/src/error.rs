//! Top-level error type for the dispatch core.
//!
//! Components fail fast with their own typed errors; this module flattens
//! them into the taxonomy callers see on error envelopes.

use thiserror::Error;

use crate::credentials::CredentialError;
use crate::handler::ProviderFailure;
use crate::limiter::LimiterError;
use crate::registry::SchemaViolation;
use crate::types::ErrorKind;

/// Terminal dispatch error.
///
/// Retryable provider failures never appear here directly: the retry
/// executor owns them, and only the last classified failure surfaces as
/// [`Error::Provider`] once retries are spent or retrying is not allowed.
#[derive(Debug, Error)]
pub enum Error {
    /// Arguments violated the tool's schema; every violation is listed.
    #[error("schema validation failed: {}", format_violation_fields(.0))]
    Schema(Vec<SchemaViolation>),

    /// No tool registered under the requested name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The invocation referenced an account the directory does not know.
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// The target region is outside the enabled region set.
    #[error("region disabled: {0}")]
    RegionDisabled(String),

    /// The account requires an MFA code and none was supplied.
    #[error("account '{0}' requires an MFA code")]
    MfaRequired(String),

    /// The identity provider rejected the MFA code.
    #[error("MFA code rejected: {0}")]
    MfaRejected(String),

    /// The credential exchange failed.
    #[error("credential exchange failed: {0}")]
    CredentialExchange(String),

    /// A limiter bucket stayed exhausted past its wait timeout.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The policy gate denied the invocation.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Estimated cost exceeds the threshold and no approval token covers
    /// this invocation.
    #[error("approval required: estimated cost ${estimated:.2} exceeds threshold ${threshold:.2}")]
    ApprovalRequired { estimated: f64, threshold: f64 },

    /// Classified, non-retryable provider failure (or the last failure once
    /// retries were exhausted).
    #[error("provider error: {0}")]
    Provider(ProviderFailure),

    /// The invocation was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The invocation deadline expired.
    #[error("timed out")]
    Timeout,
}

fn format_violation_fields(violations: &[SchemaViolation]) -> String {
    let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
    format!("{} violation(s) on [{}]", violations.len(), fields.join(", "))
}

impl Error {
    /// The envelope kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Schema(_) => ErrorKind::SchemaViolation,
            Error::UnknownTool(_) => ErrorKind::UnknownTool,
            Error::UnknownAccount(_) => ErrorKind::UnknownAccount,
            Error::RegionDisabled(_) => ErrorKind::RegionDisabled,
            Error::MfaRequired(_) => ErrorKind::MfaRequired,
            Error::MfaRejected(_) => ErrorKind::MfaRejected,
            Error::CredentialExchange(_) => ErrorKind::CredentialExchangeFailed,
            Error::RateLimited(_) => ErrorKind::RateLimited,
            Error::PolicyDenied(_) => ErrorKind::PolicyDenied,
            Error::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            Error::Provider(_) => ErrorKind::ProviderError,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Timeout => ErrorKind::Timeout,
        }
    }

    /// The provider error code, when the failure came from the provider.
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Error::Provider(failure) => failure.code.as_deref(),
            _ => None,
        }
    }

    /// The provider request id, when one was issued before the failure.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Error::Provider(failure) => failure.request_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether this is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Whether this failure came from the provider call itself.
    pub fn is_provider(&self) -> bool {
        matches!(self, Error::Provider(_))
    }
}

impl From<CredentialError> for Error {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::MfaRequired(account) => Error::MfaRequired(account),
            CredentialError::MfaRejected(message) => Error::MfaRejected(message),
            CredentialError::Exchange(message) => Error::CredentialExchange(message),
            CredentialError::Cancelled => Error::Cancelled,
        }
    }
}

impl From<LimiterError> for Error {
    fn from(err: LimiterError) -> Self {
        match err {
            LimiterError::Exhausted { .. } => Error::RateLimited(err.to_string()),
            LimiterError::Cancelled => Error::Cancelled,
            LimiterError::DeadlineExceeded => Error::Timeout,
        }
    }
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, Error>;
