//! The provider SDK boundary: operation handlers and their outcomes.
//!
//! A handler performs exactly one underlying provider call per invocation
//! attempt. Handlers return either a [`ProviderResponse`] (payload plus
//! request id) or a [`ProviderFailure`] classified well enough for the retry
//! executor to act on.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::credentials::Session;

/// Classification of a provider failure, as observed by the handler.
///
/// The retry executor maps this onto its retry policy; handlers only report
/// what happened, never decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The provider rejected the request for rate reasons (throttling,
    /// request-limit-exceeded). No effect occurred.
    Throttled,

    /// Transient transport trouble after the request may have been sent.
    Transient,

    /// Provider-side 5xx-class trouble.
    Unavailable,

    /// The connection failed before the request was written. No server-side
    /// effect is possible, so even non-idempotent calls may retry.
    ConnectionReset,

    /// The call may or may not have taken effect (timeout after send on a
    /// mutative operation, and the like). Never retried automatically.
    Ambiguous,

    /// The caller lacks permission.
    PermissionDenied,

    /// The referenced resource does not exist.
    NotFound,

    /// The provider rejected the input as invalid.
    InvalidInput,

    /// Anything else.
    Other,
}

/// Successful provider call outcome.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Structured payload returned by the provider.
    pub payload: Value,

    /// Provider request id for diagnosis.
    pub request_id: Option<String>,
}

impl ProviderResponse {
    /// Response with a payload and no request id.
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            request_id: None,
        }
    }

    /// Attach the provider request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Classified provider call failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ProviderFailure {
    /// Failure classification.
    pub kind: FailureKind,

    /// Provider error code (e.g. `ThrottlingException`).
    pub code: Option<String>,

    /// Human-readable message.
    pub message: String,

    /// Provider request id, when one was issued.
    pub request_id: Option<String>,
}

impl ProviderFailure {
    /// Failure of the given kind with a message.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            request_id: None,
        }
    }

    /// Attach the provider error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach the provider request id.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Execution environment handed to a handler for one call attempt.
#[derive(Debug, Clone)]
pub struct CallEnv {
    /// Resolved credentials for this attempt.
    pub session: Session,

    /// Logical account the call acts as.
    pub account: String,

    /// Effective region for the call.
    pub region: String,
}

/// Object-safe operation handler, stored in the tool registry.
///
/// Implement [`Operation`] for typed input and convert with
/// [`box_operation`]; implement this directly only for handlers that work on
/// raw JSON.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Perform one provider call with already-validated arguments.
    async fn call(&self, env: CallEnv, arguments: &Value)
        -> Result<ProviderResponse, ProviderFailure>;

    /// Estimated cost in USD for the invocation, for the policy gate.
    ///
    /// `None` means "no cost estimate"; the gate then never requires
    /// approval on cost grounds.
    fn estimated_cost(&self, _arguments: &Value) -> Option<f64> {
        None
    }
}

/// Typed operation with schema derived from its input type.
///
/// The registry generates the parameter schema from `Input`'s `JsonSchema`
/// derive, so handlers never describe their arguments twice.
pub trait Operation: Send + Sync {
    /// Typed input. Must implement `Deserialize` and `JsonSchema`.
    type Input: DeserializeOwned + JsonSchema + Send;

    /// Perform one provider call.
    fn execute(
        &self,
        input: Self::Input,
        env: CallEnv,
    ) -> impl std::future::Future<Output = Result<ProviderResponse, ProviderFailure>> + Send;

    /// Estimated cost in USD for the invocation.
    fn estimated_cost(&self, _input: &Self::Input) -> Option<f64> {
        None
    }
}

/// Convert a typed [`Operation`] into a boxed [`OperationHandler`].
pub fn box_operation<O: Operation + 'static>(operation: O) -> Arc<dyn OperationHandler> {
    Arc::new(OperationWrapper(operation))
}

struct OperationWrapper<O>(O);

impl<O: Operation + 'static> OperationWrapper<O> {
    fn parse(&self, arguments: &Value) -> Result<O::Input, ProviderFailure> {
        serde_json::from_value(arguments.clone()).map_err(|err| {
            ProviderFailure::new(
                FailureKind::InvalidInput,
                format!("failed to deserialize arguments: {}", err),
            )
        })
    }
}

#[async_trait]
impl<O: Operation + 'static> OperationHandler for OperationWrapper<O> {
    async fn call(
        &self,
        env: CallEnv,
        arguments: &Value,
    ) -> Result<ProviderResponse, ProviderFailure> {
        let input = self.parse(arguments)?;
        self.0.execute(input, env).await
    }

    fn estimated_cost(&self, arguments: &Value) -> Option<f64> {
        let input = self.parse(arguments).ok()?;
        self.0.estimated_cost(&input)
    }
}
