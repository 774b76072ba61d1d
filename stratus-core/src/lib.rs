//! # Stratus
//!
//! A dispatch core for exposing cloud management APIs as discrete, named,
//! schema-validated tools callable by an external agent.
//!
//! The interesting part is not any individual cloud operation — each is a
//! thin call-through to the provider — but the layer around it: resolving
//! which credentials/account/region a call runs as, enforcing cost and
//! approval policy, bounding call volume per (account, region, service),
//! retrying transient failures with backoff, and normalizing every outcome
//! into exactly one result or error envelope, all while serving many
//! concurrent invocations.
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratus_core::{
//!     AccountConfig, CredentialSource, Directory, Dispatcher, Invocation,
//!     RegionSet, ToolDefinition, ToolRegistry,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let regions = RegionSet::new(["us-east-1", "us-west-2"], "us-east-1")?;
//!     let directory = Directory::builder(regions)
//!         .account(AccountConfig::new("dev", CredentialSource::Ambient))
//!         .build()?;
//!
//!     let mut registry = ToolRegistry::new();
//!     registry.register(
//!         ToolDefinition::builder("sts_get_caller_identity", "sts", my_handler)
//!             .description("Who am I?")
//!             .idempotent(true)
//!             .build()?,
//!     )?;
//!
//!     let dispatcher = Dispatcher::builder(directory, registry).build();
//!     let envelope = dispatcher
//!         .dispatch(Invocation::new("sts_get_caller_identity", serde_json::json!({})))
//!         .await;
//!     println!("{}", serde_json::to_string_pretty(&envelope)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Dispatch pipeline
//!
//! An invocation moves through a fixed state machine, one component per
//! transition:
//!
//! 1. **Registry** — resolve the tool, validate arguments against its schema
//!    (every violation reported, not just the first).
//! 2. **Policy gate** — deny unknown accounts and disabled regions; require
//!    an approval token when the estimated cost exceeds the account
//!    threshold.
//! 3. **Credential resolver** — turn the account reference into a live,
//!    time-bounded session (static keys, assumed role, SSO profile, or
//!    ambient chain), cached per (account, region) with single-flight
//!    deduplication.
//! 4. **Limiter** — admit the call against the (account, region, service)
//!    bucket: a concurrency ceiling plus a paced request rate.
//! 5. **Retry executor** — run the handler, classify failures, and retry
//!    with exponential backoff where the idempotency policy allows.
//!
//! Every dispatch produces exactly one [`Envelope`].

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handler;
pub mod limiter;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod types;

pub use config::{
    AccountConfig, ConfigError, CostPolicy, CredentialSource, Directory, DirectoryBuilder,
    RateLimitSettings, RegionSet, Secret,
};
pub use credentials::{
    AwsExchange, CredentialError, CredentialExchange, CredentialResolver, Session,
    EXPIRY_SKEW_SECONDS,
};
pub use dispatch::{Dispatcher, DispatcherBuilder};
pub use error::{Error, Result};
pub use events::{DispatchEvent, DispatchHook};
pub use handler::{
    box_operation, CallEnv, FailureKind, Operation, OperationHandler, ProviderFailure,
    ProviderResponse,
};
pub use limiter::{BucketKey, LimiterError, RateLimiter, SlotToken};
pub use policy::{PolicyDecision, PolicyDenial, PolicyGate};
pub use registry::{
    RegistryError, SchemaViolation, ToolDefinition, ToolDefinitionBuilder, ToolRegistry,
};
pub use retry::{RetryCallback, RetryConfig, RetryInfo};
pub use types::{
    approval_token_for, Envelope, ErrorEnvelope, ErrorKind, Invocation, InvocationContext,
    ResultEnvelope,
};
