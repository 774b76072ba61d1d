//! The dispatcher: one invocation in, exactly one envelope out.
//!
//! Per invocation the dispatcher walks `Received → Validated → PolicyChecked
//! → CredentialsResolved → Admitted → Executing → Completed | Failed`. Any
//! component failure short-circuits to `Failed` with that component's error;
//! limiter tokens are drop-scoped inside the retry executor, so they are
//! released exactly once no matter where the failure happens.

use std::sync::Arc;

use crate::config::Directory;
use crate::credentials::{AwsExchange, CredentialExchange, CredentialResolver};
use crate::error::Error;
use crate::events::{DispatchEvent, DispatchHook};
use crate::handler::CallEnv;
use crate::limiter::{BucketKey, RateLimiter};
use crate::policy::{PolicyDecision, PolicyDenial, PolicyGate};
use crate::registry::{RegistryError, ToolRegistry};
use crate::retry::{self, AttemptCallback, RetryCallback, RetryConfig};
use crate::types::{Envelope, ErrorEnvelope, Invocation, ResultEnvelope};

/// Orchestrates validation, policy, credentials, admission, and execution.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    directory: Arc<Directory>,
    resolver: Arc<CredentialResolver>,
    limiter: Arc<RateLimiter>,
    gate: PolicyGate,
    retry_config: RetryConfig,
    hooks: Vec<DispatchHook>,
}

impl Dispatcher {
    /// Start building a dispatcher over a directory and tool registry.
    pub fn builder(directory: Directory, registry: ToolRegistry) -> DispatcherBuilder {
        DispatcherBuilder {
            directory,
            registry,
            exchange: None,
            retry_config: RetryConfig::default(),
            hooks: Vec::new(),
        }
    }

    /// Dispatch one invocation to completion.
    ///
    /// Always returns exactly one envelope; the invocation is never
    /// re-dispatched at this level (retries happen only inside the retry
    /// executor, at the call-attempt level).
    pub async fn dispatch(&self, invocation: Invocation) -> Envelope {
        let started = tokio::time::Instant::now();
        self.emit(&DispatchEvent::Received {
            invocation_id: invocation.id.clone(),
            tool: invocation.tool.clone(),
            arguments: invocation.arguments.clone(),
        });

        match self.run(&invocation).await {
            Ok(result) => {
                self.emit(&DispatchEvent::Completed {
                    invocation_id: invocation.id.clone(),
                    tool: invocation.tool.clone(),
                    attempts: result.attempts,
                    duration: started.elapsed(),
                });
                Envelope::Success(ResultEnvelope {
                    invocation_id: invocation.id,
                    tool: invocation.tool,
                    payload: result.payload,
                    request_id: result.request_id,
                    attempts: result.attempts,
                })
            }
            Err(failure) => {
                self.emit(&DispatchEvent::Failed {
                    invocation_id: invocation.id.clone(),
                    tool: invocation.tool.clone(),
                    kind: failure.error.kind(),
                    message: failure.error.to_string(),
                    duration: started.elapsed(),
                });
                Envelope::Error(ErrorEnvelope {
                    invocation_id: invocation.id,
                    tool: invocation.tool,
                    kind: failure.error.kind(),
                    code: failure.error.provider_code().map(str::to_string),
                    message: failure.error.to_string(),
                    request_id: failure.error.request_id().map(str::to_string),
                    attempts: failure.attempts,
                    retries_exhausted: failure.retries_exhausted,
                })
            }
        }
    }

    /// The account directory this dispatcher serves.
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// The tool registry this dispatcher serves.
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// The credential resolver (exposed for explicit invalidation).
    pub fn resolver(&self) -> &CredentialResolver {
        &self.resolver
    }

    async fn run(&self, invocation: &Invocation) -> Result<Execution, Failure> {
        invocation.context.ensure_live()?;

        // Received → Validated
        let tool = match self.registry.resolve(&invocation.tool) {
            Ok(tool) => tool,
            Err(RegistryError::UnknownTool(name)) => return Err(Error::UnknownTool(name).into()),
            Err(err) => return Err(Error::PolicyDenied(err.to_string()).into()),
        };
        match tool.validate(&invocation.arguments) {
            Ok(()) => {}
            Err(RegistryError::Violations(violations)) => {
                return Err(Error::Schema(violations).into())
            }
            Err(err) => return Err(Error::PolicyDenied(err.to_string()).into()),
        }
        self.emit(&DispatchEvent::Validated {
            invocation_id: invocation.id.clone(),
            tool: invocation.tool.clone(),
        });

        // Validated → PolicyChecked. The gate classifies; enforcement is here.
        let estimated_cost = tool.handler().estimated_cost(&invocation.arguments);
        let decision = self.gate.evaluate(&self.directory, invocation, estimated_cost);
        self.emit(&DispatchEvent::PolicyChecked {
            invocation_id: invocation.id.clone(),
            decision: decision_summary(&decision).to_string(),
        });
        match decision {
            PolicyDecision::Allow => {}
            PolicyDecision::RequireApproval {
                estimated,
                threshold,
            } => {
                return Err(Error::ApprovalRequired {
                    estimated,
                    threshold,
                }
                .into())
            }
            PolicyDecision::Deny(PolicyDenial::UnknownAccount(name)) => {
                return Err(Error::UnknownAccount(name).into())
            }
            PolicyDecision::Deny(PolicyDenial::RegionDisabled(region)) => {
                return Err(Error::RegionDisabled(region).into())
            }
        }

        // PolicyChecked → CredentialsResolved
        invocation.context.ensure_live()?;
        let account_name = invocation
            .account
            .as_deref()
            .unwrap_or_else(|| self.directory.default_account());
        let account = self
            .directory
            .account(account_name)
            .ok_or_else(|| Error::UnknownAccount(account_name.to_string()))?;
        let region = self
            .directory
            .effective_region(account, invocation.region.as_deref())
            .to_string();

        let session = self
            .resolver
            .resolve(account, &region, &invocation.context)
            .await
            .map_err(Error::from)?;
        self.emit(&DispatchEvent::CredentialsResolved {
            invocation_id: invocation.id.clone(),
            account: account_name.to_string(),
            region: region.clone(),
        });

        // CredentialsResolved → Admitted → Executing, once per attempt.
        invocation.context.ensure_live()?;
        let bucket = BucketKey::new(account_name, region.clone(), tool.service());
        let env = CallEnv {
            session,
            account: account_name.to_string(),
            region,
        };

        let on_attempt: Option<AttemptCallback> = Some({
            let hooks = self.hooks.clone();
            let invocation_id = invocation.id.clone();
            let bucket = bucket.clone();
            Arc::new(move |attempt: usize| {
                if attempt == 1 {
                    emit_to(&hooks, &DispatchEvent::Admitted {
                        invocation_id: invocation_id.clone(),
                        bucket: bucket.clone(),
                    });
                }
                emit_to(&hooks, &DispatchEvent::Executing {
                    invocation_id: invocation_id.clone(),
                    attempt,
                });
            })
        });
        let on_retry: Option<RetryCallback> = Some({
            let hooks = self.hooks.clone();
            let invocation_id = invocation.id.clone();
            Arc::new(move |info: retry::RetryInfo| {
                emit_to(&hooks, &DispatchEvent::RetryScheduled {
                    invocation_id: invocation_id.clone(),
                    attempt: info.attempt,
                    delay: info.delay,
                    error: info.error.clone(),
                });
            })
        });

        let handler = tool.handler().clone();
        let arguments = invocation.arguments.clone();
        let (result, report) = retry::execute(
            move || {
                let handler = handler.clone();
                let env = env.clone();
                let arguments = arguments.clone();
                async move { handler.call(env, &arguments).await }
            },
            tool.idempotent(),
            &self.retry_config,
            &self.limiter,
            &bucket,
            &invocation.context,
            &on_attempt,
            &on_retry,
        )
        .await;

        match result {
            Ok(response) => Ok(Execution {
                payload: response.payload,
                request_id: response.request_id,
                attempts: report.attempts,
            }),
            Err(error) => Err(Failure {
                error,
                attempts: report.attempts,
                retries_exhausted: report.retries_exhausted,
            }),
        }
    }

    fn emit(&self, event: &DispatchEvent) {
        emit_to(&self.hooks, event);
    }
}

fn emit_to(hooks: &[DispatchHook], event: &DispatchEvent) {
    for hook in hooks {
        hook(event);
    }
}

fn decision_summary(decision: &PolicyDecision) -> &'static str {
    match decision {
        PolicyDecision::Allow => "allow",
        PolicyDecision::RequireApproval { .. } => "require_approval",
        PolicyDecision::Deny(_) => "deny",
    }
}

struct Execution {
    payload: serde_json::Value,
    request_id: Option<String>,
    attempts: usize,
}

struct Failure {
    error: Error,
    attempts: usize,
    retries_exhausted: bool,
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self {
            error,
            attempts: 0,
            retries_exhausted: false,
        }
    }
}

/// Builder for [`Dispatcher`].
pub struct DispatcherBuilder {
    directory: Directory,
    registry: ToolRegistry,
    exchange: Option<Arc<dyn CredentialExchange>>,
    retry_config: RetryConfig,
    hooks: Vec<DispatchHook>,
}

impl DispatcherBuilder {
    /// Use a custom credential exchange (the default is the AWS-backed one).
    pub fn credential_exchange(mut self, exchange: Arc<dyn CredentialExchange>) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Configure retry behavior for call attempts.
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Register an event hook.
    pub fn on_event<F>(mut self, hook: F) -> Self
    where
        F: Fn(&DispatchEvent) + Send + Sync + 'static,
    {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// Assemble the dispatcher.
    pub fn build(self) -> Dispatcher {
        let exchange = self
            .exchange
            .unwrap_or_else(|| Arc::new(AwsExchange::new()));
        let limiter = RateLimiter::from_directory(&self.directory);
        Dispatcher {
            registry: Arc::new(self.registry),
            directory: Arc::new(self.directory),
            resolver: Arc::new(CredentialResolver::new(exchange)),
            limiter: Arc::new(limiter),
            gate: PolicyGate::new(),
            retry_config: self.retry_config,
            hooks: self.hooks,
        }
    }
}
