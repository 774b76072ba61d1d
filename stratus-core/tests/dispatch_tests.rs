//! End-to-end dispatcher tests over mock handlers and a mock credential
//! exchange: no network, no real provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use stratus_core::{
    AccountConfig, CallEnv, CostPolicy, CredentialError, CredentialExchange, CredentialSource,
    Directory, DispatchEvent, Dispatcher, ErrorKind, FailureKind, Invocation, OperationHandler,
    ProviderFailure, ProviderResponse, RateLimitSettings, RegionSet, RetryConfig, Secret, Session,
    ToolDefinition, ToolRegistry,
};

/// Credential exchange that counts exchanges and fabricates sessions.
struct MockExchange {
    calls: AtomicUsize,
}

impl MockExchange {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialExchange for MockExchange {
    async fn exchange(
        &self,
        _account: &AccountConfig,
        region: &str,
        _mfa_code: Option<&str>,
    ) -> Result<Session, CredentialError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Session::new(
            "AKIAMOCK",
            Secret::new("mock-secret"),
            None,
            region,
            None,
        ))
    }
}

/// Handler that pops scripted outcomes, then succeeds.
struct ScriptedHandler {
    calls: AtomicUsize,
    failures: parking_lot::Mutex<Vec<ProviderFailure>>,
    cost: Option<f64>,
}

impl ScriptedHandler {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: parking_lot::Mutex::new(Vec::new()),
            cost: None,
        })
    }

    fn failing_first(failures: Vec<ProviderFailure>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: parking_lot::Mutex::new(failures),
            cost: None,
        })
    }

    fn with_cost(cost: f64) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures: parking_lot::Mutex::new(Vec::new()),
            cost: Some(cost),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OperationHandler for ScriptedHandler {
    async fn call(
        &self,
        env: CallEnv,
        arguments: &Value,
    ) -> Result<ProviderResponse, ProviderFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.failures.lock().pop() {
            return Err(failure);
        }
        Ok(ProviderResponse::new(json!({
            "account": env.account,
            "region": env.region,
            "echo": arguments,
        }))
        .with_request_id("req-mock-1"))
    }

    fn estimated_cost(&self, _arguments: &Value) -> Option<f64> {
        self.cost
    }
}

fn regions() -> RegionSet {
    RegionSet::new(["us-east-1", "us-west-2"], "us-east-1").unwrap()
}

fn directory() -> Directory {
    Directory::builder(regions())
        .account(
            AccountConfig::new("dev", CredentialSource::Ambient)
                .with_cost_policy(CostPolicy::with_threshold(100.0))
                .with_rate_limits(RateLimitSettings {
                    requests_per_second: 5.0,
                    max_concurrent: 2,
                    acquire_timeout_ms: 5_000,
                }),
        )
        .build()
        .unwrap()
}

fn instance_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "ami_id": { "type": "string" },
            "instance_type": { "type": "string" }
        },
        "required": ["ami_id", "instance_type"],
        "additionalProperties": false
    })
}

fn registry_with(
    handler: Arc<dyn OperationHandler>,
    idempotent: bool,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry
        .register(
            ToolDefinition::builder("ec2_run_instances", "ec2", handler)
                .description("Launch an EC2 instance")
                .schema(instance_schema())
                .idempotent(idempotent)
                .build()
                .unwrap(),
        )
        .unwrap();
    registry
}

fn run_instances_invocation() -> Invocation {
    Invocation::new(
        "ec2_run_instances",
        json!({"ami_id": "ami-123", "instance_type": "t3.micro"}),
    )
    .with_account("dev")
}

fn fast_retries() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 5,
    }
}

// ===== Success Path =====

#[tokio::test]
async fn test_dispatch_success_envelope() {
    let handler = ScriptedHandler::succeeding();
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler.clone(), false))
        .credential_exchange(MockExchange::new())
        .build();

    let envelope = dispatcher.dispatch(run_instances_invocation()).await;
    assert!(envelope.is_success());

    let payload = envelope.payload().unwrap();
    assert_eq!(payload["account"], "dev");
    assert_eq!(payload["region"], "us-east-1");
    assert_eq!(handler.calls(), 1);

    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(value["status"], "success");
    assert_eq!(value["request_id"], "req-mock-1");
    assert_eq!(value["attempts"], 1);
}

#[tokio::test]
async fn test_dispatch_region_override_flows_to_handler() {
    let handler = ScriptedHandler::succeeding();
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler, false))
        .credential_exchange(MockExchange::new())
        .build();

    let envelope = dispatcher
        .dispatch(run_instances_invocation().with_region("us-west-2"))
        .await;
    assert_eq!(envelope.payload().unwrap()["region"], "us-west-2");
}

// ===== Validation =====

#[tokio::test]
async fn test_dispatch_unknown_tool() {
    let dispatcher = Dispatcher::builder(
        directory(),
        registry_with(ScriptedHandler::succeeding(), false),
    )
    .credential_exchange(MockExchange::new())
    .build();

    let envelope = dispatcher
        .dispatch(Invocation::new("no_such_tool", json!({})))
        .await;
    assert_eq!(envelope.error_kind(), Some(ErrorKind::UnknownTool));
}

#[tokio::test]
async fn test_dispatch_schema_violations_name_every_field() {
    let handler = ScriptedHandler::succeeding();
    let exchange = MockExchange::new();
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler.clone(), false))
        .credential_exchange(exchange.clone())
        .build();

    let envelope = dispatcher
        .dispatch(Invocation::new("ec2_run_instances", json!({})).with_account("dev"))
        .await;

    let error = envelope.error().unwrap();
    assert_eq!(error.kind, ErrorKind::SchemaViolation);
    assert!(error.message.contains("ami_id"));
    assert!(error.message.contains("instance_type"));
    // Validation failures never touch credentials or the provider.
    assert_eq!(exchange.calls(), 0);
    assert_eq!(handler.calls(), 0);
}

// ===== Policy =====

#[tokio::test]
async fn test_dispatch_region_disabled_before_credentials() {
    let handler = ScriptedHandler::succeeding();
    let exchange = MockExchange::new();
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler.clone(), false))
        .credential_exchange(exchange.clone())
        .build();

    let envelope = dispatcher
        .dispatch(run_instances_invocation().with_region("eu-west-1"))
        .await;

    assert_eq!(envelope.error_kind(), Some(ErrorKind::RegionDisabled));
    assert!(envelope.error().unwrap().message.contains("eu-west-1"));
    // The gate fired before any credential resolution.
    assert_eq!(exchange.calls(), 0);
    assert_eq!(handler.calls(), 0);
}

#[tokio::test]
async fn test_dispatch_unknown_account() {
    let exchange = MockExchange::new();
    let dispatcher = Dispatcher::builder(
        directory(),
        registry_with(ScriptedHandler::succeeding(), false),
    )
    .credential_exchange(exchange.clone())
    .build();

    let envelope = dispatcher
        .dispatch(run_instances_invocation().with_account("prod"))
        .await;
    assert_eq!(envelope.error_kind(), Some(ErrorKind::UnknownAccount));
    assert_eq!(exchange.calls(), 0);
}

#[tokio::test]
async fn test_dispatch_approval_required_then_approved() {
    // $150 estimate against a $100 threshold.
    let handler = ScriptedHandler::with_cost(150.0);
    let exchange = MockExchange::new();
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler.clone(), false))
        .credential_exchange(exchange.clone())
        .build();

    let envelope = dispatcher.dispatch(run_instances_invocation()).await;
    let error = envelope.error().unwrap();
    assert_eq!(error.kind, ErrorKind::ApprovalRequired);
    // Zero provider calls and zero credential exchanges happened.
    assert_eq!(handler.calls(), 0);
    assert_eq!(exchange.calls(), 0);

    // The same invocation with a valid approval token proceeds to execution.
    let invocation = run_instances_invocation();
    let token = invocation.expected_approval_token();
    let envelope = dispatcher
        .dispatch(invocation.with_approval_token(token))
        .await;
    assert!(envelope.is_success());
    assert_eq!(handler.calls(), 1);
    assert_eq!(exchange.calls(), 1);
}

// ===== Credentials =====

#[tokio::test]
async fn test_dispatch_mfa_required() {
    let directory = Directory::builder(regions())
        .account(AccountConfig::new(
            "dev",
            CredentialSource::AssumeRole {
                role_arn: "arn:aws:iam::123456789012:role/ops".to_string(),
                session_name: "stratus".to_string(),
                external_id: None,
                mfa_serial: Some("arn:aws:iam::123456789012:mfa/ops".to_string()),
            },
        ))
        .build()
        .unwrap();
    let handler = ScriptedHandler::succeeding();
    let dispatcher = Dispatcher::builder(directory, registry_with(handler.clone(), false))
        .credential_exchange(MockExchange::new())
        .build();

    let envelope = dispatcher.dispatch(run_instances_invocation()).await;
    assert_eq!(envelope.error_kind(), Some(ErrorKind::MfaRequired));
    assert_eq!(handler.calls(), 0);

    // With a code present the mock exchange succeeds.
    let envelope = dispatcher
        .dispatch(run_instances_invocation().with_mfa_code("123456"))
        .await;
    assert!(envelope.is_success());
}

#[tokio::test]
async fn test_dispatch_sessions_cached_across_invocations() {
    let exchange = MockExchange::new();
    let dispatcher = Dispatcher::builder(
        directory(),
        registry_with(ScriptedHandler::succeeding(), false),
    )
    .credential_exchange(exchange.clone())
    .build();

    dispatcher.dispatch(run_instances_invocation()).await;
    dispatcher.dispatch(run_instances_invocation()).await;
    assert_eq!(exchange.calls(), 1);

    dispatcher.resolver().invalidate("dev", "us-east-1");
    dispatcher.dispatch(run_instances_invocation()).await;
    assert_eq!(exchange.calls(), 2);
}

// ===== Retry Behavior =====

#[tokio::test]
async fn test_dispatch_retries_throttling_and_reports_attempts() {
    let handler = ScriptedHandler::failing_first(vec![
        ProviderFailure::new(FailureKind::Throttled, "throttled").with_code("ThrottlingException"),
        ProviderFailure::new(FailureKind::Throttled, "throttled").with_code("ThrottlingException"),
    ]);
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler.clone(), true))
        .credential_exchange(MockExchange::new())
        .retry_config(fast_retries())
        .build();

    let envelope = dispatcher.dispatch(run_instances_invocation()).await;
    assert!(envelope.is_success());
    assert_eq!(handler.calls(), 3);

    let value = serde_json::to_value(&envelope).unwrap();
    assert_eq!(value["attempts"], 3);
}

#[tokio::test]
async fn test_dispatch_retries_exhausted_marks_envelope() {
    let handler = ScriptedHandler::failing_first(vec![
        ProviderFailure::new(FailureKind::Throttled, "throttled").with_code("ThrottlingException"),
        ProviderFailure::new(FailureKind::Throttled, "throttled").with_code("ThrottlingException"),
        ProviderFailure::new(FailureKind::Throttled, "throttled").with_code("ThrottlingException"),
    ]);
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler.clone(), true))
        .credential_exchange(MockExchange::new())
        .retry_config(fast_retries())
        .build();

    let envelope = dispatcher.dispatch(run_instances_invocation()).await;
    let error = envelope.error().unwrap();
    assert_eq!(error.kind, ErrorKind::ProviderError);
    assert_eq!(error.code.as_deref(), Some("ThrottlingException"));
    assert_eq!(error.attempts, 3);
    assert!(error.retries_exhausted);
    assert_eq!(handler.calls(), 3);
}

#[tokio::test]
async fn test_dispatch_non_idempotent_ambiguous_not_retried() {
    let handler = ScriptedHandler::failing_first(vec![ProviderFailure::new(
        FailureKind::Ambiguous,
        "timeout after request was sent",
    )
    .with_request_id("req-ambig")]);
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler.clone(), false))
        .credential_exchange(MockExchange::new())
        .retry_config(fast_retries())
        .build();

    let envelope = dispatcher.dispatch(run_instances_invocation()).await;
    let error = envelope.error().unwrap();
    assert_eq!(error.kind, ErrorKind::ProviderError);
    assert_eq!(error.attempts, 1);
    assert!(!error.retries_exhausted);
    assert_eq!(error.request_id.as_deref(), Some("req-ambig"));
    assert_eq!(handler.calls(), 1);
}

#[tokio::test]
async fn test_dispatch_permission_denied_passthrough() {
    let handler = ScriptedHandler::failing_first(vec![ProviderFailure::new(
        FailureKind::PermissionDenied,
        "not authorized to perform ec2:RunInstances",
    )
    .with_code("UnauthorizedOperation")
    .with_request_id("req-denied")]);
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler.clone(), true))
        .credential_exchange(MockExchange::new())
        .retry_config(fast_retries())
        .build();

    let envelope = dispatcher.dispatch(run_instances_invocation()).await;
    let error = envelope.error().unwrap();
    assert_eq!(error.kind, ErrorKind::ProviderError);
    assert_eq!(error.code.as_deref(), Some("UnauthorizedOperation"));
    assert_eq!(error.request_id.as_deref(), Some("req-denied"));
    assert_eq!(error.attempts, 1);
    assert_eq!(handler.calls(), 1);
}

// ===== Cancellation =====

#[tokio::test]
async fn test_dispatch_cancelled_before_start() {
    let handler = ScriptedHandler::succeeding();
    let exchange = MockExchange::new();
    let dispatcher = Dispatcher::builder(directory(), registry_with(handler.clone(), false))
        .credential_exchange(exchange.clone())
        .build();

    let invocation = run_instances_invocation();
    invocation.context.cancellation.cancel();
    let envelope = dispatcher.dispatch(invocation).await;

    assert_eq!(envelope.error_kind(), Some(ErrorKind::Cancelled));
    assert_eq!(exchange.calls(), 0);
    assert_eq!(handler.calls(), 0);
}

// ===== Concurrency =====

#[tokio::test]
async fn test_dispatch_concurrent_invocations_share_one_exchange() {
    let exchange = MockExchange::new();
    let dispatcher = Arc::new(
        Dispatcher::builder(
            directory(),
            registry_with(ScriptedHandler::succeeding(), true),
        )
        .credential_exchange(exchange.clone())
        .build(),
    );

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(run_instances_invocation()).await })
        })
        .collect();
    let envelopes = futures::future::join_all(tasks).await;

    for envelope in envelopes {
        assert!(envelope.unwrap().is_success());
    }
    // Both invocations raced for the same (account, region); one exchange.
    assert_eq!(exchange.calls(), 1);
}

// ===== Events =====

#[tokio::test]
async fn test_dispatch_event_trail_on_success() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let dispatcher = Dispatcher::builder(
        directory(),
        registry_with(ScriptedHandler::succeeding(), false),
    )
    .credential_exchange(MockExchange::new())
    .on_event(move |event| {
        seen_clone.lock().push(event_name(event));
    })
    .build();

    dispatcher.dispatch(run_instances_invocation()).await;

    let names = seen.lock().clone();
    assert_eq!(
        names,
        vec![
            "received",
            "validated",
            "policy_checked",
            "credentials_resolved",
            "admitted",
            "executing",
            "completed",
        ]
    );
}

#[tokio::test]
async fn test_dispatch_event_trail_on_schema_failure() {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let dispatcher = Dispatcher::builder(
        directory(),
        registry_with(ScriptedHandler::succeeding(), false),
    )
    .credential_exchange(MockExchange::new())
    .on_event(move |event| {
        seen_clone.lock().push(event_name(event));
    })
    .build();

    dispatcher
        .dispatch(Invocation::new("ec2_run_instances", json!({})).with_account("dev"))
        .await;

    let names = seen.lock().clone();
    assert_eq!(names, vec!["received", "failed"]);
}

fn event_name(event: &DispatchEvent) -> &'static str {
    match event {
        DispatchEvent::Received { .. } => "received",
        DispatchEvent::Validated { .. } => "validated",
        DispatchEvent::PolicyChecked { .. } => "policy_checked",
        DispatchEvent::CredentialsResolved { .. } => "credentials_resolved",
        DispatchEvent::Admitted { .. } => "admitted",
        DispatchEvent::Executing { .. } => "executing",
        DispatchEvent::RetryScheduled { .. } => "retry_scheduled",
        DispatchEvent::Completed { .. } => "completed",
        DispatchEvent::Failed { .. } => "failed",
    }
}
