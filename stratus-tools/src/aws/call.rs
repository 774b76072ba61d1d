//! Generic signed AWS API call handler.
//!
//! One [`ApiCallOperation`] is bound to a single (service, operation) pair
//! and performs exactly one SigV4-signed JSON request per call attempt,
//! against the region and credentials the dispatcher resolved. Failures are
//! classified from the HTTP status and the provider error body so the retry
//! executor can act on them.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
use aws_sigv4::sign::v4;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderValue, Method};
use reqwest::Client;
use serde_json::Value;

use stratus_core::{
    CallEnv, FailureKind, OperationHandler, ProviderFailure, ProviderResponse, ToolDefinition,
    ToolDefinitionBuilder,
};

use super::costs;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// One provider operation as a signed JSON API call.
///
/// The operation name follows AWS conventions (PascalCase, e.g.
/// `DescribeInstances`); the service name is the lowercase endpoint id
/// (`ec2`, `sts`, `dynamodb`). Arguments validated by the registry become
/// the request body verbatim.
pub struct ApiCallOperation {
    service: String,
    operation: String,
    client: Client,
    target_prefix: Option<String>,
    endpoint_override: Option<String>,
    cost: Option<f64>,
}

impl ApiCallOperation {
    /// Handler for `operation` on `service`.
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            client: Client::builder()
                .timeout(DEFAULT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            target_prefix: None,
            endpoint_override: None,
            cost: None,
        }
    }

    /// Override the `x-amz-target` prefix for services outside the builtin
    /// mapping, or for a different API version.
    pub fn with_target_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.target_prefix = Some(prefix.into());
        self
    }

    /// Send requests to a fixed endpoint instead of the regional default
    /// (VPC endpoints, local stacks, tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into());
        self
    }

    /// Attach a fixed cost estimate, overriding the static table.
    pub fn with_estimated_cost(mut self, cost_usd: f64) -> Self {
        self.cost = Some(cost_usd);
        self
    }

    /// Use a custom HTTP client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Whether this operation can mutate provider state, by prefix.
    pub fn is_mutative(&self) -> bool {
        is_mutative_operation(&self.operation)
    }

    /// Start a tool definition for this operation.
    ///
    /// Idempotency defaults to the conservative hint from the mutative
    /// prefix table; override it on the builder for operations known to be
    /// safe.
    pub fn into_tool(self, name: impl Into<String>) -> ToolDefinitionBuilder {
        let idempotent = !self.is_mutative();
        let service = self.service.clone();
        ToolDefinition::builder(name, service, std::sync::Arc::new(self)).idempotent(idempotent)
    }

    fn endpoint(&self, region: &str) -> String {
        if let Some(endpoint) = &self.endpoint_override {
            return endpoint.clone();
        }
        get_endpoint(&self.service, region)
    }

    fn target_header(&self) -> String {
        let prefix = self
            .target_prefix
            .clone()
            .or_else(|| default_service_targets().get(self.service.as_str()).map(|s| s.to_string()))
            .unwrap_or_else(|| self.service.clone());
        format!("{}.{}", prefix, self.operation)
    }

    async fn build_signed_request(
        &self,
        env: &CallEnv,
        parameters: &Value,
    ) -> Result<reqwest::Request, ProviderFailure> {
        let endpoint = self.endpoint(&env.region);
        let body = serde_json::to_string(parameters).map_err(|err| {
            ProviderFailure::new(
                FailureKind::InvalidInput,
                format!("failed to serialize parameters: {}", err),
            )
        })?;

        let url = url::Url::parse(&endpoint).map_err(|err| {
            ProviderFailure::new(
                FailureKind::Other,
                format!("invalid endpoint URL {}: {}", endpoint, err),
            )
        })?;
        let host = url.host_str().ok_or_else(|| {
            ProviderFailure::new(FailureKind::Other, format!("endpoint {} has no host", endpoint))
        })?;

        let content_type = "application/x-amz-json-1.1; charset=utf-8";
        let mut builder = http::Request::builder()
            .method(Method::POST)
            .uri(&endpoint)
            .header(HOST, host)
            .header(CONTENT_TYPE, HeaderValue::from_static(content_type))
            .header(
                "x-amz-target",
                HeaderValue::from_str(&self.target_header()).map_err(|err| {
                    ProviderFailure::new(FailureKind::Other, format!("bad target header: {}", err))
                })?,
            );

        if let Some(token) = env.session.session_token() {
            builder = builder.header(
                "x-amz-security-token",
                HeaderValue::from_str(token).map_err(|err| {
                    ProviderFailure::new(FailureKind::Other, format!("bad session token: {}", err))
                })?,
            );
        }

        let http_request = builder.body(body.clone()).map_err(|err| {
            ProviderFailure::new(FailureKind::Other, format!("failed to build request: {}", err))
        })?;

        let credentials = Credentials::new(
            env.session.access_key_id.clone(),
            env.session.secret_access_key().to_string(),
            env.session.session_token().map(str::to_string),
            None,
            "stratus",
        );

        let signing_settings = SigningSettings::default();
        let identity = credentials.into();
        let signing_params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&env.region)
            .name(&self.service)
            .time(SystemTime::now())
            .settings(signing_settings)
            .build()
            .map_err(|err| {
                ProviderFailure::new(
                    FailureKind::Other,
                    format!("failed to build signing params: {}", err),
                )
            })?;

        let signable_request = SignableRequest::new(
            http_request.method().as_str(),
            http_request.uri().to_string(),
            http_request
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str(), v.to_str().unwrap_or(""))),
            SignableBody::Bytes(body.as_bytes()),
        )
        .map_err(|err| {
            ProviderFailure::new(
                FailureKind::Other,
                format!("failed to create signable request: {}", err),
            )
        })?;

        let (signing_instructions, _signature) = sign(signable_request, &signing_params.into())
            .map_err(|err| {
                ProviderFailure::new(FailureKind::Other, format!("failed to sign request: {}", err))
            })?
            .into_parts();

        let mut request_builder = self.client.post(&endpoint).body(body);
        for (name, value) in http_request.headers() {
            if let Ok(value) = value.to_str() {
                request_builder = request_builder.header(name.as_str(), value);
            }
        }
        for (name, value) in signing_instructions.headers() {
            let name: &str = name;
            let value = std::str::from_utf8(value.as_bytes()).unwrap_or("");
            request_builder = request_builder.header(name, value);
        }

        request_builder.build().map_err(|err| {
            ProviderFailure::new(
                FailureKind::Other,
                format!("failed to build final request: {}", err),
            )
        })
    }

    fn classify_transport_error(&self, err: &reqwest::Error) -> ProviderFailure {
        if err.is_connect() {
            // Connection never established; nothing reached the provider.
            return ProviderFailure::new(
                FailureKind::ConnectionReset,
                format!("connection failed before send: {}", err),
            );
        }
        if self.is_mutative() {
            // The request may have been sent; the effect is unknown.
            ProviderFailure::new(
                FailureKind::Ambiguous,
                format!(
                    "transport failure after {}.{} may have taken effect: {}",
                    self.service, self.operation, err
                ),
            )
        } else {
            ProviderFailure::new(FailureKind::Transient, format!("transport failure: {}", err))
        }
    }
}

#[async_trait]
impl OperationHandler for ApiCallOperation {
    async fn call(
        &self,
        env: CallEnv,
        arguments: &Value,
    ) -> Result<ProviderResponse, ProviderFailure> {
        let request = self.build_signed_request(&env, arguments).await?;

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|err| self.classify_transport_error(&err))?;

        let status = response.status();
        let request_id = response
            .headers()
            .get("x-amzn-requestid")
            .or_else(|| response.headers().get("x-amz-request-id"))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let body = response
            .text()
            .await
            .map_err(|err| self.classify_transport_error(&err))?;

        if !status.is_success() {
            let mut failure = parse_failure(status, &body, self.is_mutative());
            failure.request_id = failure.request_id.or(request_id);
            return Err(failure);
        }

        let payload: Value = serde_json::from_str(&body)
            .unwrap_or_else(|_| serde_json::json!({ "raw_response": body }));

        let mut response = ProviderResponse::new(payload);
        if let Some(request_id) = request_id {
            response = response.with_request_id(request_id);
        }
        Ok(response)
    }

    fn estimated_cost(&self, arguments: &Value) -> Option<f64> {
        self.cost
            .or_else(|| costs::estimate_cost(&self.service, &self.operation, arguments))
    }
}

/// Classify a non-2xx provider response.
fn parse_failure(status: reqwest::StatusCode, body: &str, mutative: bool) -> ProviderFailure {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| {
            v.get("__type")
                .or_else(|| v.get("Error").and_then(|e| e.get("Code")))
        })
        .and_then(Value::as_str)
        // "namespace#ErrorCode" shapes appear in __type
        .map(|code| code.rsplit('#').next().unwrap_or(code).to_string());
    let message = parsed
        .as_ref()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("Message"))
                .or_else(|| v.get("Error").and_then(|e| e.get("Message")))
        })
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());

    let kind = classify_failure(status, code.as_deref(), mutative);
    let mut failure = ProviderFailure::new(kind, message);
    if let Some(code) = code {
        failure = failure.with_code(code);
    }
    failure
}

fn classify_failure(
    status: reqwest::StatusCode,
    code: Option<&str>,
    mutative: bool,
) -> FailureKind {
    let code_lower = code.map(str::to_lowercase).unwrap_or_default();

    if status.as_u16() == 429
        || code_lower.contains("throttl")
        || code_lower.contains("toomanyrequests")
        || code_lower.contains("requestlimitexceeded")
    {
        return FailureKind::Throttled;
    }
    if status.as_u16() == 401
        || status.as_u16() == 403
        || code_lower.contains("accessdenied")
        || code_lower.contains("unauthorized")
        || code_lower.contains("expiredtoken")
    {
        return FailureKind::PermissionDenied;
    }
    if status.as_u16() == 404
        || code_lower.contains("notfound")
        || code_lower.contains("nosuchentity")
        || code_lower.contains("nosuchbucket")
    {
        return FailureKind::NotFound;
    }
    if status.is_server_error() {
        // 5xx on a mutative call is a partial-effect risk; reads can retry.
        return if mutative {
            FailureKind::Ambiguous
        } else {
            FailureKind::Unavailable
        };
    }
    if status.as_u16() == 400
        && (code_lower.contains("validation")
            || code_lower.contains("invalidparameter")
            || code_lower.contains("malformed")
            || code_lower.contains("invalidaction"))
    {
        return FailureKind::InvalidInput;
    }
    if status.is_client_error() {
        return FailureKind::InvalidInput;
    }
    FailureKind::Other
}

/// Operation prefixes that indicate potentially mutative operations.
const MUTATIVE_OPERATIONS: &[&str] = &[
    "Create", "Put", "Delete", "Update", "Terminate", "Revoke", "Disable", "Deregister", "Stop",
    "Add", "Modify", "Remove", "Attach", "Detach", "Start", "Enable", "Register", "Set",
    "Associate", "Disassociate", "Allocate", "Release", "Cancel", "Reboot", "Accept", "Run",
    "Invoke",
];

/// Check if an operation is potentially mutative.
fn is_mutative_operation(operation_name: &str) -> bool {
    MUTATIVE_OPERATIONS
        .iter()
        .any(|prefix| operation_name.starts_with(prefix))
}

/// Get the AWS endpoint URL for a service and region.
fn get_endpoint(service_name: &str, region: &str) -> String {
    match service_name {
        "iam" => "https://iam.amazonaws.com".to_string(),
        "sts" if region == "us-east-1" => "https://sts.amazonaws.com".to_string(),
        "sts" => format!("https://sts.{}.amazonaws.com", region),
        "route53" | "cloudfront" => format!("https://{}.amazonaws.com", service_name),
        "s3" => format!("https://s3.{}.amazonaws.com", region),
        _ => format!("https://{}.{}.amazonaws.com", service_name, region),
    }
}

/// Default service target prefixes for the `x-amz-target` header.
fn default_service_targets() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("dynamodb", "DynamoDB_20120810"),
        ("kinesis", "Kinesis_20131202"),
        ("logs", "Logs_20140328"),
        ("events", "AWSEvents"),
        ("lambda", "AWSLambda"),
        ("sts", "AWSSecurityTokenServiceV20110615"),
        ("sqs", "AmazonSQS"),
        ("sns", "AmazonSimpleNotificationService"),
        ("secretsmanager", "secretsmanager"),
        ("ssm", "AmazonSSM"),
        ("kms", "TrentService"),
        ("iam", "IAMService"),
        ("cloudwatch", "GraniteServiceVersion20100801"),
        ("ecs", "AmazonEC2ContainerServiceV20141113"),
        ("ecr", "AmazonEC2ContainerRegistry_V20150921"),
        ("cloudformation", "CloudFormation"),
        ("stepfunctions", "AWSStepFunctions"),
        ("glue", "AWSGlue"),
        ("athena", "AmazonAthena"),
    ])
}
