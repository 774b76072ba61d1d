//! Tool registry: names, parameter schemas, and bound operation handlers.
//!
//! Schemas are compiled once at registration; validation reports every
//! violation found, not just the first, so a caller can fix all errors in one
//! round trip.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use jsonschema::Validator;
use serde_json::Value;

use crate::handler::{box_operation, Operation, OperationHandler};

/// One schema violation found while validating arguments.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SchemaViolation {
    /// The offending field ("(root)" when the violation is structural).
    pub field: String,

    /// Why the field is invalid.
    pub reason: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Errors from the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A tool with this name is already registered.
    #[error("tool '{0}' is already registered")]
    DuplicateTool(String),

    /// No tool with this name exists.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The declared parameter schema failed to compile.
    #[error("tool '{tool}' has an invalid parameter schema: {reason}")]
    InvalidSchema { tool: String, reason: String },

    /// The arguments violate the tool's schema; every violation is listed.
    #[error("{}", format_violations(.0))]
    Violations(Vec<SchemaViolation>),
}

fn format_violations(violations: &[SchemaViolation]) -> String {
    let details: Vec<String> = violations.iter().map(SchemaViolation::to_string).collect();
    format!(
        "{} schema violation(s): {}",
        violations.len(),
        details.join("; ")
    )
}

/// A registered tool: unique name, parameter schema, operation handler.
pub struct ToolDefinition {
    name: String,
    service: String,
    description: String,
    idempotent: bool,
    schema: Value,
    validator: Validator,
    handler: Arc<dyn OperationHandler>,
}

impl ToolDefinition {
    /// Start building a definition for `name`, billed against `service`
    /// limiter buckets, executed by `handler`.
    pub fn builder(
        name: impl Into<String>,
        service: impl Into<String>,
        handler: Arc<dyn OperationHandler>,
    ) -> ToolDefinitionBuilder {
        ToolDefinitionBuilder {
            name: name.into(),
            service: service.into(),
            description: String::new(),
            idempotent: false,
            schema: None,
            handler,
        }
    }

    /// Build a definition from a typed [`Operation`], deriving the schema
    /// from its input type.
    pub fn from_operation<O: Operation + 'static>(
        name: impl Into<String>,
        service: impl Into<String>,
        operation: O,
    ) -> ToolDefinitionBuilder {
        let schema = schemars::schema_for!(O::Input);
        let schema = serde_json::to_value(schema).unwrap_or_else(|_| default_schema());
        ToolDefinition::builder(name, service, box_operation(operation)).schema(schema)
    }

    /// The unique tool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The provider service this tool calls (limiter bucket component).
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether the operation may be retried freely on retryable failures.
    pub fn idempotent(&self) -> bool {
        self.idempotent
    }

    /// The declared parameter schema.
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// The bound operation handler.
    pub fn handler(&self) -> &Arc<dyn OperationHandler> {
        &self.handler
    }

    /// Validate arguments against the schema, collecting every violation.
    pub fn validate(&self, arguments: &Value) -> Result<(), RegistryError> {
        let mut violations = Vec::new();

        if !arguments.is_object() {
            violations.push(SchemaViolation {
                field: "(root)".to_string(),
                reason: format!("arguments must be a JSON object, got {}", json_type(arguments)),
            });
            return Err(RegistryError::Violations(violations));
        }

        for error in self.validator.iter_errors(arguments) {
            violations.push(SchemaViolation {
                field: violation_field(&error),
                reason: error.to_string(),
            });
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::Violations(violations))
        }
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("idempotent", &self.idempotent)
            .finish()
    }
}

/// Builder for [`ToolDefinition`].
pub struct ToolDefinitionBuilder {
    name: String,
    service: String,
    description: String,
    idempotent: bool,
    schema: Option<Value>,
    handler: Arc<dyn OperationHandler>,
}

impl ToolDefinitionBuilder {
    /// Set the description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare the operation idempotent (safe to retry freely).
    ///
    /// Defaults to `false`: unclassified operations are treated as
    /// non-idempotent.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Declare the parameter schema as a JSON Schema document.
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Compile the schema and produce the definition.
    pub fn build(self) -> Result<ToolDefinition, RegistryError> {
        let schema = self.schema.unwrap_or_else(default_schema);
        let validator = jsonschema::validator_for(&schema).map_err(|err| {
            RegistryError::InvalidSchema {
                tool: self.name.clone(),
                reason: err.to_string(),
            }
        })?;
        Ok(ToolDefinition {
            name: self.name,
            service: self.service,
            description: self.description,
            idempotent: self.idempotent,
            schema,
            validator,
            handler: self.handler,
        })
    }
}

fn default_schema() -> Value {
    serde_json::json!({ "type": "object" })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Derive the offending field name from a validation error.
fn violation_field(error: &jsonschema::ValidationError<'_>) -> String {
    use jsonschema::error::ValidationErrorKind;

    if let ValidationErrorKind::Required { property } = &error.kind() {
        if let Some(name) = property.as_str() {
            return name.to_string();
        }
        return property.to_string();
    }

    let path = error.instance_path().to_string();
    if path.is_empty() {
        "(root)".to_string()
    } else {
        path.trim_start_matches('/').to_string()
    }
}

/// Maps tool names to definitions. Frozen after startup; reads are lock-free.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool definition.
    pub fn register(&mut self, definition: ToolDefinition) -> Result<(), RegistryError> {
        let name = definition.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(RegistryError::DuplicateTool(name));
        }
        self.tools.insert(name, Arc::new(definition));
        Ok(())
    }

    /// Look up a tool by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<ToolDefinition>, RegistryError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownTool(name.to_string()))
    }

    /// Validate arguments for a named tool, listing every violation.
    pub fn validate(&self, name: &str, arguments: &Value) -> Result<(), RegistryError> {
        self.resolve(name)?.validate(arguments)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Iterate registered tools.
    pub fn tools(&self) -> impl Iterator<Item = &Arc<ToolDefinition>> {
        self.tools.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{CallEnv, FailureKind, ProviderFailure, ProviderResponse};
    use async_trait::async_trait;

    struct NullHandler;

    #[async_trait]
    impl crate::handler::OperationHandler for NullHandler {
        async fn call(
            &self,
            _env: CallEnv,
            _arguments: &Value,
        ) -> Result<ProviderResponse, ProviderFailure> {
            Err(ProviderFailure::new(FailureKind::Other, "not wired"))
        }
    }

    fn handler() -> Arc<dyn crate::handler::OperationHandler> {
        Arc::new(NullHandler)
    }

    fn instance_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "instance_id": {
                    "type": "string",
                    "pattern": "^i-[0-9a-f]+$"
                },
                "instance_type": {
                    "type": "string",
                    "enum": ["t3.micro", "t3.small", "t3.medium"]
                },
                "count": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 10
                }
            },
            "required": ["instance_id", "instance_type"],
            "additionalProperties": false
        })
    }

    fn registry_with_tool() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::builder("ec2_start_instance", "ec2", handler())
                    .description("Start an EC2 instance")
                    .schema(instance_schema())
                    .idempotent(true)
                    .build()
                    .unwrap(),
            )
            .unwrap();
        registry
    }

    // ===== Registration Tests =====

    #[test]
    fn test_register_and_resolve() {
        let registry = registry_with_tool();
        let tool = registry.resolve("ec2_start_instance").unwrap();
        assert_eq!(tool.name(), "ec2_start_instance");
        assert_eq!(tool.service(), "ec2");
        assert!(tool.idempotent());
    }

    #[test]
    fn test_register_duplicate_fails() {
        let mut registry = registry_with_tool();
        let result = registry.register(
            ToolDefinition::builder("ec2_start_instance", "ec2", handler())
                .build()
                .unwrap(),
        );
        assert!(matches!(result, Err(RegistryError::DuplicateTool(name)) if name == "ec2_start_instance"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = registry_with_tool();
        let result = registry.resolve("no_such_tool");
        assert!(matches!(result, Err(RegistryError::UnknownTool(name)) if name == "no_such_tool"));
    }

    #[test]
    fn test_invalid_schema_rejected_at_build() {
        let result = ToolDefinition::builder("bad", "ec2", handler())
            .schema(serde_json::json!({"type": "not-a-type"}))
            .build();
        assert!(matches!(result, Err(RegistryError::InvalidSchema { .. })));
    }

    // ===== Validation Tests =====

    #[test]
    fn test_validate_accepts_valid_arguments() {
        let registry = registry_with_tool();
        let args = serde_json::json!({
            "instance_id": "i-0abc123",
            "instance_type": "t3.micro"
        });
        assert!(registry.validate("ec2_start_instance", &args).is_ok());
    }

    #[test]
    fn test_validate_lists_every_missing_field() {
        let registry = registry_with_tool();
        let result = registry.validate("ec2_start_instance", &serde_json::json!({}));

        let Err(RegistryError::Violations(violations)) = result else {
            panic!("expected violations");
        };
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert!(fields.contains(&"instance_id"));
        assert!(fields.contains(&"instance_type"));
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn test_validate_collects_mixed_violations() {
        let registry = registry_with_tool();
        // Missing instance_id, bad enum member, out-of-range count.
        let args = serde_json::json!({
            "instance_type": "m5.24xlarge",
            "count": 0
        });
        let Err(RegistryError::Violations(violations)) =
            registry.validate("ec2_start_instance", &args)
        else {
            panic!("expected violations");
        };

        assert!(violations.len() >= 3);
        let fields: Vec<&str> = violations.iter().map(|v| v.field.as_str()).collect();
        assert!(fields.contains(&"instance_id"));
        assert!(fields.contains(&"instance_type"));
        assert!(fields.contains(&"count"));
    }

    #[test]
    fn test_validate_pattern_violation_names_field() {
        let registry = registry_with_tool();
        let args = serde_json::json!({
            "instance_id": "not-an-instance-id",
            "instance_type": "t3.micro"
        });
        let Err(RegistryError::Violations(violations)) =
            registry.validate("ec2_start_instance", &args)
        else {
            panic!("expected violations");
        };
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "instance_id");
    }

    #[test]
    fn test_validate_rejects_non_object_arguments() {
        let registry = registry_with_tool();
        let Err(RegistryError::Violations(violations)) =
            registry.validate("ec2_start_instance", &serde_json::json!([1, 2]))
        else {
            panic!("expected violations");
        };
        assert_eq!(violations[0].field, "(root)");
        assert!(violations[0].reason.contains("array"));
    }

    #[test]
    fn test_validate_unknown_tool() {
        let registry = registry_with_tool();
        let result = registry.validate("missing", &serde_json::json!({}));
        assert!(matches!(result, Err(RegistryError::UnknownTool(_))));
    }

    #[test]
    fn test_default_schema_accepts_any_object() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::builder("loose", "sts", handler())
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(registry
            .validate("loose", &serde_json::json!({"anything": 1}))
            .is_ok());
    }

    #[test]
    fn test_violations_display_counts() {
        let err = RegistryError::Violations(vec![
            SchemaViolation {
                field: "a".to_string(),
                reason: "missing".to_string(),
            },
            SchemaViolation {
                field: "b".to_string(),
                reason: "bad type".to_string(),
            },
        ]);
        let rendered = err.to_string();
        assert!(rendered.contains("2 schema violation(s)"));
        assert!(rendered.contains("a: missing"));
        assert!(rendered.contains("b: bad type"));
    }
}
