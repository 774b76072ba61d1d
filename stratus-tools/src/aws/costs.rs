//! Static cost estimates for the policy gate.
//!
//! This is an advisory table, not billing: good enough to decide whether an
//! operation should require approval. Production deployments can replace it
//! with the pricing API by supplying their own estimates on the handler.

use serde_json::Value;

/// Approximate on-demand hourly cost (USD, us-east-1) per instance type.
const HOURLY_INSTANCE_COSTS: &[(&str, f64)] = &[
    ("t3.micro", 0.0104),
    ("t3.small", 0.0208),
    ("t3.medium", 0.0416),
    ("t3.large", 0.0832),
    ("m5.large", 0.096),
    ("m5.xlarge", 0.192),
    ("m5.2xlarge", 0.384),
    ("c5.large", 0.085),
    ("c5.xlarge", 0.17),
    ("r5.large", 0.126),
];

/// Hourly cost assumed for instance types not in the table.
const DEFAULT_HOURLY_COST: f64 = 0.1;

/// Monthly (30-day) on-demand cost estimate for an EC2 instance type.
pub fn monthly_instance_cost(instance_type: &str) -> f64 {
    let hourly = HOURLY_INSTANCE_COSTS
        .iter()
        .find(|(name, _)| *name == instance_type)
        .map(|(_, cost)| *cost)
        .unwrap_or(DEFAULT_HOURLY_COST);
    hourly * 24.0 * 30.0
}

/// Estimate the cost of one operation from its arguments.
///
/// Returns `None` for operations with no meaningful standing cost (reads,
/// deletes, one-shot calls); the policy gate then skips the cost rule.
pub fn estimate_cost(service: &str, operation: &str, arguments: &Value) -> Option<f64> {
    if service != "ec2" || operation != "RunInstances" {
        return None;
    }
    let instance_type = arguments
        .get("InstanceType")
        .or_else(|| arguments.get("instance_type"))
        .and_then(Value::as_str)?;
    let count = arguments
        .get("MaxCount")
        .or_else(|| arguments.get("max_count"))
        .and_then(Value::as_u64)
        .unwrap_or(1) as f64;
    Some(monthly_instance_cost(instance_type) * count)
}
