//! Ready-to-use operation handlers for the stratus dispatch core.
//!
//! The dispatch core treats every cloud operation as an opaque handler
//! behind [`stratus_core::OperationHandler`]; this crate supplies the
//! general-purpose implementation: a SigV4-signed JSON API call bound to one
//! (service, operation) pair, plus the static cost table the policy gate
//! consumes.
//!
//! # Example
//!
//! ```ignore
//! use stratus_core::{ToolRegistry, ToolDefinition};
//! use stratus_tools::aws::ApiCallOperation;
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(
//!     ApiCallOperation::new("ec2", "DescribeInstances")
//!         .into_tool("ec2_describe_instances")
//!         .description("List EC2 instances")
//!         .build()?,
//! )?;
//! ```

pub mod aws;
