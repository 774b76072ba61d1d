//! Dispatch a GetCallerIdentity call through the full pipeline.
//!
//! Uses ambient AWS credentials. Run with:
//!
//! ```bash
//! cargo run --example caller_identity
//! ```

use stratus_core::{
    AccountConfig, CredentialSource, Directory, Dispatcher, Invocation, RegionSet, ToolRegistry,
};
use stratus_tools::aws::ApiCallOperation;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let regions = RegionSet::new(["us-east-1", "us-west-2"], "us-east-1")?;
    let directory = Directory::builder(regions)
        .account(AccountConfig::new("default", CredentialSource::Ambient))
        .build()?;

    let mut registry = ToolRegistry::new();
    registry.register(
        ApiCallOperation::new("sts", "GetCallerIdentity")
            .into_tool("sts_get_caller_identity")
            .description("Return the identity of the calling credentials")
            .build()?,
    )?;

    let dispatcher = Dispatcher::builder(directory, registry)
        .on_event(|event| eprintln!("event: {:?}", event))
        .build();

    let envelope = dispatcher
        .dispatch(Invocation::new(
            "sts_get_caller_identity",
            serde_json::json!({}),
        ))
        .await;

    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
