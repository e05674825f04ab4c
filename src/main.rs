use anyhow::{anyhow, Result};
use lambda_runtime::{run, service_fn, Context as InvocationContext, LambdaEvent};
use omics_packager::app::{App, Response};
use omics_packager::client;
use omics_packager::conf::Context;
use serde_json::Value;
use std::collections::HashMap;

/// The explicit context of an invocation: the environment block of
/// the invoker's client context, if any.
fn explicit_context(invocation: &InvocationContext) -> HashMap<String, String> {
    invocation
        .client_context
        .as_ref()
        .map(|client_context| client_context.environment.clone())
        .unwrap_or_default()
}

/// Handle a single storage or workflow notification. The invoker's
/// client context environment takes precedence over the process
/// environment.
async fn function_handler(event: LambdaEvent<Value>) -> Result<Response> {
    let explicit = explicit_context(&event.context);
    let app = App::with_aws(Context::resolve(&explicit))?;
    app.handle_event(&event.payload).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();
    client::init().await?;

    run(service_fn(function_handler))
        .await
        .map_err(|e| anyhow!("{:?}", e))
}
