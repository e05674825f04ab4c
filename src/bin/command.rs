use anyhow::{Context as _, Result};
use omics_packager::app::App;
use omics_packager::client;
use omics_packager::conf::Context;
use omics_packager::registry::QuiltRegistry;
use omics_packager::storage::Storage;
use omics_packager::store::MemoryParameterStore;
use serde_json::Value;
use std::collections::HashMap;
use std::env::{args, var};
use tokio::io::AsyncReadExt;

/// Run the pipeline once for an event read from the file given as the
/// first argument, or from standard input. When `STORAGE_MIRROR` is
/// set, S3 locations are served from that local folder and debounce
/// timestamps are kept in memory, so no AWS access is needed.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();

    let text = match args().nth(1).filter(|path| path != "-") {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read event file {:?}", path))?,
        None => {
            let mut text = String::new();
            tokio::io::stdin()
                .read_to_string(&mut text)
                .await
                .context("Failed to read event from standard input")?;
            text
        }
    };
    let event: Value = serde_json::from_str(&text).context("Event is not valid JSON")?;

    let context = Context::resolve(&HashMap::new());
    let app = if let Ok(mirror) = var("STORAGE_MIRROR") {
        let storage = Storage::mirrored(mirror);
        App::new(
            context,
            storage.clone(),
            Box::new(MemoryParameterStore::new()),
            Box::new(QuiltRegistry::new(storage)),
        )?
    } else {
        client::init().await?;
        App::with_aws(context)?
    };

    let response = app.handle_event(&event).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
