//! Packages an output folder: assembles its metadata and pushes it to
//! the registry.

use crate::conf::{Context, Settings};
use crate::error::PipelineError;
use crate::registry::{package_uri, PushRequest, Registry};
use crate::storage::{Location, Storage};
use crate::trigger::PipelineOptions;
use anyhow::{anyhow, Context as _, Result};
use serde_json::{Map, Value};
use tracing::{info, instrument};

/// Package metadata, built up over a single invocation.
pub type PackageMetadata = Map<String, Value>;

/// Pushes output folders as packages.
pub struct Packager<'a> {
    pub storage: &'a Storage,
    pub registry: &'a dyn Registry,
    pub context: &'a Context,
    pub settings: &'a Settings,
}

impl<'a> Packager<'a> {
    /// Read an optional JSON file under `root`.
    async fn read_json(&self, root: &Location, file_name: &str) -> Result<Option<Value>> {
        let location = root.join(file_name);
        if !self.storage.exists(&location).await? {
            return Ok(None);
        }
        let text = self.storage.read_text(&location).await?;
        let value = serde_json::from_str(&text)
            .with_context(|| format!("{} doesn't hold valid JSON", location))?;
        Ok(Some(value))
    }

    /// Push the folder at `root` as the package named in `options`,
    /// returning the metadata it was pushed with, extended with the
    /// resulting `top_hash` and `quilt+uri`.
    #[instrument(skip_all, fields(root = %root, package = %options.package))]
    pub async fn package_folder(
        &self,
        root: &Location,
        options: &PipelineOptions,
    ) -> Result<PackageMetadata> {
        if !self.storage.is_dir(root).await? {
            return Err(PipelineError::PackagePrecondition(format!(
                "{} is not an existing folder",
                root
            ))
            .into());
        }

        let mut meta = match self.read_json(root, &self.settings.quilt_metadata).await? {
            Some(Value::Object(meta)) => meta,
            Some(_) => {
                return Err(anyhow!(
                    "{} must hold a JSON object",
                    root.join(&self.settings.quilt_metadata)
                ))
            }
            None => PackageMetadata::new(),
        };
        if let Some(input) = self.read_json(root, &self.settings.input_metadata).await? {
            meta.insert(String::from("input"), input);
        }
        meta.insert(String::from("options"), serde_json::to_value(options)?);
        meta.insert(String::from("context"), self.context.to_json());

        let registry = self
            .settings
            .quilt_registry
            .clone()
            .unwrap_or_else(|| format!("s3://{}", options.bucket));
        let message = serde_json::to_string(options)?;
        let metadata = Value::Object(meta.clone());
        let pushed = self
            .registry
            .push(&PushRequest {
                root,
                package: &options.package,
                registry: &registry,
                message: &message,
                metadata: &metadata,
                force: true,
            })
            .await
            .with_context(|| {
                format!(
                    "Failed to push package {:?} to {}",
                    options.package, registry
                )
            })?;

        let uri = package_uri(&options.bucket, &options.package, &pushed.top_hash);
        info!("Pushed {}", uri);
        meta.insert(String::from("top_hash"), Value::String(pushed.top_hash));
        meta.insert(String::from("quilt+uri"), Value::String(uri));
        Ok(meta)
    }
}
