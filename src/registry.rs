//! Defines the package registry: a content-addressed store of folders
//! plus metadata, laid out the way Quilt registries are.
//!
//! ```text
//! <registry>/<package>/<logical key>                 copied files
//! <registry>/.quilt/packages/<top hash>              JSONL manifest
//! <registry>/.quilt/named_packages/<package>/<ts>    top hash
//! <registry>/.quilt/named_packages/<package>/latest  top hash
//! ```

use crate::error::PipelineError;
use crate::sign::{hash_reader, Signer};
use crate::storage::{Location, Storage};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

/// The manifest format version.
const MANIFEST_VERSION: &str = "v0";

/// Package names are `<owner>/<name>`.
static PACKAGE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w.-]+/[\w.-]+$").expect("package name regex is valid"));

/// Check that a package name has the `<owner>/<name>` form.
pub fn validate_package_name(name: &str) -> Result<(), PipelineError> {
    if PACKAGE_NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(PipelineError::InvalidPackageName(String::from(name)))
    }
}

/// The canonical URI of a pushed package revision.
pub fn package_uri(bucket: &str, package: &str, top_hash: &str) -> String {
    format!("quilt+s3://{}#package={}@{}", bucket, package, top_hash)
}

/// What to push.
#[derive(Debug)]
pub struct PushRequest<'a> {
    /// The folder whose whole tree becomes the package content.
    pub root: &'a Location,
    /// The package name, `<owner>/<name>`.
    pub package: &'a str,
    /// The registry URI, e.g. `s3://bucket`.
    pub registry: &'a str,
    /// A human-readable message stored with the revision.
    pub message: &'a str,
    /// Package-level metadata.
    pub metadata: &'a Value,
    /// Overwrite the latest revision even when it differs.
    pub force: bool,
}

/// The outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushResult {
    pub top_hash: String,
}

/// A registry packages can be pushed to.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn push(&self, request: &PushRequest<'_>) -> Result<PushResult>;
}

/// One file of a package.
#[derive(Debug, Clone)]
struct Entry {
    logical_key: String,
    source: Location,
    size: u64,
    hash: String,
}

impl Entry {
    /// The entry as it takes part in the top hash.
    fn hashed_view(&self) -> Value {
        json!({
            "hash": {"type": "SHA256", "value": self.hash},
            "logical_key": self.logical_key,
            "meta": {},
            "size": self.size,
        })
    }
}

/// Compute the top hash of a package revision from its metadata and
/// its entries, in logical key order. The message doesn't take part,
/// so pushing the same content and metadata again yields the same
/// hash.
fn top_hash(metadata: &Value, entries: &[Entry]) -> Result<String> {
    let mut signer = Signer::new();
    let header = json!({"version": MANIFEST_VERSION, "user_meta": metadata});
    signer.update(serde_json::to_string(&header)?.as_bytes());
    for entry in entries {
        signer.update(serde_json::to_string(&entry.hashed_view())?.as_bytes());
    }
    Ok(signer.finish())
}

/// A registry stored through [`Storage`], so that both `s3://`
/// registries and local folders are supported.
#[derive(Debug, Clone)]
pub struct QuiltRegistry {
    storage: Storage,
}

impl QuiltRegistry {
    pub fn new(storage: Storage) -> Self {
        QuiltRegistry { storage }
    }

    async fn collect_entries(&self, root: &Location) -> Result<Vec<Entry>> {
        let mut entries = Vec::new();
        for logical_key in self.storage.list_files(root).await? {
            let source = root.join(&logical_key);
            let mut reader = self.storage.open(&source).await?;
            let (hash, size) = hash_reader(&mut reader)
                .await
                .with_context(|| format!("Failed to hash {}", source))?;
            entries.push(Entry {
                hash,
                size,
                logical_key,
                source,
            });
        }
        Ok(entries)
    }
}

#[async_trait]
impl Registry for QuiltRegistry {
    #[instrument(skip_all, fields(package = request.package, registry = request.registry))]
    async fn push(&self, request: &PushRequest<'_>) -> Result<PushResult> {
        validate_package_name(request.package)?;
        let registry = Location::parse(request.registry)?;
        let entries = self
            .collect_entries(request.root)
            .await
            .with_context(|| format!("Failed to stage package folder {}", request.root))?;
        let top_hash = top_hash(request.metadata, &entries)?;

        let named = registry
            .join(".quilt/named_packages")
            .join(request.package);
        let latest = named.join("latest");
        if !request.force && self.storage.exists(&latest).await? {
            let current = self.storage.read_text(&latest).await?;
            if current.trim() != top_hash {
                bail!(
                    "Package {:?} already has revision {} in {}; push with force to replace it",
                    request.package,
                    current.trim(),
                    registry
                );
            }
        }

        let mut manifest = Vec::with_capacity(entries.len() + 1);
        manifest.push(serde_json::to_string(&json!({
            "version": MANIFEST_VERSION,
            "message": request.message,
            "user_meta": request.metadata,
        }))?);
        for entry in &entries {
            let physical = registry.join(request.package).join(&entry.logical_key);
            if physical != entry.source {
                self.storage.copy(&entry.source, &physical).await?;
            } else {
                debug!("{} is already in place", physical);
            }
            let mut line = entry.hashed_view();
            line["physical_keys"] = json!([physical.to_string()]);
            manifest.push(serde_json::to_string(&line)?);
        }
        let mut manifest = manifest.join("\n");
        manifest.push('\n');

        self.storage
            .write_text(
                &registry.join(".quilt/packages").join(&top_hash),
                &manifest,
            )
            .await?;
        self.storage
            .write_text(&named.join(&Utc::now().timestamp().to_string()), &top_hash)
            .await?;
        self.storage.write_text(&latest, &top_hash).await?;
        info!(
            "Pushed {} files as {}@{} to {}",
            entries.len(),
            request.package,
            top_hash,
            registry
        );
        Ok(PushResult { top_hash })
    }
}
