//! Defines configuration as resolved from the invocation context, the
//! environment and built-in defaults.

use anyhow::{anyhow, Context as _, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};

/// Built-in defaults, consulted after the explicit context and the
/// environment.
const DEFAULTS: &[(&str, &str)] = &[
    ("APP_NAME", "packager"),
    ("CDK_DEFAULT_EMAIL", "test@example.com"),
    ("CDK_DEFAULT_REGION", "us-east-1"),
    ("SOURCE_APP", "omics-quilt"),
    ("TIMESTAMP_FILE", "quilt_timestamp.json"),
    ("QUILT_METADATA", "quilt_metadata.json"),
    ("INPUT_METADATA", "input_metadata.json"),
    ("QUILT_SUMMARIZE", "quilt_summarize.json"),
    ("REPORT_SUFFIX", "out/bqsr_report/NA12989.hg38.recal_data.csv"),
];

/// The typed view over the resolved context. Keys are matched
/// case-insensitively against the field names, so `QUILT_METADATA`
/// populates `quilt_metadata`.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// The application name, used as the parameter store prefix
    /// unless `parameter_prefix` is given.
    pub app_name: String,

    /// Name of the metadata file read from (and merged into) the
    /// package metadata.
    pub quilt_metadata: String,

    /// Name of the summary file written next to the tables.
    pub quilt_summarize: String,

    /// Name of the optional file attached as `input` metadata.
    pub input_metadata: String,

    /// Path of the report relative to a workflow run's output URI.
    pub report_suffix: String,

    /// Overrides the registry a package is pushed to. When absent the
    /// registry is `s3://<bucket>` of the triggering event. May be a
    /// local folder.
    #[serde(default)]
    pub quilt_registry: Option<String>,

    /// Prefix for debounce parameters.
    #[serde(default)]
    pub parameter_prefix: Option<String>,
}

/// A merged lookup surface over an explicit context map, the process
/// environment and the built-in defaults. The first source to provide
/// a key wins.
#[derive(Debug, Clone)]
pub struct Context {
    entries: BTreeMap<String, String>,
    explicit: BTreeMap<String, String>,
    app: String,
    account: Option<String>,
    region: Option<String>,
}

impl Context {
    /// Resolve a context from an explicit map and the current process
    /// environment.
    pub fn resolve(explicit: &HashMap<String, String>) -> Self {
        Self::from_sources(explicit, std::env::vars())
    }

    /// Resolve a context from an explicit map and the given
    /// environment entries.
    pub fn from_sources<I>(explicit: &HashMap<String, String>, env: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let explicit: BTreeMap<String, String> = explicit
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut entries = explicit.clone();
        for (key, value) in env {
            entries.entry(key).or_insert(value);
        }
        for (key, value) in DEFAULTS {
            entries
                .entry(String::from(*key))
                .or_insert_with(|| String::from(*value));
        }
        let mut context = Context {
            entries,
            explicit,
            app: String::new(),
            account: None,
            region: None,
        };
        context.app = context.get("APP_NAME", "").unwrap_or_default().to_string();
        context.account = context
            .get("CDK_DEFAULT_ACCOUNT", "AWS_ACCOUNT_ID")
            .map(String::from);
        context.region = context
            .get("CDK_DEFAULT_REGION", "AWS_DEFAULT_REGION")
            .map(String::from);
        context
    }

    /// Look up `key`, falling back to `fallback` when the value is
    /// absent or empty and a fallback key is given.
    pub fn get(&self, key: &str, fallback: &str) -> Option<&str> {
        let value = self.entries.get(key).map(String::as_str);
        if value.is_some_and(|v| !v.is_empty()) || fallback.is_empty() {
            return value;
        }
        self.entries.get(fallback).map(String::as_str)
    }

    /// Whether `key` resolves to any value.
    pub fn has(&self, key: &str) -> bool {
        self.get(key, "").is_some()
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// The region, failing if none was configured.
    pub fn require_region(&self) -> Result<&str> {
        self.region().ok_or_else(|| anyhow!("AWS region not set"))
    }

    fn require_account(&self) -> Result<&str> {
        self.account().ok_or_else(|| anyhow!("AWS account not set"))
    }

    /// Name of the application bucket of the given kind, e.g.
    /// `input` or `output`.
    pub fn bucket_name(&self, kind: &str) -> Result<String> {
        Ok(format!(
            "{}-cka-{}-{}-{}",
            self.app,
            kind,
            self.require_account()?,
            self.require_region()?
        ))
    }

    /// Hostname of the account's container registry.
    pub fn registry_hostname(&self) -> Result<String> {
        Ok(format!(
            "{}.dkr.ecr.{}.amazonaws.com",
            self.require_account()?,
            self.require_region()?
        ))
    }

    /// The debounce window in seconds.
    pub fn timeout(&self) -> Result<u64> {
        let raw = self
            .get("TIMEOUT", "")
            .ok_or_else(|| anyhow!("TIMEOUT is not configured"))?;
        raw.trim()
            .parse()
            .with_context(|| format!("TIMEOUT must be a number of seconds, got {:?}", raw))
    }

    /// Deserialize the typed settings out of the merged entries.
    pub fn settings(&self) -> Result<Settings> {
        envy::from_iter(self.entries.iter().map(|(k, v)| (k.clone(), v.clone())))
            .context("Failed to read settings from the resolved context")
    }

    /// The entries given explicitly by the invoker.
    pub fn explicit(&self) -> &BTreeMap<String, String> {
        &self.explicit
    }

    /// The context attached to package metadata: the identifying
    /// summary plus the entries given explicitly by the invoker.
    pub fn to_json(&self) -> Value {
        json!({
            "app": self.app,
            "account": self.account,
            "region": self.region,
            "explicit": self.explicit(),
        })
    }
}
