//! Defines the key/value parameter store used to remember when a
//! resource was last processed.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use aws_sdk_ssm::types::ParameterType;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// A string-valued key/value store.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ParameterStore: Send + Sync {
    /// Read a value, or `None` if the name was never written.
    async fn get(&self, name: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn put(&self, name: &str, value: &str) -> Result<()>;
}

/// Parameters kept in AWS Systems Manager, every name nested under a
/// common prefix.
pub struct SsmParameterStore {
    client: aws_sdk_ssm::Client,
    prefix: String,
}

impl SsmParameterStore {
    pub fn new(client: aws_sdk_ssm::Client, prefix: &str) -> Self {
        let base = prefix.trim_matches('/');
        SsmParameterStore {
            client,
            prefix: if base.is_empty() {
                String::from("/")
            } else {
                format!("/{}/", base)
            },
        }
    }

    /// The absolute parameter name for a relative one.
    pub fn absolute_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name.trim_start_matches('/'))
    }
}

#[async_trait]
impl ParameterStore for SsmParameterStore {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        if name.is_empty() {
            bail!("Parameter name can not be empty");
        }
        let absolute = self.absolute_name(name);
        match self
            .client
            .get_parameter()
            .name(&absolute)
            .with_decryption(true)
            .send()
            .await
        {
            Ok(output) => Ok(output
                .parameter()
                .and_then(|p| p.value())
                .map(String::from)),
            Err(e) => {
                let e = e.into_service_error();
                if e.is_parameter_not_found() {
                    debug!("Parameter {:?} not found", absolute);
                    Ok(None)
                } else {
                    Err(anyhow!(e))
                        .with_context(|| format!("Failed to read parameter {:?}", absolute))
                }
            }
        }
    }

    async fn put(&self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() {
            bail!("Parameter name can not be empty");
        }
        if value.is_empty() {
            bail!("Parameter value can not be empty");
        }
        let absolute = self.absolute_name(name);
        self.client
            .put_parameter()
            .name(&absolute)
            .value(value)
            .r#type(ParameterType::String)
            .overwrite(true)
            .send()
            .await
            .with_context(|| format!("Failed to write parameter {:?}", absolute))?;
        Ok(())
    }
}

/// Parameters kept in process memory.
#[derive(Default)]
pub struct MemoryParameterStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ParameterStore for MemoryParameterStore {
    async fn get(&self, name: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| anyhow!("parameter store lock was poisoned"))?;
        Ok(values.get(name).cloned())
    }

    async fn put(&self, name: &str, value: &str) -> Result<()> {
        if name.is_empty() {
            bail!("Parameter name can not be empty");
        }
        let mut values = self
            .values
            .lock()
            .map_err(|_| anyhow!("parameter store lock was poisoned"))?;
        values.insert(String::from(name), String::from(value));
        Ok(())
    }
}
