//! Defines the global AWS configuration and the S3 primitives the
//! storage layer is built upon.

use anyhow::{anyhow, Context, Result};
use aws_config::from_env;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use once_cell::sync::OnceCell;
use std::env;
use std::path::Path;
use std::pin::Pin;
use tokio::fs::{create_dir_all, File};
use tokio::io::{copy, AsyncRead};

/// Lists all keys found in a bucket under a given prefix. Returns a
/// page of keys and a token that can be used for a subsequent fetch.
pub async fn list_keys(
    client: &Client,
    bucket: &str,
    prefix: &str,
    next: &Option<String>,
) -> Result<(Vec<String>, Option<String>)> {
    let mut operation = client.list_objects_v2().bucket(bucket).prefix(prefix);
    if let Some(continuation_token) = next {
        operation = operation.continuation_token(continuation_token)
    }
    let response = operation.send().await.with_context(|| {
        format!(
            "Failed to list keys under {:?} in bucket {:?} \
             using {} continuation token",
            prefix,
            bucket,
            if next.is_some() { "a" } else { "no" }
        )
    })?;
    Ok((
        response
            .contents()
            .unwrap_or_default()
            .iter()
            .filter_map(|o| o.key().map(String::from))
            .collect(),
        response.next_continuation_token().map(String::from),
    ))
}

/// Whether at least one object lives under a prefix.
pub async fn prefix_exists(client: &Client, bucket: &str, prefix: &str) -> Result<bool> {
    let response = client
        .list_objects_v2()
        .bucket(bucket)
        .prefix(prefix)
        .max_keys(1)
        .send()
        .await
        .with_context(|| format!("Failed to list keys under {:?} in bucket {:?}", prefix, bucket))?;
    Ok(!response.contents().unwrap_or_default().is_empty())
}

/// Lists every key under a prefix, following continuation tokens.
pub async fn list_all_keys(client: &Client, bucket: &str, prefix: &str) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut next = None;
    loop {
        let (page, token) = list_keys(client, bucket, prefix, &next).await?;
        keys.extend(page);
        if token.is_none() {
            break;
        }
        next = token;
    }
    Ok(keys)
}

/// Whether a single object exists.
pub async fn object_exists(client: &Client, bucket: &str, key: &str) -> Result<bool> {
    match client.head_object().bucket(bucket).key(key).send().await {
        Ok(_) => Ok(true),
        Err(e) => {
            let e = e.into_service_error();
            if e.is_not_found() {
                Ok(false)
            } else {
                Err(anyhow!(e)).with_context(|| {
                    format!("Failed to inspect object {:?} in bucket {:?}", key, bucket)
                })
            }
        }
    }
}

/// Reads the full contents of a single object.
pub async fn get_bytes(client: &Client, bucket: &str, key: &str) -> Result<Vec<u8>> {
    let body = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| format!("Failed to read object {:?} from bucket {:?}", key, bucket))?
        .body
        .collect()
        .await
        .with_context(|| {
            format!(
                "Failed to receive the contents of object {:?} from bucket {:?}",
                key, bucket
            )
        })?;
    Ok(body.into_bytes().to_vec())
}

/// Opens a single object for streaming reads.
pub async fn open(
    client: &Client,
    bucket: &str,
    key: &str,
) -> Result<Pin<Box<dyn AsyncRead + Send>>> {
    let body = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| format!("Failed to open object {:?} from bucket {:?}", key, bucket))?
        .body;
    let reader: Pin<Box<dyn AsyncRead + Send>> = Box::pin(body.into_async_read());
    Ok(reader)
}

/// Uploads a local file as a single object, streaming it from disk.
pub async fn upload(client: &Client, path: &Path, bucket: &str, key: &str) -> Result<()> {
    let body = ByteStream::from_path(path)
        .await
        .with_context(|| format!("Failed to open local file {:?} for upload", path))?;
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(body)
        .send()
        .await
        .with_context(|| {
            format!(
                "Failed to upload local file {:?} as object {:?} in bucket {:?}",
                path, key, bucket
            )
        })?;
    Ok(())
}

/// Copies an object within S3, without passing its contents through
/// this process.
// TODO: switch to a multipart copy (upload_part_copy) for objects over 5 GiB.
pub async fn copy_object(
    client: &Client,
    from_bucket: &str,
    from_key: &str,
    to_bucket: &str,
    to_key: &str,
) -> Result<()> {
    client
        .copy_object()
        .copy_source(format!("{}/{}", from_bucket, from_key))
        .bucket(to_bucket)
        .key(to_key)
        .send()
        .await
        .with_context(|| {
            format!(
                "Failed to copy object {:?} from bucket {:?} to {:?} in bucket {:?}",
                from_key, from_bucket, to_key, to_bucket
            )
        })?;
    Ok(())
}

/// Downloads a single object from storage into the specified path.
pub async fn download(client: &Client, bucket: &str, key: &str, path: &Path) -> Result<()> {
    // Ensure the directory structure exists
    if let Some(parent) = path.parent() {
        create_dir_all(parent).await.with_context(|| {
            format!(
                "Failed to prepare local directory {:?} for object {:?}",
                parent, key
            )
        })?;
    }
    let mut body = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .with_context(|| {
            format!(
                "Failed to download object {:?} from bucket {:?}",
                key, bucket
            )
        })?
        .body
        .into_async_read();
    let mut file = File::create(path).await.with_context(|| {
        format!(
            "Failed to create local file {:?} to hold remote object {:?} from bucket {:?}",
            path, key, bucket
        )
    })?;
    copy(&mut body, &mut file).await.with_context(|| {
        format!(
            "Failed to save the contents of remote object {:?} from bucket {:?} \
             into local file {:?}",
            key, bucket, path
        )
    })?;
    Ok(())
}

/// Writes a single object from an in-memory buffer.
pub async fn put_bytes(client: &Client, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<()> {
    client
        .put_object()
        .bucket(bucket)
        .key(key)
        .body(ByteStream::from(bytes))
        .send()
        .await
        .with_context(|| format!("Failed to write object {:?} in bucket {:?}", key, bucket))?;
    Ok(())
}

/// Global S3 client instance.
static CURRENT: OnceCell<Client> = OnceCell::new();

/// Global SSM client instance.
static SSM: OnceCell<aws_sdk_ssm::Client> = OnceCell::new();

/// Initialize the global S3 and SSM clients from a shared AWS
/// configuration.
pub async fn init() -> Result<()> {
    let endpoint_url_var = env::var("AWS_ENDPOINT_URL");
    let config = if let Ok(endpoint_url) = endpoint_url_var {
        from_env()
            .endpoint_url(
                if endpoint_url.starts_with("http://") || endpoint_url.starts_with("https://") {
                    endpoint_url
                } else {
                    format!("https://{}", endpoint_url)
                },
            )
            .region(Region::new("us-east-1")) // should be OK since the endpoint was overridden
            .load()
    } else {
        from_env().load()
    }
    .await;
    CURRENT
        .set(Client::new(&config))
        .map_err(|_| anyhow!("client::CURRENT was already initialized"))?;
    SSM.set(aws_sdk_ssm::Client::new(&config))
        .map_err(|_| anyhow!("client::SSM was already initialized"))
}

/// Get the current S3 client instance, or panic if it hasn't been initialized.
pub fn current() -> &'static Client {
    CURRENT.get().expect("client is not initialized")
}

/// Get the current SSM client instance, or panic if it hasn't been
/// initialized.
pub fn ssm() -> &'static aws_sdk_ssm::Client {
    SSM.get().expect("client is not initialized")
}
