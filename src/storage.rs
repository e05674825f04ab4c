//! Defines storage locations and the operations the pipeline performs
//! on them, transparently over S3 objects and local files.

use crate::client;
use crate::sign::visit_dirs;
use anyhow::{anyhow, bail, Context, Result};
use aws_sdk_s3::Client;
use itertools::Itertools;
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tokio::io::AsyncRead;
use tokio::task;
use tracing::debug;

/// The scheme that selects remote object storage.
pub const S3_SCHEME: &str = "s3://";

/// The scheme accepted (and ignored) in front of local paths.
const FILE_SCHEME: &str = "file://";

/// Remove any `scheme://` prefix from a URI.
pub fn strip_scheme(uri: &str) -> &str {
    match uri.find("://") {
        Some(index) => &uri[index + 3..],
        None => uri,
    }
}

/// A file or folder, either in an S3 bucket or on the local
/// filesystem. Folders in S3 are key prefixes, and are kept without a
/// trailing slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    S3 { bucket: String, key: String },
    Local(PathBuf),
}

impl Location {
    /// Parse a URI. Anything without the `s3://` scheme is taken as a
    /// local path.
    pub fn parse(uri: &str) -> Result<Self> {
        if let Some(rest) = uri.strip_prefix(S3_SCHEME) {
            let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                bail!("S3 URI {:?} has no bucket", uri);
            }
            Ok(Location::S3 {
                bucket: String::from(bucket),
                key: String::from(key.trim_matches('/')),
            })
        } else {
            let path = uri.strip_prefix(FILE_SCHEME).unwrap_or(uri);
            if path.is_empty() {
                bail!("Empty location");
            }
            Ok(Location::Local(PathBuf::from(path)))
        }
    }

    /// A location nested under this one.
    pub fn join(&self, relative: &str) -> Self {
        let relative = relative.trim_matches('/');
        match self {
            Location::S3 { bucket, key } => Location::S3 {
                bucket: bucket.clone(),
                key: if key.is_empty() {
                    String::from(relative)
                } else {
                    format!("{}/{}", key, relative)
                },
            },
            Location::Local(path) => Location::Local(path.join(relative)),
        }
    }

    /// The containing folder, or `None` at the top of a bucket or
    /// filesystem.
    pub fn parent(&self) -> Option<Self> {
        match self {
            Location::S3 { bucket, key } => {
                if key.is_empty() {
                    None
                } else {
                    Some(Location::S3 {
                        bucket: bucket.clone(),
                        key: key
                            .rsplit_once('/')
                            .map(|(parent, _)| String::from(parent))
                            .unwrap_or_default(),
                    })
                }
            }
            Location::Local(path) => path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(|p| Location::Local(p.to_path_buf())),
        }
    }

    /// The folder `levels` steps above this location, stopping at the
    /// top of the bucket or filesystem.
    pub fn ancestor(&self, levels: usize) -> Self {
        let mut current = self.clone();
        for _ in 0..levels {
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// The last segment of the location.
    pub fn file_name(&self) -> Option<String> {
        match self {
            Location::S3 { key, .. } => key
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .map(String::from),
            Location::Local(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
        }
    }

    /// The path of this location relative to `root`, with `/` as the
    /// separator, if it lies strictly under `root`.
    pub fn relative_to(&self, root: &Location) -> Option<String> {
        match (self, root) {
            (
                Location::S3 { bucket, key },
                Location::S3 {
                    bucket: root_bucket,
                    key: root_key,
                },
            ) if bucket == root_bucket => {
                if root_key.is_empty() {
                    Some(key.clone()).filter(|k| !k.is_empty())
                } else {
                    key.strip_prefix(root_key.as_str())
                        .and_then(|rest| rest.strip_prefix('/'))
                        .filter(|rest| !rest.is_empty())
                        .map(String::from)
                }
            }
            (Location::Local(path), Location::Local(root_path)) => path
                .strip_prefix(root_path)
                .ok()
                .filter(|rest| !rest.as_os_str().is_empty())
                .map(path_to_key),
            _ => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::S3 { bucket, key } if key.is_empty() => write!(f, "{}{}", S3_SCHEME, bucket),
            Location::S3 { bucket, key } => write!(f, "{}{}/{}", S3_SCHEME, bucket, key),
            Location::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Render a relative path as a `/`-separated key.
fn path_to_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .join("/")
}

/// A streaming reader over a file's contents.
pub type Reader = Pin<Box<dyn AsyncRead + Send>>;

/// Where a location actually lives once the storage configuration is
/// taken into account.
enum Backend<'a> {
    S3 {
        client: &'a Client,
        bucket: &'a str,
        key: &'a str,
    },
    Local(PathBuf),
}

/// Reads and writes locations. Local paths are always available; S3
/// locations require either a client or a mirror folder, in which
/// `s3://<bucket>/<key>` is served from `<mirror>/<bucket>/<key>`.
#[derive(Debug, Clone, Default)]
pub struct Storage {
    s3: Option<Client>,
    mirror: Option<PathBuf>,
}

impl Storage {
    /// Storage restricted to the local filesystem.
    pub fn local() -> Self {
        Storage::default()
    }

    /// Storage over both S3 and the local filesystem.
    pub fn with_s3(client: Client) -> Self {
        Storage {
            s3: Some(client),
            mirror: None,
        }
    }

    /// Storage using the global S3 client.
    pub fn current() -> Self {
        Self::with_s3(client::current().clone())
    }

    /// Storage serving S3 locations out of a local folder.
    pub fn mirrored(root: impl Into<PathBuf>) -> Self {
        Storage {
            s3: None,
            mirror: Some(root.into()),
        }
    }

    fn backend<'a>(&'a self, location: &'a Location) -> Result<Backend<'a>> {
        match location {
            Location::S3 { bucket, key } => {
                if let Some(mirror) = &self.mirror {
                    let mut path = mirror.join(bucket);
                    if !key.is_empty() {
                        path.push(key);
                    }
                    Ok(Backend::Local(path))
                } else {
                    let client = self.s3.as_ref().ok_or_else(|| {
                        anyhow!("S3 location {} is not available without a client", location)
                    })?;
                    Ok(Backend::S3 {
                        client,
                        bucket,
                        key,
                    })
                }
            }
            Location::Local(path) => Ok(Backend::Local(path.clone())),
        }
    }

    /// Read the full contents of a file.
    pub async fn read(&self, location: &Location) -> Result<Vec<u8>> {
        match self.backend(location)? {
            Backend::S3 {
                client,
                bucket,
                key,
            } => client::get_bytes(client, bucket, key).await,
            Backend::Local(path) => fs::read(&path)
                .await
                .with_context(|| format!("Failed to read local file {:?}", path)),
        }
    }

    /// Open a file for streaming reads.
    pub async fn open(&self, location: &Location) -> Result<Reader> {
        match self.backend(location)? {
            Backend::S3 {
                client,
                bucket,
                key,
            } => client::open(client, bucket, key).await,
            Backend::Local(path) => {
                let file = fs::File::open(&path)
                    .await
                    .with_context(|| format!("Failed to open local file {:?}", path))?;
                let reader: Reader = Box::pin(file);
                Ok(reader)
            }
        }
    }

    /// Copy a file, streaming its contents or, within S3, copying it
    /// server side.
    pub async fn copy(&self, from: &Location, to: &Location) -> Result<()> {
        match (self.backend(from)?, self.backend(to)?) {
            (
                Backend::S3 {
                    client,
                    bucket,
                    key,
                },
                Backend::S3 {
                    bucket: to_bucket,
                    key: to_key,
                    ..
                },
            ) => client::copy_object(client, bucket, key, to_bucket, to_key).await,
            (
                Backend::S3 {
                    client,
                    bucket,
                    key,
                },
                Backend::Local(path),
            ) => client::download(client, bucket, key, &path).await,
            (
                Backend::Local(path),
                Backend::S3 {
                    client,
                    bucket,
                    key,
                },
            ) => client::upload(client, &path, bucket, key).await,
            (Backend::Local(source), Backend::Local(target)) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await.with_context(|| {
                        format!("Failed to prepare local directory {:?}", parent)
                    })?;
                }
                fs::copy(&source, &target).await.with_context(|| {
                    format!("Failed to copy local file {:?} to {:?}", source, target)
                })?;
                Ok(())
            }
        }
    }

    /// Read a file as UTF-8 text.
    pub async fn read_text(&self, location: &Location) -> Result<String> {
        let bytes = self.read(location).await?;
        String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", location))
    }

    /// Whether a file exists at the location.
    pub async fn exists(&self, location: &Location) -> Result<bool> {
        match self.backend(location)? {
            Backend::S3 {
                client,
                bucket,
                key,
            } => {
                if key.is_empty() {
                    return Ok(false);
                }
                client::object_exists(client, bucket, key).await
            }
            Backend::Local(path) => Ok(fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false)),
        }
    }

    /// Whether the location is a folder. An S3 prefix counts as a
    /// folder when at least one object lives under it.
    pub async fn is_dir(&self, location: &Location) -> Result<bool> {
        match self.backend(location)? {
            Backend::S3 {
                client,
                bucket,
                key,
            } => {
                client::prefix_exists(client, bucket, &folder_prefix(key)).await
            }
            Backend::Local(path) => Ok(fs::metadata(&path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)),
        }
    }

    /// Write a file, creating intermediate local folders as needed.
    pub async fn write_bytes(&self, location: &Location, bytes: Vec<u8>) -> Result<()> {
        match self.backend(location)? {
            Backend::S3 {
                client,
                bucket,
                key,
            } => client::put_bytes(client, bucket, key, bytes).await,
            Backend::Local(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await.with_context(|| {
                        format!("Failed to prepare local directory {:?}", parent)
                    })?;
                }
                fs::write(&path, bytes)
                    .await
                    .with_context(|| format!("Failed to write local file {:?}", path))
            }
        }
    }

    /// Write a text file.
    pub async fn write_text(&self, location: &Location, text: &str) -> Result<()> {
        self.write_bytes(location, text.as_bytes().to_vec()).await
    }

    /// Copy the file at `location` into the local folder `dir`,
    /// keeping its name. Returns `None` when there is nothing to copy.
    pub async fn stage(&self, location: &Location, dir: &Path) -> Result<Option<PathBuf>> {
        if !self.exists(location).await? {
            debug!("Nothing to stage at {}", location);
            return Ok(None);
        }
        let name = location
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", location))?;
        let target = dir.join(name);
        match self.backend(location)? {
            Backend::S3 {
                client,
                bucket,
                key,
            } => client::download(client, bucket, key, &target).await?,
            Backend::Local(path) => {
                fs::copy(&path, &target).await.with_context(|| {
                    format!("Failed to copy local file {:?} into {:?}", path, target)
                })?;
            }
        }
        Ok(Some(target))
    }

    /// List every file under a folder, as sorted `/`-separated paths
    /// relative to it.
    pub async fn list_files(&self, root: &Location) -> Result<Vec<String>> {
        let mut files = match self.backend(root)? {
            Backend::S3 {
                client,
                bucket,
                key,
            } => {
                let prefix = folder_prefix(key);
                client::list_all_keys(client, bucket, &prefix)
                    .await?
                    .into_iter()
                    .filter_map(|k| k.strip_prefix(&prefix).map(String::from))
                    .filter(|k| !k.is_empty() && !k.ends_with('/'))
                    .collect::<Vec<_>>()
            }
            Backend::Local(path) => task::spawn_blocking(move || {
                let mut files = Vec::new();
                visit_dirs(&path, &mut |file| {
                    if let Ok(relative) = file.strip_prefix(&path) {
                        files.push(path_to_key(relative));
                    }
                    Ok(())
                })
                .with_context(|| format!("Failed to list local folder {:?}", path))?;
                Ok::<_, anyhow::Error>(files)
            })
            .await
            .context("Local folder listing was interrupted")??,
        };
        files.sort();
        Ok(files)
    }
}

/// The key prefix selecting everything under an S3 folder.
fn folder_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{}/", key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parse_and_display() {
        let location = Location::parse("s3://bucket/omics-quilt/3395667/").unwrap();
        assert_eq!(
            location,
            Location::S3 {
                bucket: String::from("bucket"),
                key: String::from("omics-quilt/3395667"),
            }
        );
        assert_eq!(location.to_string(), "s3://bucket/omics-quilt/3395667");
        assert_eq!(
            Location::parse("file:///tmp/report.csv").unwrap(),
            Location::Local(PathBuf::from("/tmp/report.csv"))
        );
        assert!(Location::parse("s3://").is_err());
        assert!(Location::parse("").is_err());
    }

    #[test]
    fn ancestors_stop_at_the_bucket() {
        let location = Location::parse("s3://b/pkg/name/out/report.csv").unwrap();
        assert_eq!(location.ancestor(2).to_string(), "s3://b/pkg/name");
        assert_eq!(location.ancestor(10).to_string(), "s3://b");
        assert_eq!(location.file_name().as_deref(), Some("report.csv"));
        assert_eq!(Location::parse("s3://b").unwrap().parent(), None);
    }

    #[test]
    fn relative_paths() {
        let root = Location::parse("s3://b/root").unwrap();
        let file = root.join("out/table.csv");
        assert_eq!(file.relative_to(&root).as_deref(), Some("out/table.csv"));
        assert_eq!(root.relative_to(&root), None);
        assert_eq!(
            Location::parse("s3://b/rooted/x").unwrap().relative_to(&root),
            None
        );
        let local = Location::Local(PathBuf::from("/data"));
        assert_eq!(
            local.join("a/b.csv").relative_to(&local).as_deref(),
            Some("a/b.csv")
        );
    }

    #[test]
    fn strips_schemes() {
        assert_eq!(strip_scheme("s3://bucket/key"), "bucket/key");
        assert_eq!(strip_scheme("bucket/key"), "bucket/key");
    }

    #[tokio::test]
    async fn local_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::local();
        let root = Location::Local(dir.path().to_path_buf());
        let file = root.join("nested/deeper/file.txt");
        storage.write_text(&file, "hello").await.unwrap();
        assert!(storage.exists(&file).await.unwrap());
        assert!(!storage.exists(&root).await.unwrap());
        assert!(storage.is_dir(&root).await.unwrap());
        assert_eq!(storage.read_text(&file).await.unwrap(), "hello");
        storage.write_text(&root.join("a.txt"), "a").await.unwrap();
        assert_eq!(
            storage.list_files(&root).await.unwrap(),
            vec!["a.txt", "nested/deeper/file.txt"]
        );
    }

    #[tokio::test]
    async fn staging_a_missing_file_yields_nothing() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::local();
        let missing = Location::Local(dir.path().join("missing.csv"));
        assert!(storage.stage(&missing, dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mirrored_s3_locations_live_under_the_mirror() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::mirrored(dir.path());
        let location = Location::parse("s3://bucket/pkg/file.txt").unwrap();
        storage.write_text(&location, "content").await.unwrap();
        assert!(dir.path().join("bucket/pkg/file.txt").is_file());
        assert!(storage
            .is_dir(&Location::parse("s3://bucket/pkg").unwrap())
            .await
            .unwrap());
        assert_eq!(
            storage
                .list_files(&Location::parse("s3://bucket").unwrap())
                .await
                .unwrap(),
            vec!["pkg/file.txt"]
        );
    }

    #[tokio::test]
    async fn copies_stream_between_locations() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::mirrored(dir.path().join("mirror"));
        let source = Location::Local(dir.path().join("source.csv"));
        storage.write_text(&source, "a,b\n1,2\n").await.unwrap();

        let remote = Location::parse("s3://bucket/copied/source.csv").unwrap();
        storage.copy(&source, &remote).await.unwrap();
        let back = Location::Local(dir.path().join("back/source.csv"));
        storage.copy(&remote, &back).await.unwrap();
        assert_eq!(storage.read_text(&back).await.unwrap(), "a,b\n1,2\n");

        let mut reader = storage.open(&remote).await.unwrap();
        let mut text = String::new();
        tokio::io::AsyncReadExt::read_to_string(&mut reader, &mut text)
            .await
            .unwrap();
        assert_eq!(text, "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn s3_without_client_fails() {
        let storage = Storage::local();
        let location = Location::parse("s3://bucket/key").unwrap();
        assert!(storage.read(&location).await.is_err());
    }
}
