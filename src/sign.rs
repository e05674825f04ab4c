//! Defines the content hashes that identify package entries, and the
//! folder walk used to enumerate them.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the chunks fed into the hasher while streaming.
const CHUNK_SIZE: usize = 64 * 1024;

/// Visit files within `dir`. Source:
/// https://doc.rust-lang.org/stable/std/fs/fn.read_dir.html
pub fn visit_dirs<F>(dir: &Path, cb: &mut F) -> Result<()>
where
    F: FnMut(PathBuf) -> Result<()>,
{
    if dir.is_dir() {
        for entry in dir.read_dir()? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                visit_dirs(&path, cb)?;
            } else {
                cb(path.to_path_buf())?;
            }
        }
    }
    Ok(())
}

/// Produce the lowercase hex SHA-256 of a buffer.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// An incremental SHA-256 over a sequence of chunks, rendered as
/// lowercase hex.
#[derive(Default)]
pub struct Signer {
    hasher: Sha256,
}

impl Signer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

/// Hash a stream without holding it in memory. Returns the hex
/// digest and the number of bytes read.
pub async fn hash_reader<R>(reader: &mut R) -> Result<(String, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut signer = Signer::new();
    let mut buffer = vec![0; CHUNK_SIZE];
    let mut size = 0;
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        signer.update(&buffer[..read]);
        size += read as u64;
    }
    Ok((signer.finish(), size))
}
