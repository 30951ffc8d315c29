//! Tessera Storage -- content-addressed file store.
//!
//! Files are addressed by the hex SHA-256 of their content and laid out as
//! `<root>/sha256/ab/cd/abcd...` so no directory grows unreasonably large.
//! The node only needs lookups and ranged reads; writes come from the local
//! operator.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid file key: {0}")]
    InvalidKey(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("range {start}..{end} outside file of {size} bytes")]
    RangeOutOfBounds { start: u64, end: u64, size: u64 },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// What the store knows about a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub size: u64,
}

/// Store interface consumed by the request handlers.
pub trait FileStore: Send + Sync {
    /// Look up a file by hex SHA-256.
    fn find_file(&self, sha256: &str) -> Result<Option<FileInfo>>;

    /// Read bytes `start..end` of a stored file.
    fn read_range(&self, sha256: &str, start: u64, end: u64) -> Result<Vec<u8>>;

    /// Store content, returning its hex SHA-256.
    fn store(&self, data: &[u8]) -> Result<String>;

    fn has_file(&self, sha256: &str) -> Result<bool> {
        Ok(self.find_file(sha256)?.is_some())
    }
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn validate_key(sha256: &str) -> Result<()> {
    if sha256.len() == 64 && sha256.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(sha256.to_string()))
    }
}

/// Filesystem-backed store.
pub struct FsFileStore {
    root: PathBuf,
}

impl FsFileStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("sha256"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn path_for(&self, sha256: &str) -> PathBuf {
        self.root
            .join("sha256")
            .join(&sha256[0..2])
            .join(&sha256[2..4])
            .join(sha256)
    }
}

impl FileStore for FsFileStore {
    fn find_file(&self, sha256: &str) -> Result<Option<FileInfo>> {
        validate_key(sha256)?;
        match std::fs::metadata(self.path_for(sha256)) {
            Ok(meta) if meta.is_file() => Ok(Some(FileInfo { size: meta.len() })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_range(&self, sha256: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let info = self
            .find_file(sha256)?
            .ok_or_else(|| StorageError::NotFound(sha256.to_string()))?;
        if start > end || end > info.size {
            return Err(StorageError::RangeOutOfBounds {
                start,
                end,
                size: info.size,
            });
        }

        let mut file = std::fs::File::open(self.path_for(sha256))?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn store(&self, data: &[u8]) -> Result<String> {
        let sha256 = sha256_hex(data);
        let path = self.path_for(&sha256);
        if path.exists() {
            return Ok(sha256);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Write then rename so readers never observe a partial file
        let tmp = path.with_extension(format!("tmp{}", rand::random::<u32>()));
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &path)?;

        tracing::debug!(%sha256, size = data.len(), "storage: file stored");
        Ok(sha256)
    }
}
