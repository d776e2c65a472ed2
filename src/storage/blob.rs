//! Opaque blob storage for reference images and generated artifacts.
//!
//! Blobs are addressed by a [`BlobHandle`]: a random id plus a file extension
//! derived from the content. The filesystem store spreads files over
//! subdirectories named by the first two characters of the handle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use uuid::Uuid;

use crate::error::ErrorCode;
use crate::generation::ImageFormat;
use crate::utils::write_atomic;

/// Errors that can occur during blob storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No blob stored under this handle.
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// The handle is not one this store could have issued.
    #[error("Invalid blob handle: {0}")]
    InvalidHandle(String),

    /// Storage directory creation failed.
    #[error("Failed to create storage directory: {0}")]
    DirectoryCreationFailed(String),

    /// Building an archive failed.
    #[error("Archive error: {0}")]
    Archive(String),
}

impl StorageError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StorageError::NotFound(_) => ErrorCode::NotFound,
            StorageError::InvalidHandle(_) => ErrorCode::InvalidInput,
            _ => ErrorCode::StorageFailure,
        }
    }
}

static HANDLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{32}\.[a-z]{3,4}$").expect("static regex is valid"));

/// Identifier of a stored blob, e.g. `3f2a...9c.png`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobHandle(String);

impl BlobHandle {
    /// Issues a fresh handle with the given extension.
    pub fn generate(extension: &str) -> Self {
        Self(format!("{}.{}", Uuid::new_v4().simple(), extension))
    }

    /// Validates an externally supplied handle; rejects anything path-like.
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        if HANDLE_PATTERN.is_match(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(StorageError::InvalidHandle(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File extension, without the dot.
    pub fn extension(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or_default()
    }

    /// Image format implied by the extension, if it is an image.
    pub fn format(&self) -> Option<ImageFormat> {
        ImageFormat::from_extension(self.extension())
    }
}

impl std::fmt::Display for BlobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for BlobHandle {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BlobHandle> for String {
    fn from(handle: BlobHandle) -> Self {
        handle.0
    }
}

/// Extension for content: the sniffed image format, or `bin`.
fn extension_for(bytes: &[u8]) -> &'static str {
    ImageFormat::sniff(bytes)
        .map(|f| f.extension())
        .unwrap_or("bin")
}

/// Put/get/delete storage of opaque byte blobs.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores bytes and returns their handle.
    async fn put(&self, bytes: &[u8]) -> Result<BlobHandle, StorageError>;

    /// Reads the bytes stored under `handle`.
    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>, StorageError>;

    /// Deletes a blob. Returns `false` if it was already gone.
    async fn delete(&self, handle: &BlobHandle) -> Result<bool, StorageError>;

    /// Whether a blob exists under `handle`.
    async fn exists(&self, handle: &BlobHandle) -> Result<bool, StorageError>;
}

/// Filesystem-backed blob store.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    base_path: PathBuf,
}

impl FsBlobStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Returns the base storage path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of a blob: `<base>/<first 2 chars>/<handle>`.
    pub fn blob_path(&self, handle: &BlobHandle) -> PathBuf {
        let name = handle.as_str();
        self.base_path.join(&name[..2]).join(name)
    }

    async fn ensure_dir(&self, dir: &Path) -> Result<(), StorageError> {
        if !fs::try_exists(dir).await? {
            fs::create_dir_all(dir).await.map_err(|e| {
                StorageError::DirectoryCreationFailed(format!(
                    "Failed to create directory {:?}: {}",
                    dir, e
                ))
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<BlobHandle, StorageError> {
        let handle = BlobHandle::generate(extension_for(bytes));
        let path = self.blob_path(&handle);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());
        self.ensure_dir(&dir).await?;

        write_atomic(&path, bytes.to_vec()).await?;

        tracing::debug!(handle = %handle, size = bytes.len(), "Stored blob");
        Ok(handle)
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>, StorageError> {
        fs::read(self.blob_path(handle)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(handle.to_string())
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn delete(&self, handle: &BlobHandle) -> Result<bool, StorageError> {
        match fs::remove_file(self.blob_path(handle)).await {
            Ok(()) => {
                tracing::debug!(handle = %handle, "Deleted blob");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn exists(&self, handle: &BlobHandle) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.blob_path(handle)).await?)
    }
}

/// In-memory blob store.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobHandle, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().expect("blob store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: &[u8]) -> Result<BlobHandle, StorageError> {
        let handle = BlobHandle::generate(extension_for(bytes));
        self.blobs
            .write()
            .expect("blob store lock poisoned")
            .insert(handle.clone(), bytes.to_vec());
        Ok(handle)
    }

    async fn get(&self, handle: &BlobHandle) -> Result<Vec<u8>, StorageError> {
        self.blobs
            .read()
            .expect("blob store lock poisoned")
            .get(handle)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(handle.to_string()))
    }

    async fn delete(&self, handle: &BlobHandle) -> Result<bool, StorageError> {
        Ok(self
            .blobs
            .write()
            .expect("blob store lock poisoned")
            .remove(handle)
            .is_some())
    }

    async fn exists(&self, handle: &BlobHandle) -> Result<bool, StorageError> {
        Ok(self
            .blobs
            .read()
            .expect("blob store lock poisoned")
            .contains_key(handle))
    }
}
