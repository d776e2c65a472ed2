//! Blob storage for reference images and generated artifacts, plus archive export.
//!
//! ```rust,ignore
//! use image_forge::storage::{BlobStore, FsBlobStore};
//!
//! let store = FsBlobStore::new("./images");
//! let handle = store.put(&png_bytes).await?;
//! let bytes = store.get(&handle).await?;
//! ```

pub mod archive;
pub mod blob;

pub use archive::{build_tar_gz, entry_name, ArchiveEntry};
pub use blob::{BlobHandle, BlobStore, FsBlobStore, MemoryBlobStore, StorageError};
