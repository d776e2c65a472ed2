//! Atomic file writes for state files.

use std::io::Write;
use std::path::{Path, PathBuf};

/// Replaces `path` with `bytes` through a temp file in the same directory.
///
/// Runs on the blocking pool. The temp file is created owner-only on Unix and
/// the rename keeps that mode, so secrets written here stay private.
pub async fn write_atomic(path: &Path, bytes: Vec<u8>) -> std::io::Result<()> {
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic_blocking(&target, &bytes))
        .await
        .map_err(std::io::Error::other)?
}

fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_atomic_creates_parent_and_replaces() {
        let dir = tempdir().expect("should create temp dir");
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first".to_vec()).await.expect("first write");
        write_atomic(&path, b"second".to_vec()).await.expect("second write");

        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(bytes, b"second");
        let leftovers = std::fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_atomic_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().expect("should create temp dir");
        let path = dir.path().join("keys.json");
        write_atomic(&path, b"{}".to_vec()).await.expect("write");
        let mode = std::fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }
}
