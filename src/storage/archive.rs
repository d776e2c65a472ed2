//! Gzip-compressed tar archives of a Task's artifacts.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder as TarBuilder, Header};

use super::blob::StorageError;

/// Longest prompt fragment kept in an entry name.
const MAX_NAME_CHARS: usize = 50;

/// One file inside an archive.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Entry name `{index:03}_{sanitised prompt}.{ext}`, index starting at 1.
pub fn entry_name(index: usize, prompt: &str, extension: &str) -> String {
    let mut safe: String = prompt
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .take(MAX_NAME_CHARS)
        .collect::<String>()
        .trim()
        .replace(' ', "_");
    if safe.is_empty() {
        safe.push_str("image");
    }
    format!("{:03}_{}.{}", index, safe, extension)
}

/// Builds a `.tar.gz` in memory from the given entries.
pub fn build_tar_gz(entries: &[ArchiveEntry]) -> Result<Vec<u8>, StorageError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = TarBuilder::new(encoder);
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;

    for entry in entries {
        let mut header = Header::new_gnu();
        header.set_size(entry.bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        header.set_cksum();
        tar.append_data(&mut header, &entry.name, entry.bytes.as_slice())
            .map_err(|e| StorageError::Archive(format!("{}: {}", entry.name, e)))?;
    }

    let mut encoder = tar
        .into_inner()
        .map_err(|e| StorageError::Archive(e.to_string()))?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}
