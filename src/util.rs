use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use memmap2::Mmap;

use crate::model::FileSpec;

/// Compute the blake3 digest (hex) and byte length of a file.
/// Uses a 256 KB BufReader to reduce syscall overhead vs the default 8 KB.
pub fn file_digest(path: &Path) -> io::Result<(String, u64)> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    let length = io::copy(&mut reader, &mut hasher)?;
    Ok((hasher.finalize().to_hex().to_string(), length))
}

/// Compute the blake3 hex digest of a byte slice.
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// True when `path` is a regular file whose checksum and length both match
/// `spec`. A missing path is a plain `false`, not an error.
pub fn matches_spec(path: &Path, spec: &FileSpec) -> io::Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }
    let (digest, length) = file_digest(path)?;
    Ok(digest == spec.checksum && length == spec.length)
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or
/// replace the underlying file while the `Mmap` is live; the engine holds
/// the updater lock for the duration of an apply session.
pub fn mmap_file(path: &Path) -> io::Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: read-only mapping, no concurrent modification (see above).
    unsafe { Mmap::map(&file) }
}

pub fn is_dir_empty(path: &Path) -> io::Result<bool> {
    Ok(std::fs::read_dir(path)?.next().is_none())
}

/// Delete everything inside the staging area: staged files, retained
/// backups, and the journal. The directory itself is kept.
pub fn clear_staging_area(temp_dir: &Path) -> io::Result<()> {
    if !temp_dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(temp_dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
