//! Filesystem helpers shared by the checkpoint, snapshot and artifact writers.
//!
//! Every file this crate publishes goes through [`write_atomic`] (or a staging
//! directory plus [`publish`]) so a reader never observes a partially written
//! file under its final name.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Writes `bytes` to `path` via a sibling temp file, fsync and rename.
///
/// # Errors
///
/// Returns the underlying IO error. On failure the temp file is removed and
/// `path` is left untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    sync_dir(dir)?;

    debug!(path = %path.display(), bytes = bytes.len(), "atomic write complete");
    Ok(())
}

/// Moves a fully written staging entry (file or directory) to its final path.
///
/// # Errors
///
/// Returns the IO error from the rename.
pub fn publish(staged: &Path, target: &Path) -> io::Result<()> {
    fs::rename(staged, target)?;
    if let Some(dir) = target.parent() {
        sync_dir(dir)?;
    }
    Ok(())
}

/// Resolves a path in `dir` that does not exist yet.
///
/// `name.ext` is returned as-is when free, otherwise `name_1.ext`,
/// `name_2.ext`, ... The extension is everything after the first `.` so
/// `x.csv.gz` becomes `x_1.csv.gz`.
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let base_path = dir.join(filename);
    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = match filename.find('.') {
        Some(pos) => (&filename[..pos], &filename[pos..]),
        None => (filename, ""),
    };

    let mut suffix = 1usize;
    loop {
        let candidate = dir.join(format!("{stem}_{suffix}{ext}"));
        if !candidate.exists() {
            return candidate;
        }
        suffix += 1;
    }
}

/// Total size in bytes of a file, or of all files below a directory.
///
/// # Errors
///
/// Returns the first IO error encountered while walking.
pub fn disk_usage(path: &Path) -> io::Result<u64> {
    let meta = fs::metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += disk_usage(&entry?.path())?;
    }
    Ok(total)
}

#[allow(clippy::unnecessary_wraps)]
fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(path)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
