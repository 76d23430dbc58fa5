//! Sibling files of a data file and the process lock.
//!
//! For a data file `Data.fs` the storage may create:
//!
//! - `Data.fs.lock`: advisory lock held while the storage is writable
//! - `Data.fs.index`: index sidecar
//! - `Data.fs.pack`: pack output, discarded if found on open
//! - `Data.fs.old`: the pre-pack file kept after a successful pack

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// `<path>.lock`
#[must_use]
pub fn lock_path(path: &Path) -> PathBuf {
    with_suffix(path, ".lock")
}

/// `<path>.index`
#[must_use]
pub fn index_path(path: &Path) -> PathBuf {
    with_suffix(path, ".index")
}

/// `<path>.pack`
#[must_use]
pub fn pack_path(path: &Path) -> PathBuf {
    with_suffix(path, ".pack")
}

/// `<path>.old`
#[must_use]
pub fn old_path(path: &Path) -> PathBuf {
    with_suffix(path, ".old")
}

/// Exclusive advisory lock on `<path>.lock`, released on drop.
#[derive(Debug)]
pub struct LockFile {
    _file: File,
    path: PathBuf,
}

impl LockFile {
    /// Acquires the lock without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Locked`] if another process holds it.
    pub fn acquire(data_path: &Path) -> CoreResult<Self> {
        let path = lock_path(data_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(CoreError::Locked { path });
        }
        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Writes `data` to `path` via a temporary file and rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> CoreResult<()> {
    let temp = with_suffix(path, ".tmp");
    let mut file = File::create(&temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, path)?;
    sync_parent_dir(path)
}

/// Fsyncs the directory containing `path` so renames are durable.
#[cfg(unix)]
pub fn sync_parent_dir(path: &Path) -> CoreResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

/// NTFS journals metadata; there is no directory fsync.
#[cfg(not(unix))]
pub fn sync_parent_dir(_path: &Path) -> CoreResult<()> {
    Ok(())
}
