//! Cross-process advisory lock guarding the allocation table.
//!
//! The lock lives in its own file, separate from the data it protects, so the
//! table can be replaced by atomic rename while the lock is held. `fs2` maps
//! to `flock` on Unix and `LockFileEx` on Windows; nothing above this module
//! branches on the platform.

use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default time to wait for the allocation lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

const RETRY_INTERVAL_START: Duration = Duration::from_millis(10);
const RETRY_INTERVAL_MAX: Duration = Duration::from_millis(200);

/// Exclusive advisory lock, released when dropped.
///
/// Each acquisition opens its own file handle, so two `ScopedLock`s exclude
/// each other even inside a single process.
#[derive(Debug)]
pub struct ScopedLock {
    file: File,
    path: PathBuf,
}

impl ScopedLock {
    /// Block until the lock at `path` is acquired or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Filesystem(format!(
                    "Failed to create lock directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::Filesystem(format!("Failed to open lock file: {}", e)))?;

        let deadline = Instant::now() + timeout;
        let mut interval = RETRY_INTERVAL_START;

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            "Gave up waiting for allocation lock {:?} after {:?}",
                            path, timeout
                        );
                        return Err(Error::LockTimeout {
                            path: path.to_path_buf(),
                            timeout,
                        });
                    }
                    std::thread::sleep(interval.min(deadline - now));
                    interval = (interval * 2).min(RETRY_INTERVAL_MAX);
                }
                Err(e) => {
                    return Err(Error::Filesystem(format!(
                        "Failed to lock '{}': {}",
                        path.display(),
                        e
                    )))
                }
            }
        }

        // PID of the holder, for humans inspecting a stuck lock
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        debug!("Acquired allocation lock on {:?}", path);

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!("Failed to unlock {:?}: {}", self.path, e);
        } else {
            debug!("Released allocation lock on {:?}", self.path);
        }
    }
}
