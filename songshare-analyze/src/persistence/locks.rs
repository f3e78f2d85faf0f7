//! Per-file exclusive locks
//!
//! Two layers. [`FileLocks`] holds one async mutex per canonical audio path and
//! serializes tasks inside one process. [`LockFile`] is an exclusively created
//! `<audio>.songshare.lock` next to the audio file and serializes separate
//! processes writing the same library. Both are held for the whole
//! read-merge-write transaction of an item and released on drop.

use crate::error::PersistenceError;
use crate::persistence::stores::with_suffix;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

/// Lock file suffix appended to the audio path
pub const LOCK_SUFFIX: &str = ".songshare.lock";

/// Poll interval while another process holds the lock file
const LOCK_POLL: Duration = Duration::from_millis(50);

static GLOBAL_LOCKS: OnceLock<FileLocks> = OnceLock::new();

/// Registry of per-path locks
#[derive(Debug, Clone, Default)]
pub struct FileLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

/// Exclusive hold on one audio path
#[derive(Debug)]
pub struct FileGuard {
    path: PathBuf,
    _guard: OwnedMutexGuard<()>,
}

impl FileGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static FileLocks {
        GLOBAL_LOCKS.get_or_init(FileLocks::new)
    }

    /// Wait for exclusive access to `path`
    pub async fn acquire(&self, path: &Path) -> FileGuard {
        let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let lock = {
            let mut map = self.inner.lock().await;
            // Drop entries nobody holds or waits on
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(key.clone()).or_default().clone()
        };

        trace!(path = %key.display(), "Waiting for file lock");
        let guard = lock.lock_owned().await;
        FileGuard {
            path: key,
            _guard: guard,
        }
    }
}

/// Cross-process hold on one audio path; the file is removed on drop
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn path_for(audio: &Path) -> PathBuf {
        with_suffix(audio, LOCK_SUFFIX)
    }

    /// Create the lock file, waiting up to `wait` for another holder
    ///
    /// A lock file older than `stale_after` is left over from a crashed run
    /// and is broken.
    pub fn acquire(audio: &Path, wait: Duration, stale_after: Duration) -> Result<Self, PersistenceError> {
        let path = Self::path_for(audio);
        let deadline = Instant::now() + wait;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    // Holder pid for whoever finds a stale lock
                    let _ = writeln!(file, "{}", std::process::id());
                    debug!(lock = %path.display(), "Lock file acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, stale_after) {
                        warn!(lock = %path.display(), "Breaking stale lock file");
                        match std::fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            Err(e) => return Err(PersistenceError::io(&path, e)),
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(PersistenceError::Locked { path });
                    }
                    trace!(lock = %path.display(), "Lock file held elsewhere, waiting");
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(PersistenceError::io(&path, e)),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to remove lock file");
        }
    }
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map_or(false, |age| age >= stale_after)
}
