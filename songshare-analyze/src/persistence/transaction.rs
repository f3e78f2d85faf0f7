//! Journaled multi-file transaction
//!
//! New content for every target is staged to a temporary file in the target's
//! directory. The journal next to the audio file lists each staged file and
//! its target. Commit marks the journal committed, renames the staged files
//! over their targets and removes the journal.
//!
//! Renames run with the audio file last. The tags embedded in the audio file
//! are what other programs read, and they flip in one rename once every
//! auxiliary file (side-record, tag backup) is already in place. Between the
//! first rename and the audio rename a reader of the side-record can see new
//! fields next to old tags; a crash in that window is finished by the next
//! [`recover`].
//!
//! [`recover`] inspects a leftover journal: a committed one is rolled forward
//! (remaining renames applied), an uncommitted one is rolled back (staged
//! files removed). Targets are therefore either all old or all new.

use crate::error::PersistenceError;
use crate::persistence::stores::with_suffix;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Journal file suffix appended to the audio path
pub const JOURNAL_SUFFIX: &str = ".songshare-txn.json";

/// One staged file and the file it replaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRename {
    pub staged: PathBuf,
    pub target: PathBuf,
}

/// On-disk transaction journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journal {
    pub txn_id: Uuid,
    /// Audio file the transaction belongs to; renamed last
    pub audio: PathBuf,
    pub committed: bool,
    pub renames: Vec<StagedRename>,
}

/// What [`recover`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No leftover journal
    Clean,
    /// Committed journal replayed
    RolledForward,
    /// Uncommitted journal discarded with its staged files
    RolledBack,
}

pub fn journal_path(audio: &Path) -> PathBuf {
    with_suffix(audio, JOURNAL_SUFFIX)
}

/// Staging path for `target`: hidden file in the same directory
fn staged_path(target: &Path, txn_id: &Uuid) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.{}.tmp", name, txn_id.simple()))
}

fn write_journal(path: &Path, journal: &Journal) -> Result<(), PersistenceError> {
    let content = serde_json::to_string_pretty(journal).map_err(|e| PersistenceError::Journal {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let tmp = with_suffix(path, ".tmp");
    std::fs::write(&tmp, content).map_err(|e| PersistenceError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| PersistenceError::io(path, e))
}

fn read_journal(path: &Path) -> Result<Journal, PersistenceError> {
    let content = std::fs::read_to_string(path).map_err(|e| PersistenceError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| PersistenceError::Journal {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn remove_if_exists(path: &Path) -> Result<(), PersistenceError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PersistenceError::io(path, e)),
    }
}

fn roll_forward(journal: &Journal) -> Result<(), PersistenceError> {
    let (audio, auxiliary): (Vec<&StagedRename>, Vec<&StagedRename>) = journal
        .renames
        .iter()
        .partition(|r| r.target == journal.audio);
    for rename in auxiliary.into_iter().chain(audio) {
        if rename.staged.exists() {
            std::fs::rename(&rename.staged, &rename.target)
                .map_err(|e| PersistenceError::io(&rename.target, e))?;
        }
    }
    Ok(())
}

fn roll_back(journal: &Journal) {
    for rename in &journal.renames {
        if let Err(e) = remove_if_exists(&rename.staged) {
            warn!(staged = %rename.staged.display(), error = %e, "Failed to remove staged file");
        }
    }
}

/// Finish or discard a transaction left behind by an interrupted run
pub fn recover(audio: &Path) -> Result<Recovery, PersistenceError> {
    let path = journal_path(audio);
    if !path.exists() {
        return Ok(Recovery::Clean);
    }

    let journal = match read_journal(&path) {
        Ok(j) => j,
        Err(e) => {
            // Journal writes are atomic; an unreadable one was never committed
            warn!(journal = %path.display(), error = %e, "Discarding unreadable journal");
            remove_if_exists(&path)?;
            return Ok(Recovery::RolledBack);
        }
    };

    let action = if journal.committed {
        roll_forward(&journal)?;
        Recovery::RolledForward
    } else {
        roll_back(&journal);
        Recovery::RolledBack
    };
    remove_if_exists(&path)?;

    info!(
        audio = %audio.display(),
        txn = %journal.txn_id,
        action = ?action,
        "Recovered interrupted transaction"
    );
    Ok(action)
}

/// Transaction in progress for one audio item
#[derive(Debug)]
pub struct Transaction {
    journal_path: PathBuf,
    journal: Journal,
}

impl Transaction {
    /// Open a transaction; writes an uncommitted journal
    pub fn begin(audio: &Path) -> Result<Self, PersistenceError> {
        let txn = Self {
            journal_path: journal_path(audio),
            journal: Journal {
                txn_id: Uuid::new_v4(),
                audio: audio.to_path_buf(),
                committed: false,
                renames: Vec::new(),
            },
        };
        write_journal(&txn.journal_path, &txn.journal)?;
        debug!(audio = %audio.display(), txn = %txn.journal.txn_id, "Transaction started");
        Ok(txn)
    }

    /// Stage new content for `target`; `write` receives the staging path
    pub fn stage<F>(&mut self, target: &Path, write: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&Path) -> Result<(), PersistenceError>,
    {
        let staged = staged_path(target, &self.journal.txn_id);
        self.journal.renames.push(StagedRename {
            staged: staged.clone(),
            target: target.to_path_buf(),
        });
        // Record before writing so a crash mid-write leaves a removable file
        write_journal(&self.journal_path, &self.journal)?;
        write(&staged)
    }

    /// Mark committed and move every staged file into place
    pub fn commit(mut self) -> Result<(), PersistenceError> {
        self.journal.committed = true;
        if let Err(e) = write_journal(&self.journal_path, &self.journal) {
            self.journal.committed = false;
            self.abort();
            return Err(e);
        }
        roll_forward(&self.journal)?;
        remove_if_exists(&self.journal_path)?;
        debug!(txn = %self.journal.txn_id, files = self.journal.renames.len(), "Transaction committed");
        Ok(())
    }

    /// Discard staged files and the journal
    pub fn abort(self) {
        roll_back(&self.journal);
        if let Err(e) = remove_if_exists(&self.journal_path) {
            warn!(journal = %self.journal_path.display(), error = %e, "Failed to remove journal");
        }
        debug!(txn = %self.journal.txn_id, "Transaction rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_commit_replaces_targets_and_removes_journal() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("song.mp3");
        let sidecar = dir.path().join("song.mp3.analysis.json");
        std::fs::write(&audio, b"old audio").unwrap();

        let mut txn = Transaction::begin(&audio).unwrap();
        txn.stage(&audio, |p| {
            std::fs::write(p, b"new audio").map_err(|e| PersistenceError::io(p, e))
        })
        .unwrap();
        txn.stage(&sidecar, |p| {
            std::fs::write(p, b"{}").map_err(|e| PersistenceError::io(p, e))
        })
        .unwrap();
        txn.commit().unwrap();

        assert_eq!(std::fs::read(&audio).unwrap(), b"new audio");
        assert_eq!(std::fs::read(&sidecar).unwrap(), b"{}");
        assert!(!journal_path(&audio).exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_audio_renamed_after_side_record() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("song.mp3");
        let sidecar = dir.path().join("song.mp3.analysis.json");
        let staged_audio = dir.path().join(".song.mp3.a.tmp");
        std::fs::write(&audio, b"old audio").unwrap();
        std::fs::write(&staged_audio, b"new audio").unwrap();

        // Audio staged first; its staged file cannot be moved because the
        // side-record rename before it fails (directory in the way)
        std::fs::create_dir(&sidecar).unwrap();
        std::fs::write(sidecar.join("occupied"), b"x").unwrap();
        let staged_side = dir.path().join(".song.mp3.analysis.json.b.tmp");
        std::fs::write(&staged_side, b"{}").unwrap();

        let journal = Journal {
            txn_id: Uuid::new_v4(),
            audio: audio.clone(),
            committed: true,
            renames: vec![
                StagedRename {
                    staged: staged_audio.clone(),
                    target: audio.clone(),
                },
                StagedRename {
                    staged: staged_side,
                    target: sidecar,
                },
            ],
        };

        assert!(roll_forward(&journal).is_err());
        assert_eq!(std::fs::read(&audio).unwrap(), b"old audio");
        assert!(staged_audio.exists());
    }

    #[test]
    fn test_abort_leaves_targets_untouched() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("song.mp3");
        std::fs::write(&audio, b"old audio").unwrap();

        let mut txn = Transaction::begin(&audio).unwrap();
        txn.stage(&audio, |p| {
            std::fs::write(p, b"new audio").map_err(|e| PersistenceError::io(p, e))
        })
        .unwrap();
        txn.abort();

        assert_eq!(std::fs::read(&audio).unwrap(), b"old audio");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_recover_rolls_committed_journal_forward() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("song.mp3");
        let staged = dir.path().join(".song.mp3.abc.tmp");
        std::fs::write(&audio, b"old audio").unwrap();
        std::fs::write(&staged, b"new audio").unwrap();

        let journal = Journal {
            txn_id: Uuid::new_v4(),
            audio: audio.clone(),
            committed: true,
            renames: vec![StagedRename {
                staged: staged.clone(),
                target: audio.clone(),
            }],
        };
        write_journal(&journal_path(&audio), &journal).unwrap();

        assert_eq!(recover(&audio).unwrap(), Recovery::RolledForward);
        assert_eq!(std::fs::read(&audio).unwrap(), b"new audio");
        assert!(!staged.exists());
        assert!(!journal_path(&audio).exists());
    }

    #[test]
    fn test_recover_rolls_uncommitted_journal_back() {
        let dir = TempDir::new().unwrap();
        let audio = dir.path().join("song.mp3");
        let staged = dir.path().join(".song.mp3.abc.tmp");
        std::fs::write(&audio, b"old audio").unwrap();
        std::fs::write(&staged, b"half written").unwrap();

        let journal = Journal {
            txn_id: Uuid::new_v4(),
            audio: audio.clone(),
            committed: false,
            renames: vec![StagedRename {
                staged: staged.clone(),
                target: audio.clone(),
            }],
        };
        write_journal(&journal_path(&audio), &journal).unwrap();

        assert_eq!(recover(&audio).unwrap(), Recovery::RolledBack);
        assert_eq!(std::fs::read(&audio).unwrap(), b"old audio");
        assert!(!staged.exists());
    }

    #[test]
    fn test_recover_without_journal_is_clean() {
        let dir = TempDir::new().unwrap();
        assert_eq!(recover(&dir.path().join("song.mp3")).unwrap(), Recovery::Clean);
    }
}
