//! Merge & persistence coordinator
//!
//! Reads the current tag set and side-record of an audio item, merges the
//! write plan into them and, in apply mode, writes both stores in one
//! journaled transaction. Preview mode computes the same diff and writes
//! nothing.
//!
//! Apply mode holds the in-process path lock and the item's lock file for the
//! whole recover-read-merge-write sequence, so two runs against the same
//! library never interleave on one item.

pub mod locks;
pub mod stores;
pub mod transaction;

pub use locks::{FileGuard, FileLocks, LockFile};
pub use stores::{Id3TagStore, JsonSideRecordStore, SideRecordStore, TagStore};
pub use transaction::{recover, Recovery, Transaction};

use crate::constraints::TagConstraints;
use crate::engine::WritePlan;
use crate::error::PersistenceError;
use crate::merge::{merge, DiffEntry, MergeConflict, MergeOutcome, PersistedState, TagSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backup file suffix for the pre-merge tag set
pub const TAG_BACKUP_SUFFIX: &str = ".tags.bak.json";

/// How long apply waits for another run's lock file
pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(30);

/// Lock files older than this are left over from a crashed run
pub const STALE_LOCK_AFTER: Duration = Duration::from_secs(600);

/// Whether the coordinator writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Compute the diff only
    #[default]
    Preview,
    /// Write merged state
    Apply,
}

/// Result for one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// Changes written
    Applied,
    /// Changes computed, nothing written
    Previewed,
    /// Nothing to change
    Unchanged,
}

/// What happened to one audio item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub audio: PathBuf,
    pub status: ApplyStatus,
    pub diff: Vec<DiffEntry>,
    pub warnings: Vec<MergeConflict>,
}

/// Coordinates merge and atomic writes for audio items
#[derive(Clone)]
pub struct Coordinator {
    tags: Arc<dyn TagStore>,
    side_records: Arc<dyn SideRecordStore>,
    locks: FileLocks,
    lock_wait: Duration,
    constraints: TagConstraints,
    backup_tags: bool,
}

impl Coordinator {
    pub fn new(
        tags: Arc<dyn TagStore>,
        side_records: Arc<dyn SideRecordStore>,
        constraints: TagConstraints,
    ) -> Self {
        Self {
            tags,
            side_records,
            locks: FileLocks::global().clone(),
            lock_wait: DEFAULT_LOCK_WAIT,
            constraints,
            backup_tags: false,
        }
    }

    /// Write `<audio>.tags.bak.json` with the pre-merge tags in each transaction
    pub fn with_tag_backup(mut self, enabled: bool) -> Self {
        self.backup_tags = enabled;
        self
    }

    /// Use a private lock registry instead of the process-wide one
    pub fn with_locks(mut self, locks: FileLocks) -> Self {
        self.locks = locks;
        self
    }

    /// How long apply waits for a lock file held by another process
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn side_records(&self) -> &dyn SideRecordStore {
        self.side_records.as_ref()
    }

    /// Merge `plan` into `audio`'s stores, writing in apply mode
    ///
    /// Holds the item's file lock for the full read-merge-write sequence.
    pub async fn apply(
        &self,
        audio: &Path,
        plan: &WritePlan,
        mode: WriteMode,
    ) -> Result<ItemOutcome, PersistenceError> {
        let _guard = self.locks.acquire(audio).await;

        let this = self.clone();
        let audio = audio.to_path_buf();
        let plan = plan.clone();
        tokio::task::spawn_blocking(move || this.apply_blocking(&audio, &plan, mode))
            .await
            .map_err(|e| PersistenceError::Internal(format!("Persistence task failed: {}", e)))?
    }

    /// Synchronous body of [`Coordinator::apply`]; caller holds the path lock
    pub fn apply_blocking(
        &self,
        audio: &Path,
        plan: &WritePlan,
        mode: WriteMode,
    ) -> Result<ItemOutcome, PersistenceError> {
        let _lock_file = match mode {
            WriteMode::Apply => {
                let lock = LockFile::acquire(audio, self.lock_wait, STALE_LOCK_AFTER)?;
                recover(audio)?;
                Some(lock)
            }
            WriteMode::Preview => None,
        };

        let existing = self.read_state(audio)?;
        let outcome = merge(plan, &existing);

        if outcome.tags_changed() && outcome.state.tags.len() > self.constraints.max_tags {
            return Err(PersistenceError::CapacityExceeded {
                count: outcome.state.tags.len(),
                max: self.constraints.max_tags,
            });
        }

        let status = if outcome.is_noop() {
            ApplyStatus::Unchanged
        } else if mode == WriteMode::Preview {
            ApplyStatus::Previewed
        } else {
            self.write(audio, &existing.tags, &outcome)?;
            ApplyStatus::Applied
        };

        match status {
            ApplyStatus::Applied => info!(
                audio = %audio.display(),
                changes = outcome.diff.len(),
                conflicts = outcome.warnings.len(),
                "Analysis persisted"
            ),
            _ => debug!(
                audio = %audio.display(),
                status = ?status,
                changes = outcome.diff.len(),
                "Analysis merge computed"
            ),
        }

        Ok(ItemOutcome {
            audio: audio.to_path_buf(),
            status,
            diff: outcome.diff,
            warnings: outcome.warnings,
        })
    }

    /// Current tags and side-record of `audio`
    pub fn read_state(&self, audio: &Path) -> Result<PersistedState, PersistenceError> {
        Ok(PersistedState {
            tags: self.tags.read(audio)?,
            side_record: self.side_records.read(audio)?,
        })
    }

    fn write(
        &self,
        audio: &Path,
        previous_tags: &TagSet,
        outcome: &MergeOutcome,
    ) -> Result<(), PersistenceError> {
        let mut txn = Transaction::begin(audio)?;
        match self.stage_all(&mut txn, audio, previous_tags, outcome) {
            Ok(()) => txn.commit(),
            Err(e) => {
                warn!(audio = %audio.display(), error = %e, "Staging failed, rolling back");
                txn.abort();
                Err(e)
            }
        }
    }

    fn stage_all(
        &self,
        txn: &mut Transaction,
        audio: &Path,
        previous_tags: &TagSet,
        outcome: &MergeOutcome,
    ) -> Result<(), PersistenceError> {
        if outcome.tags_changed() {
            if self.backup_tags {
                let backup = stores::with_suffix(audio, TAG_BACKUP_SUFFIX);
                txn.stage(&backup, |staged| {
                    let content = serde_json::to_string_pretty(previous_tags).map_err(|e| {
                        PersistenceError::TagStore {
                            path: staged.to_path_buf(),
                            message: e.to_string(),
                        }
                    })?;
                    std::fs::write(staged, content).map_err(|e| PersistenceError::io(staged, e))
                })?;
            }
            txn.stage(audio, |staged| {
                self.tags.stage(audio, staged, &outcome.state.tags)
            })?;
        }

        if outcome.side_record_changed() {
            let target = self.side_records.path_for(audio);
            txn.stage(&target, |staged| {
                self.side_records.stage(staged, &outcome.state.side_record)
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::decide;
    use crate::model::{AnalysisBundle, AnalysisField, FieldValue, Provenance};
    use crate::policy::PolicyRegistry;
    use tempfile::TempDir;

    fn coordinator() -> Coordinator {
        Coordinator::new(
            Arc::new(Id3TagStore::new()),
            Arc::new(JsonSideRecordStore::default()),
            TagConstraints::default(),
        )
        .with_locks(FileLocks::new())
    }

    fn audio(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("song.mp3");
        std::fs::write(&path, [0xFFu8, 0xFB, 0x90, 0x00, 0, 0, 0, 0]).unwrap();
        path
    }

    fn bpm_plan() -> WritePlan {
        let bundle: AnalysisBundle = [AnalysisField::new(
            "rhythm.bpm",
            FieldValue::Scalar(98.0),
            0.9,
            Provenance::new("essentia", "2.1"),
        )]
        .into_iter()
        .collect();
        decide(
            &bundle,
            &PolicyRegistry::with_defaults().unwrap(),
            &TagConstraints::default(),
        )
    }

    #[tokio::test]
    async fn test_preview_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let audio = audio(&dir);
        let before = std::fs::read(&audio).unwrap();

        let outcome = coordinator()
            .apply(&audio, &bpm_plan(), WriteMode::Preview)
            .await
            .unwrap();
        assert_eq!(outcome.status, ApplyStatus::Previewed);
        assert!(!outcome.diff.is_empty());
        assert_eq!(std::fs::read(&audio).unwrap(), before);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_apply_then_reapply_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let audio = audio(&dir);
        let coordinator = coordinator();

        let first = coordinator.apply(&audio, &bpm_plan(), WriteMode::Apply).await.unwrap();
        assert_eq!(first.status, ApplyStatus::Applied);
        let tags = Id3TagStore::new().read(&audio).unwrap();
        assert_eq!(tags.get("bpm").map(String::as_str), Some("98"));
        assert!(JsonSideRecordStore::default().path_for(&audio).exists());

        let second = coordinator.apply(&audio, &bpm_plan(), WriteMode::Apply).await.unwrap();
        assert_eq!(second.status, ApplyStatus::Unchanged);
    }

    #[tokio::test]
    async fn test_capacity_exceeded_before_write() {
        let dir = TempDir::new().unwrap();
        let audio = audio(&dir);
        let before = std::fs::read(&audio).unwrap();
        let coordinator = Coordinator::new(
            Arc::new(Id3TagStore::new()),
            Arc::new(JsonSideRecordStore::default()),
            TagConstraints {
                max_tags: 1,
                ..TagConstraints::default()
            },
        )
        .with_locks(FileLocks::new());

        let result = coordinator.apply(&audio, &bpm_plan(), WriteMode::Apply).await;
        assert!(matches!(
            result,
            Err(PersistenceError::CapacityExceeded { count: 2, max: 1 })
        ));
        assert_eq!(std::fs::read(&audio).unwrap(), before);
    }

    #[tokio::test]
    async fn test_apply_waits_for_other_process_lock() {
        let dir = TempDir::new().unwrap();
        let audio = audio(&dir);
        let before = std::fs::read(&audio).unwrap();
        let coordinator = coordinator().with_lock_wait(Duration::from_millis(100));

        let other_run = LockFile::acquire(&audio, Duration::ZERO, STALE_LOCK_AFTER).unwrap();
        let result = coordinator.apply(&audio, &bpm_plan(), WriteMode::Apply).await;
        assert!(matches!(result, Err(PersistenceError::Locked { .. })));
        assert_eq!(std::fs::read(&audio).unwrap(), before);

        // Preview never takes the lock file
        let preview = coordinator.apply(&audio, &bpm_plan(), WriteMode::Preview).await.unwrap();
        assert_eq!(preview.status, ApplyStatus::Previewed);

        drop(other_run);
        let applied = coordinator.apply(&audio, &bpm_plan(), WriteMode::Apply).await.unwrap();
        assert_eq!(applied.status, ApplyStatus::Applied);
        assert!(!LockFile::path_for(&audio).exists());
    }

    #[tokio::test]
    async fn test_backup_written_with_previous_tags() {
        let dir = TempDir::new().unwrap();
        let audio = audio(&dir);
        let coordinator = coordinator().with_tag_backup(true);

        coordinator.apply(&audio, &bpm_plan(), WriteMode::Apply).await.unwrap();
        let backup = stores::with_suffix(&audio, TAG_BACKUP_SUFFIX);
        let saved: TagSet = serde_json::from_str(&std::fs::read_to_string(backup).unwrap()).unwrap();
        assert!(saved.is_empty());
    }
}
