//! Batch tag application
//!
//! Runs every audio item through the complete pipeline (load input, derive,
//! decide, merge and persist) with a bounded number of concurrent workers.
//! A failing item is recorded and the run continues; the run always ends with
//! a per-item report.
//!
//! Analysis input for `song.mp3` is `song.mp3.bundle.json` when present,
//! otherwise the extractor report `song.mp3.report.json`.

use crate::classifiers::{self, ClassifierConfig};
use crate::constraints::TagConstraints;
use crate::engine::{decide, WritePlan};
use crate::model::{AnalysisBundle, BundleSource};
use crate::persistence::stores::with_suffix;
use crate::persistence::{ApplyStatus, Coordinator, WriteMode};
use crate::merge::{DiffEntry, MergeConflict};
use crate::policy::PolicyRegistry;
use crate::report;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Final state of one item in a batch run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Applied,
    Previewed,
    Unchanged,
    /// No analysis input, or cancelled before the write began
    Skipped,
    Failed,
}

impl From<ApplyStatus> for ItemStatus {
    fn from(status: ApplyStatus) -> Self {
        match status {
            ApplyStatus::Applied => ItemStatus::Applied,
            ApplyStatus::Previewed => ItemStatus::Previewed,
            ApplyStatus::Unchanged => ItemStatus::Unchanged,
        }
    }
}

/// Per-item line of the batch report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    pub audio: PathBuf,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<DiffEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<MergeConflict>,
    /// Failure or skip reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ItemReport {
    fn skipped(audio: &Path, message: impl Into<String>) -> Self {
        Self {
            audio: audio.to_path_buf(),
            status: ItemStatus::Skipped,
            diff: Vec::new(),
            warnings: Vec::new(),
            message: Some(message.into()),
        }
    }

    fn failed(audio: &Path, error: &anyhow::Error) -> Self {
        Self {
            audio: audio.to_path_buf(),
            status: ItemStatus::Failed,
            diff: Vec::new(),
            warnings: Vec::new(),
            message: Some(format!("{:#}", error)),
        }
    }
}

/// Outcome of a batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub mode: WriteMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    /// Sorted by audio path
    pub items: Vec<ItemReport>,
}

impl BatchSummary {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    pub fn failed(&self) -> usize {
        self.count(ItemStatus::Failed)
    }
}

/// Input resolution and pipeline settings shared by all workers
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub workers: usize,
    pub bundle_suffix: String,
    pub report_suffix: String,
}

/// Batch pipeline over a set of audio items
#[derive(Clone)]
pub struct BatchRunner {
    coordinator: Coordinator,
    registry: Arc<PolicyRegistry>,
    classifiers: Arc<ClassifierConfig>,
    constraints: TagConstraints,
    settings: BatchSettings,
}

impl BatchRunner {
    pub fn new(
        coordinator: Coordinator,
        registry: PolicyRegistry,
        classifiers: ClassifierConfig,
        constraints: TagConstraints,
        settings: BatchSettings,
    ) -> Self {
        Self {
            coordinator,
            registry: Arc::new(registry),
            classifiers: Arc::new(classifiers),
            constraints,
            settings,
        }
    }

    /// Process `items` and report on each
    ///
    /// Cancellation is checked before each item's write begins; items already
    /// writing run to completion.
    pub async fn run(
        &self,
        items: Vec<PathBuf>,
        mode: WriteMode,
        cancel_token: &CancellationToken,
    ) -> BatchSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let total = items.len();
        let workers = self.settings.workers.max(1);

        info!(
            run_id = %run_id,
            items = total,
            workers,
            mode = ?mode,
            "Batch run started"
        );

        let processed = Arc::new(AtomicUsize::new(0));

        let mut reports: Vec<ItemReport> = stream::iter(items)
            .map(|audio| {
                let runner = self.clone();
                let cancel_token = cancel_token.clone();
                let processed = Arc::clone(&processed);

                async move {
                    let report = runner.process_item(&audio, mode, &cancel_token).await;

                    let current = processed.fetch_add(1, Ordering::Relaxed) + 1;
                    if current % 10 == 0 || current == total {
                        info!(
                            run_id = %run_id,
                            progress = format!("{}/{}", current, total),
                            "Batch progress"
                        );
                    }
                    report
                }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        reports.sort_by(|a, b| a.audio.cmp(&b.audio));

        let summary = BatchSummary {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            cancelled: cancel_token.is_cancelled(),
            items: reports,
        };

        info!(
            run_id = %run_id,
            applied = summary.count(ItemStatus::Applied),
            previewed = summary.count(ItemStatus::Previewed),
            unchanged = summary.count(ItemStatus::Unchanged),
            skipped = summary.count(ItemStatus::Skipped),
            failed = summary.failed(),
            cancelled = summary.cancelled,
            "Batch run finished"
        );
        summary
    }

    async fn process_item(
        &self,
        audio: &Path,
        mode: WriteMode,
        cancel_token: &CancellationToken,
    ) -> ItemReport {
        if cancel_token.is_cancelled() {
            return ItemReport::skipped(audio, "cancelled");
        }

        let plan = match self.plan_for(audio).await {
            Ok(Some(plan)) => plan,
            Ok(None) => {
                warn!(audio = %audio.display(), "No analysis input found, skipping");
                return ItemReport::skipped(audio, "no analysis input");
            }
            Err(e) => {
                error!(audio = %audio.display(), error = ?e, "Item failed");
                return ItemReport::failed(audio, &e);
            }
        };

        // Last point at which the item may be abandoned
        if cancel_token.is_cancelled() {
            return ItemReport::skipped(audio, "cancelled");
        }

        match self.coordinator.apply(audio, &plan, mode).await {
            Ok(outcome) => {
                for conflict in &outcome.warnings {
                    warn!(
                        audio = %audio.display(),
                        key = %conflict.key,
                        reason = %conflict.reason,
                        "Merge conflict"
                    );
                }
                ItemReport {
                    audio: outcome.audio,
                    status: outcome.status.into(),
                    diff: outcome.diff,
                    warnings: outcome.warnings,
                    message: None,
                }
            }
            Err(e) => {
                let e = anyhow::Error::new(e).context("Persisting analysis failed");
                error!(audio = %audio.display(), error = ?e, "Item failed");
                ItemReport::failed(audio, &e)
            }
        }
    }

    /// Load the item's analysis input, derive and decide; `None` without input
    pub async fn plan_for(&self, audio: &Path) -> Result<Option<WritePlan>> {
        let runner = self.clone();
        let audio = audio.to_path_buf();
        tokio::task::spawn_blocking(move || runner.plan_blocking(&audio))
            .await
            .context("Planning task failed")?
    }

    fn plan_blocking(&self, audio: &Path) -> Result<Option<WritePlan>> {
        let Some(bundle) = self.load_input(audio)? else {
            return Ok(None);
        };
        let extended = classifiers::derive(&bundle, &self.classifiers);
        let plan = decide(&extended, &self.registry, &self.constraints);
        debug!(
            audio = %audio.display(),
            fields = extended.len(),
            entries = plan.entries.len(),
            "Write plan computed"
        );
        Ok(Some(plan))
    }

    fn load_input(&self, audio: &Path) -> Result<Option<AnalysisBundle>> {
        let bundle_path = with_suffix(audio, &self.settings.bundle_suffix);
        if bundle_path.exists() {
            let mut bundle = AnalysisBundle::load(&bundle_path)
                .with_context(|| format!("Loading bundle {}", bundle_path.display()))?;
            bundle.source.audio.get_or_insert_with(|| audio.to_path_buf());
            return Ok(Some(bundle));
        }

        let report_path = with_suffix(audio, &self.settings.report_suffix);
        if report_path.exists() {
            let source = BundleSource {
                audio: Some(audio.to_path_buf()),
                sha256: None,
            };
            let bundle = report::import_report(&report_path, source)
                .with_context(|| format!("Importing report {}", report_path.display()))?;
            return Ok(Some(bundle));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_BUNDLE_SUFFIX, DEFAULT_REPORT_SUFFIX};
    use crate::model::{AnalysisField, FieldValue, Provenance};
    use crate::persistence::{FileLocks, Id3TagStore, JsonSideRecordStore};
    use tempfile::TempDir;

    fn runner() -> BatchRunner {
        let coordinator = Coordinator::new(
            Arc::new(Id3TagStore::new()),
            Arc::new(JsonSideRecordStore::default()),
            TagConstraints::default(),
        )
        .with_locks(FileLocks::new());
        BatchRunner::new(
            coordinator,
            PolicyRegistry::with_defaults().unwrap(),
            ClassifierConfig::default(),
            TagConstraints::default(),
            BatchSettings {
                workers: 2,
                bundle_suffix: DEFAULT_BUNDLE_SUFFIX.to_string(),
                report_suffix: DEFAULT_REPORT_SUFFIX.to_string(),
            },
        )
    }

    fn audio(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, [0xFFu8, 0xFB, 0x90, 0x00, 0, 0, 0, 0]).unwrap();
        path
    }

    fn write_bundle(audio: &Path) {
        let bundle: AnalysisBundle = [AnalysisField::new(
            "rhythm.bpm",
            FieldValue::Scalar(128.0),
            0.9,
            Provenance::new("essentia", "2.1"),
        )]
        .into_iter()
        .collect();
        bundle.save(&with_suffix(audio, DEFAULT_BUNDLE_SUFFIX)).unwrap();
    }

    #[tokio::test]
    async fn test_items_without_input_are_skipped() {
        let dir = TempDir::new().unwrap();
        let with_input = audio(&dir, "a.mp3");
        let without = audio(&dir, "b.mp3");
        write_bundle(&with_input);

        let summary = runner()
            .run(
                vec![without.clone(), with_input.clone()],
                WriteMode::Preview,
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(summary.items[0].audio, with_input);
        assert_eq!(summary.items[0].status, ItemStatus::Previewed);
        assert_eq!(summary.items[1].status, ItemStatus::Skipped);
        assert!(!summary.cancelled);
    }

    #[tokio::test]
    async fn test_report_input_is_imported() {
        let dir = TempDir::new().unwrap();
        let song = audio(&dir, "a.mp3");
        std::fs::write(
            with_suffix(&song, DEFAULT_REPORT_SUFFIX),
            r#"{"analysis": {"rhythm": {"bpm": 90.0, "beats_confidence": 5.0}}}"#,
        )
        .unwrap();

        let plan = runner().plan_for(&song).await.unwrap().unwrap();
        assert!(plan.written_tags().any(|(k, v)| k == "bpm" && v == "90"));
    }

    #[tokio::test]
    async fn test_malformed_bundle_fails_item_only() {
        let dir = TempDir::new().unwrap();
        let bad = audio(&dir, "a.mp3");
        let good = audio(&dir, "b.mp3");
        std::fs::write(with_suffix(&bad, DEFAULT_BUNDLE_SUFFIX), "{ nope").unwrap();
        write_bundle(&good);

        let summary = runner()
            .run(vec![bad, good], WriteMode::Apply, &CancellationToken::new())
            .await;
        assert_eq!(summary.items[0].status, ItemStatus::Failed);
        assert!(summary.items[0].message.is_some());
        assert_eq!(summary.items[1].status, ItemStatus::Applied);
    }

    #[tokio::test]
    async fn test_cancelled_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let song = audio(&dir, "a.mp3");
        write_bundle(&song);
        let before = std::fs::read(&song).unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let summary = runner().run(vec![song.clone()], WriteMode::Apply, &token).await;

        assert!(summary.cancelled);
        assert_eq!(summary.count(ItemStatus::Skipped), 1);
        assert_eq!(std::fs::read(&song).unwrap(), before);
    }
}
