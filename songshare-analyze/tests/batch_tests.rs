//! Batch runs over a directory of audio items with extractor reports

use songshare_analyze::batch::{BatchRunner, BatchSettings, ItemStatus};
use songshare_analyze::config::EngineConfig;
use songshare_analyze::persistence::stores::with_suffix;
use songshare_analyze::persistence::{
    Coordinator, FileLocks, Id3TagStore, JsonSideRecordStore, TagStore, WriteMode,
};
use songshare_analyze::scanner::AudioScanner;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const REPORT: &str = r#"{
    "provenance": {"tool": "essentia", "version": "2.1b6"},
    "analysis": {
        "rhythm": {
            "bpm": 120.2,
            "beats": [0.0, 0.500, 1.001, 1.499, 2.000],
            "beats_confidence": 4.8
        },
        "tonal": {"key": "E minor", "key_strength": 0.91}
    },
    "semantic": {"mood": {"energetic": 0.78, "relaxed": 0.12}}
}"#;

fn runner(config: &EngineConfig) -> BatchRunner {
    let coordinator = Coordinator::new(
        Arc::new(Id3TagStore::new()),
        Arc::new(JsonSideRecordStore::new(config.engine.side_record_suffix.clone())),
        config.constraints.clone(),
    )
    .with_locks(FileLocks::new());
    BatchRunner::new(
        coordinator,
        config.registry().unwrap(),
        config.classifiers.clone(),
        config.constraints.clone(),
        BatchSettings {
            workers: config.engine.workers,
            bundle_suffix: config.engine.bundle_suffix.clone(),
            report_suffix: config.engine.report_suffix.clone(),
        },
    )
}

fn library(dir: &TempDir, count: usize) -> Vec<PathBuf> {
    let album = dir.path().join("album");
    std::fs::create_dir(&album).unwrap();
    (0..count)
        .map(|i| {
            let audio = album.join(format!("track{:02}.mp3", i));
            std::fs::write(&audio, [0xFFu8, 0xFB, 0x90, 0x00, 0, 0, 0, 0]).unwrap();
            std::fs::write(with_suffix(&audio, ".report.json"), REPORT).unwrap();
            audio
        })
        .collect()
}

fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<_> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.path().to_path_buf(), std::fs::read(e.path()).unwrap()))
        .collect();
    files.sort();
    files
}

#[tokio::test]
async fn test_preview_then_apply_then_idempotent() {
    let dir = TempDir::new().unwrap();
    let tracks = library(&dir, 6);
    let config = EngineConfig::default();
    let runner = runner(&config);

    let items = AudioScanner::new(true)
        .collect(&[dir.path().to_path_buf()])
        .unwrap();
    assert_eq!(items, tracks);

    let before = snapshot(dir.path());
    let preview = runner
        .run(items.clone(), WriteMode::Preview, &CancellationToken::new())
        .await;
    assert_eq!(preview.count(ItemStatus::Previewed), 6);
    assert_eq!(snapshot(dir.path()), before);

    let applied = runner
        .run(items.clone(), WriteMode::Apply, &CancellationToken::new())
        .await;
    assert_eq!(applied.count(ItemStatus::Applied), 6);
    assert_eq!(applied.failed(), 0);

    let tags = Id3TagStore::new().read(&tracks[0]).unwrap();
    assert_eq!(tags.get("bpm").map(String::as_str), Some("120"));
    assert_eq!(tags.get("key").map(String::as_str), Some("E minor"));
    assert_eq!(tags.get("rhythm_timing").map(String::as_str), Some("clicktrack"));
    assert_eq!(tags.get("mood_energetic").map(String::as_str), Some("0.78"));
    assert!(!tags.contains_key("mood_relaxed"));
    assert!(with_suffix(&tracks[0], ".analysis.json").exists());

    let after_apply = snapshot(dir.path());
    let again = runner
        .run(items, WriteMode::Apply, &CancellationToken::new())
        .await;
    assert_eq!(again.count(ItemStatus::Unchanged), 6);
    assert_eq!(snapshot(dir.path()), after_apply);
}

#[tokio::test]
async fn test_summary_is_sorted_and_complete() {
    let dir = TempDir::new().unwrap();
    let tracks = library(&dir, 9);
    let mut config = EngineConfig::default();
    config.engine.workers = 3;

    let mut shuffled = tracks.clone();
    shuffled.reverse();
    let summary = runner(&config)
        .run(shuffled, WriteMode::Preview, &CancellationToken::new())
        .await;

    let reported: Vec<PathBuf> = summary.items.iter().map(|i| i.audio.clone()).collect();
    assert_eq!(reported, tracks);
    assert!(summary.finished_at >= summary.started_at);
}
