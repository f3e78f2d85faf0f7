//! songshare-analyze command-line interface
//!
//! ```bash
//! songshare-analyze analyze --report song.mp3.report.json --audio song.mp3
//! songshare-analyze plan song.mp3
//! songshare-analyze apply-tags -r ~/Music            # preview (default)
//! songshare-analyze apply-tags -r ~/Music --dry-run  # same, explicitly
//! songshare-analyze apply-tags -r ~/Music --apply --yes
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use songshare_analyze::batch::{BatchRunner, BatchSettings, BatchSummary, ItemStatus};
use songshare_analyze::classifiers;
use songshare_analyze::config::EngineConfig;
use songshare_analyze::model::BundleSource;
use songshare_analyze::persistence::stores::with_suffix;
use songshare_analyze::persistence::{Coordinator, Id3TagStore, JsonSideRecordStore, WriteMode};
use songshare_analyze::report;
use songshare_analyze::scanner::AudioScanner;
use songshare_common::checksum::sha256_file;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Analysis aggregation and tag decision engine
#[derive(Parser, Debug)]
#[clap(name = "songshare-analyze", version)]
#[clap(about = "Decide which analysis results become audio tags")]
struct Cli {
    /// Configuration file (overrides SONGSHARE_CONFIG)
    #[clap(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging
    #[clap(short, long, global = true)]
    verbose: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert an extractor report into an analysis bundle with derived fields
    Analyze {
        /// Extractor JSON report
        #[clap(long, value_name = "FILE")]
        report: PathBuf,

        /// Audio file the report describes (recorded with its checksum)
        #[clap(long, value_name = "FILE")]
        audio: Option<PathBuf>,

        /// Bundle output path (default: `<audio>.bundle.json`, else stdout)
        #[clap(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Print the write plan for one audio file
    Plan {
        /// Audio file with a bundle or report next to it
        audio: PathBuf,
    },

    /// Merge analysis into tags and side-records
    ApplyTags {
        /// Audio files or directories
        #[clap(required = true)]
        paths: Vec<PathBuf>,

        /// Descend into subdirectories
        #[clap(short, long)]
        recursive: bool,

        /// Show what would change without writing (default)
        #[clap(long, visible_alias = "dry-run", conflicts_with = "apply")]
        preview: bool,

        /// Write changes; requires --yes
        #[clap(long)]
        apply: bool,

        /// Confirm --apply
        #[clap(long)]
        yes: bool,

        /// Print the batch summary as JSON
        #[clap(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = EngineConfig::load(cli.config.as_deref()).context("Configuration rejected")?;
    init_logging(&config, cli.verbose)?;
    info!(version = env!("CARGO_PKG_VERSION"), "songshare-analyze starting");

    match cli.command {
        Command::Analyze {
            report,
            audio,
            output,
        } => analyze(&config, &report, audio.as_deref(), output.as_deref()),
        Command::Plan { audio } => plan(&config, &audio).await,
        Command::ApplyTags {
            paths,
            recursive,
            preview,
            apply,
            yes,
            json,
        } => apply_tags(&config, &paths, recursive, write_mode(preview, apply, yes), json).await,
    }
}

/// Only `--apply --yes` writes; everything else previews
fn write_mode(preview: bool, apply: bool, yes: bool) -> RequestedMode {
    match (preview, apply, yes) {
        (false, true, true) => RequestedMode::Apply,
        (false, true, false) => RequestedMode::Unconfirmed,
        _ => RequestedMode::Preview,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestedMode {
    Preview,
    /// `--apply` without `--yes`: preview, then fail
    Unconfirmed,
    Apply,
}

/// RUST_LOG wins; otherwise the configured level, raised to debug by `-v`
fn init_logging(config: &EngineConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Opening log file {}", path.display()))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

fn analyze(
    config: &EngineConfig,
    report_path: &Path,
    audio: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    let sha256 = audio
        .map(sha256_file)
        .transpose()
        .context("Checksumming audio failed")?;
    let source = BundleSource {
        audio: audio.map(Path::to_path_buf),
        sha256,
    };

    let bundle = report::import_report(report_path, source)?;
    let bundle = classifiers::derive(&bundle, &config.classifiers);

    let output = output
        .map(Path::to_path_buf)
        .or_else(|| audio.map(|a| with_suffix(a, &config.engine.bundle_suffix)));
    match output {
        Some(path) => {
            bundle.save(&path)?;
            info!(bundle = %path.display(), fields = bundle.len(), "Bundle written");
        }
        None => println!("{}", serde_json::to_string_pretty(&bundle)?),
    }
    Ok(())
}

async fn plan(config: &EngineConfig, audio: &Path) -> Result<()> {
    let runner = batch_runner(config)?;
    let plan = runner
        .plan_for(audio)
        .await?
        .with_context(|| format!("No bundle or report found for {}", audio.display()))?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn apply_tags(
    config: &EngineConfig,
    paths: &[PathBuf],
    recursive: bool,
    requested: RequestedMode,
    json: bool,
) -> Result<()> {
    let items = AudioScanner::new(recursive).collect(paths)?;

    let mode = match requested {
        RequestedMode::Apply => WriteMode::Apply,
        RequestedMode::Preview | RequestedMode::Unconfirmed => WriteMode::Preview,
    };
    info!(items = items.len(), mode = ?mode, "Tag run starting");

    let cancel_token = CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing items already writing");
            ctrl_c_token.cancel();
        }
    });

    let summary = batch_runner(config)?
        .run(items, mode, &cancel_token)
        .await;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    if requested == RequestedMode::Unconfirmed {
        anyhow::bail!("--apply requires --yes; nothing was written (preview shown above)");
    }
    if summary.failed() > 0 {
        anyhow::bail!("{} item(s) failed", summary.failed());
    }
    Ok(())
}

fn batch_runner(config: &EngineConfig) -> Result<BatchRunner> {
    let coordinator = Coordinator::new(
        Arc::new(Id3TagStore::new()),
        Arc::new(JsonSideRecordStore::new(config.engine.side_record_suffix.clone())),
        config.constraints.clone(),
    )
    .with_tag_backup(config.engine.backup_tags);

    Ok(BatchRunner::new(
        coordinator,
        config.registry()?,
        config.classifiers.clone(),
        config.constraints.clone(),
        BatchSettings {
            workers: config.engine.workers,
            bundle_suffix: config.engine.bundle_suffix.clone(),
            report_suffix: config.engine.report_suffix.clone(),
        },
    ))
}

fn print_summary(summary: &BatchSummary) {
    for item in &summary.items {
        let status = match item.status {
            ItemStatus::Applied => "applied",
            ItemStatus::Previewed => "would change",
            ItemStatus::Unchanged => "unchanged",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Failed => "FAILED",
        };
        match &item.message {
            Some(message) => println!("{}: {} ({})", item.audio.display(), status, message),
            None => println!("{}: {}", item.audio.display(), status),
        }
        for change in &item.diff {
            let old = change.old.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".into());
            let new = change.new.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".into());
            println!("    {:?}: {} -> {} [{}]", change.target, old, new, change.reason);
        }
        for conflict in &item.warnings {
            println!("    kept {}={} ({})", conflict.key, conflict.existing, conflict.reason);
        }
    }

    println!(
        "{} applied, {} to change, {} unchanged, {} skipped, {} failed{}",
        summary.count(ItemStatus::Applied),
        summary.count(ItemStatus::Previewed),
        summary.count(ItemStatus::Unchanged),
        summary.count(ItemStatus::Skipped),
        summary.failed(),
        if summary.cancelled { " (cancelled)" } else { "" },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn requested(args: &[&str]) -> RequestedMode {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::ApplyTags {
                preview, apply, yes, ..
            } => write_mode(preview, apply, yes),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_preview_is_default_and_dry_run_is_an_alias() {
        let base = ["songshare-analyze", "apply-tags", "music"];
        assert_eq!(requested(&base), RequestedMode::Preview);
        assert_eq!(
            requested(&["songshare-analyze", "apply-tags", "--dry-run", "music"]),
            RequestedMode::Preview
        );
        assert_eq!(
            requested(&["songshare-analyze", "apply-tags", "--preview", "--yes", "music"]),
            RequestedMode::Preview
        );
    }

    #[test]
    fn test_apply_needs_confirmation() {
        assert_eq!(
            requested(&["songshare-analyze", "apply-tags", "--apply", "music"]),
            RequestedMode::Unconfirmed
        );
        assert_eq!(
            requested(&["songshare-analyze", "apply-tags", "--apply", "--yes", "music"]),
            RequestedMode::Apply
        );
    }

    #[test]
    fn test_dry_run_conflicts_with_apply() {
        let parsed = Cli::try_parse_from([
            "songshare-analyze",
            "apply-tags",
            "--dry-run",
            "--apply",
            "music",
        ]);
        assert!(parsed.is_err());
    }
}
