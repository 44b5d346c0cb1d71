use std::path::PathBuf;
use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use dubsync::progress::ProgressUpdate;
use dubsync::utils::init_logger;
use dubsync::{DubSync, DubSyncConfig};

/// Dub a subtitle file with per-cue duration calibration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subtitle file (WebVTT or SRT)
    cues: PathBuf,

    /// Output WAV file
    #[arg(short, long)]
    output: PathBuf,

    /// Duration of the original audio in seconds (defaults to last cue end plus pad)
    #[arg(short = 't', long)]
    target_duration: Option<f64>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Calibration cache file for warm starts
    #[arg(long)]
    cache: Option<PathBuf>,

    /// Voice identifier passed to the synthesis engine
    #[arg(long)]
    voice: Option<String>,

    /// Where to write the run report (.json for JSON, otherwise text)
    #[arg(short, long)]
    report: Option<PathBuf>,

    /// Directory for intermediate clips
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Keep intermediate clips after the run
    #[arg(long)]
    keep_artifacts: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<DubSyncConfig> {
    let mut config = match &cli.config {
        Some(path) => DubSyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DubSyncConfig::default(),
    };
    if let Some(cache) = &cli.cache {
        config.cache_path = Some(cache.clone());
    }
    if let Some(voice) = &cli.voice {
        config.synthesis.voice = voice.clone();
    }
    if let Some(dir) = &cli.work_dir {
        config.work_dir = Some(dir.clone());
    }
    config.keep_artifacts |= cli.keep_artifacts;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let config = load_config(&cli)?;
    let (tx, mut rx) = tokio::sync::mpsc::channel::<ProgressUpdate>(64);
    let dubsync = DubSync::new(config)
        .context("Failed to initialise synthesis pipeline")?
        .with_progress(tx);

    let cancel = dubsync.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current segment");
            cancel.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(update) = rx.recv().await {
            match update {
                ProgressUpdate::IterationStarted { iteration, max_iterations, global_scale } => {
                    eprintln!("Iteration {}/{} (scale {:.3})", iteration, max_iterations, global_scale);
                }
                ProgressUpdate::SegmentFinished { index, total, accepted, attempts } => {
                    eprintln!(
                        "  segment {}/{} {} after {} tries",
                        index,
                        total,
                        if accepted { "ok" } else { "SILENCE" },
                        attempts
                    );
                }
                _ => {}
            }
        }
    });

    let result = dubsync
        .process(&cli.cues, &cli.output, cli.target_duration)
        .await;
    drop(dubsync);
    let _ = printer.await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("Dubbing failed: {}", e);
            return Err(e).with_context(|| format!("Failed to dub {}", cli.cues.display()));
        }
    };

    println!("{}", report);

    let json_path = cli.output.with_extension("report.json");
    report
        .save(&json_path)
        .with_context(|| format!("Failed to write report {}", json_path.display()))?;
    if let Some(path) = &cli.report {
        report
            .save(path)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
    }
    info!("Report saved to {}", json_path.display());

    Ok(())
}
