//! trapsyncd - camera-trap synchronization + extraction daemon
//!
//! This daemon:
//! 1. Accepts the two vision-pipeline streams (high-res frames, tracker
//!    batches) from the configured sources
//! 2. Matches each tracker batch to its high-resolution frame by the fixed
//!    cadence ratio
//! 3. Crops every tracked detection out of the matched frame
//! 4. Persists crops and one metadata row per crop under a recording
//!    session directory
//!
//! Camera hardware delivery is an external boundary; the built-in stub://
//! sources replay the device cadence synthetically.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use trapsync::{
    run_pipeline, PipelineConfig, PipelineStats, SyntheticFrameSource, SyntheticTrackerSource,
};

#[derive(Parser, Debug)]
#[command(name = "trapsyncd", about = "Camera-trap stream synchronization daemon")]
struct Args {
    /// JSON config file.
    #[arg(long, env = "TRAPSYNC_CONFIG")]
    config: Option<PathBuf>,
    /// Override the configured output directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Stop after this many low-res cycles instead of running until ctrl-c.
    #[arg(long)]
    cycles: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = PipelineConfig::load_from(args.config.as_deref())?;
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(cycles) = args.cycles {
        config.source.cycles = Some(cycles);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_shutdown.store(true, Ordering::SeqCst);
    })?;

    let frame_source = SyntheticFrameSource::new(&config.source, config.ratio)?;
    let tracker_source = SyntheticTrackerSource::new(&config.source)?;

    log::info!(
        "trapsyncd running: ratio={} frame_index={} source={} output={}",
        config.ratio,
        config.frame_index_capacity,
        config.source.uri,
        config.output_dir.display()
    );

    let stats = Arc::new(PipelineStats::default());
    let summary = run_pipeline(
        &config,
        Box::new(frame_source),
        Box::new(tracker_source),
        shutdown,
        stats,
    )?;

    log::info!(
        "wrote {} crops ({} skipped, {} record failures) under {}",
        summary.stats.crops_written,
        summary.stats.degenerate_skips,
        summary.stats.record_failures,
        summary.session_dir.display()
    );
    Ok(())
}
