//! Drives a [`stream_control::Session`] with a simulated lossy link.

use anyhow::Context;
use clap::Parser;
use stream_control::{simulation, FrameType, SessionConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    /// JSON configuration of the session and the simulated link
    #[clap(parse(from_os_str))]
    config: Option<std::path::PathBuf>,

    /// Seed of the simulated link, overrides the configuration
    #[clap(short, long)]
    seed: Option<u64>,

    /// Simulated seconds, overrides the configuration
    #[clap(short, long)]
    duration_secs: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(seed) = args.seed {
        config.simulation.seed = seed;
    }
    if let Some(duration_secs) = args.duration_secs {
        config.simulation.duration_secs = duration_secs;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_deref().unwrap_or("info")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    let report = simulation::run(&config).context("Simulation failed")?;

    tracing::info!(
        "Simulated {} frames, {} lost, {} packets sent, {} aborted",
        report.frames,
        report.frames_lost,
        report.packets_sent,
        report.packets_aborted
    );
    for frame_type in [
        FrameType::Intra,
        FrameType::Normal,
        FrameType::CreateLongTerm,
        FrameType::ReferLongTerm,
    ] {
        tracing::info!(
            "{:?} frames: {}",
            frame_type,
            report.actions.get(&frame_type).copied().unwrap_or(0)
        );
    }
    for (stat, summary) in &report.statistics {
        tracing::info!(
            "{}: {} samples, avg {:.4}, min {:.4}, max {:.4}",
            stat.name(),
            summary.count,
            summary.average(),
            summary.min,
            summary.max
        );
    }

    Ok(())
}
