//! Migrate a v1 framebot working directory into the v2 ledger format.
//!
//! Reads the bot configuration the same way the main binary does, so the
//! migrated captions and file names match what the running bot will use.
//!
//! Usage: framebot-migrate <v1-working-dir>

use anyhow::{Context, Result};
use framebot::config::Config;
use framebot::frames::FrameSource;
use framebot::migration::{self, MigrationOptions};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(source_dir) = args.get(1).map(PathBuf::from) else {
        eprintln!("Usage: {} <v1-working-dir>", args[0]);
        std::process::exit(2);
    };

    let config = Config::load().context("Failed to load configuration")?;
    init_tracing(&config.service.log_level);

    // Reconstructed captions say "Frame n of total"; take the total from the
    // frames directory, or fall back to the watermark when it is gone
    let total_frames = FrameSource::new(
        config.bot.frames_directory.clone(),
        &config.bot.frames_naming,
        &config.bot.frames_ext,
    )
    .context("Failed to compile the frame naming pattern")?
    .total_frames()
    .unwrap_or_else(|e| {
        warn!(error = %e, "Frames directory not readable, caption totals come from the watermark");
        0
    });

    let options = MigrationOptions {
        movie_title: config.bot.movie_title.clone(),
        frames_naming: config.bot.frames_naming.clone(),
        frames_ext: config.bot.frames_ext.clone(),
        total_frames,
    };

    let report = migration::migrate_v1(&source_dir, &config.ledger_path(), &options)
        .context("Migration failed, the v1 directory was left untouched")?;

    info!(
        posted = report.posted,
        evaluated = report.evaluated,
        ledger = %config.ledger_path().display(),
        "Migration complete"
    );
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();
}
