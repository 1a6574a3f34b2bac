use anyhow::{Context, Result};
use framebot::best_of::BestOfEvaluator;
use framebot::config::Config;
use framebot::frames::FrameSource;
use framebot::gateway::FacebookGateway;
use framebot::ledger::Ledger;
use framebot::scheduler::PostingScheduler;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::load().context("Failed to load configuration")?);

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        movie = %config.bot.movie_title,
        "Starting framebot"
    );

    // Initialize components
    let ledger = Arc::new(
        Ledger::load(config.ledger_path()).context("Failed to load the posting ledger")?,
    );

    let gateway = Arc::new(
        FacebookGateway::new(&config.facebook).context("Failed to initialize the Graph API gateway")?,
    );

    let source = FrameSource::new(
        config.bot.frames_directory.clone(),
        &config.bot.frames_naming,
        &config.bot.frames_ext,
    )
    .context("Failed to compile the frame naming pattern")?;

    let shutdown = CancellationToken::new();
    // Fired by the scheduler when the frame source runs dry, so the
    // evaluator knows to drain and exit instead of polling forever
    let posting_done = CancellationToken::new();

    // Spawn posting scheduler task
    let scheduler = PostingScheduler::new(gateway.clone(), ledger.clone(), source, config.clone());
    let scheduler_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        let posting_done = posting_done.clone();
        async move {
            if let Err(e) = scheduler.run(shutdown, posting_done.clone()).await {
                error!(error = %e, "Posting scheduler error");
            }
            // Fired on natural completion inside run(); repeated on the
            // error path too so nothing waits on a dead scheduler
            posting_done.cancel();
        }
    });

    // Spawn best-of evaluator task, if enabled
    let evaluator_handle = if config.best_of.enabled {
        let evaluator = BestOfEvaluator::new(gateway.clone(), ledger.clone(), config.clone());
        let shutdown = shutdown.clone();
        let posting_done = posting_done.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = evaluator.run(shutdown, posting_done).await {
                error!(error = %e, "Best-of evaluator error");
            }
        }))
    } else {
        None
    };

    info!("Framebot started successfully");

    // Run until the frame source is exhausted or a shutdown signal arrives
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutting down framebot");
            shutdown.cancel();
        }
        _ = posting_done.cancelled() => {
            info!("Posting finished, waiting for best-of evaluation to drain");
        }
    }

    // Both loops honor the tokens at their sleep points; wait them out
    let _ = scheduler_handle.await;
    if let Some(evaluator_handle) = evaluator_handle {
        let _ = evaluator_handle.await;
    }

    info!("Framebot stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
