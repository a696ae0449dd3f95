use anyhow::Result;
use tagsync::app::App;
use tagsync::config::Config;
use tagsync::{scheduler, server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tagsync=info".parse()?),
        )
        .init();

    info!("Starting tagsync service");

    // Load configuration from environment
    let config = Config::from_env()?;
    if let Err(e) = config.validate_translation() {
        warn!("Translation jobs will fail until configured: {}", e);
    }
    let port = config.port;
    let app = App::from_config(config)?;

    let shutdown = CancellationToken::new();

    // Step 1: Periodic tagging, purge and queue polling
    let mut scheduler = scheduler::start_scheduler(app.clone(), shutdown.child_token()).await?;

    // Step 2: Status API
    let server = tokio::spawn(server::serve(app, port, shutdown.clone()));

    // Step 3: Wait for Ctrl-C, then stop everything
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, interrupting running jobs");
    shutdown.cancel();

    if let Err(e) = scheduler.shutdown().await {
        error!("Scheduler shutdown failed: {}", e);
    }
    match server.await {
        Ok(Err(e)) => error!("Status API failed: {:#}", e),
        Err(e) => error!("Status API task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Stopped");
    Ok(())
}
