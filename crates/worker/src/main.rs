use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clusterflow_worker::config::WorkerConfig;
use clusterflow_worker::services::Services;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "clusterflow_worker=info,clusterflow_pipeline=info,clusterflow_cluster=info,clusterflow_events=info".into()
    });
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // --- Configuration ---
    let config = WorkerConfig::from_env()?;
    tracing::info!(
        role = ?config.role,
        destination_bucket = %config.destination_bucket,
        steps = config.steps.len(),
        max_dispatch_attempts = config.max_dispatch_attempts,
        "Loaded worker configuration"
    );

    // --- Services ---
    let services = Services::connect(config).await?;
    let cancel = CancellationToken::new();
    let tasks = services.spawn(&cancel);

    // --- Shutdown ---
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    cancel.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
    services.shutdown().await;

    tracing::info!("Worker stopped");
    Ok(())
}
