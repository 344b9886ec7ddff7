use std::sync::Arc;

use anyhow::{Context, Result};
use skyqueue_core::queue::StorageQueueClient;
use skyqueue_core::Settings;
use skyqueue_tools::{MockWeather, Worker};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Configuration
    dotenvy::dotenv().ok();
    let settings = Settings::from_env().context("invalid configuration")?;

    // 2. Logging Setup
    tracing_subscriber::fmt()
        .with_max_level(settings.log_level)
        .with_target(false)
        .compact()
        .init();

    info!(account = settings.storage.name(), "GetWeather worker initializing...");

    // 3. Queue client + worker; make sure all three queues exist
    let queue = Arc::new(
        StorageQueueClient::new(settings.storage.clone(), settings.encoding, &settings.http)
            .context("failed to build queue client")?,
    );
    let worker = Worker::new(queue, Arc::new(MockWeather), settings.queues.clone(), settings.worker);
    worker.prepare().await.context("failed to create queues")?;

    // 4. Ctrl-C stops the poll loop between batches
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        on_signal.cancel();
    });

    worker.run(cancel).await;
    Ok(())
}
