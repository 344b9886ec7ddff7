mod api;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use skyqueue_core::{
    credential, AgentService, Conversation, HttpAgentService, Runtime, SessionFactory, Settings,
    ToolDescriptor,
};
use tokio::net::TcpListener;
use tracing::info;

use crate::routes::{router, AppState};

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

    info!(endpoint = %settings.project_endpoint, "skyqueue gateway initializing...");

    // 3. Agent service client, with the GetWeather tool it will be handed
    let tool = ToolDescriptor::get_weather(&settings.storage, &settings.queues);
    let token = credential::from_settings(settings.access_token.as_ref());
    let service: Arc<dyn AgentService> = Arc::new(
        HttpAgentService::new(&settings.project_endpoint, &settings.api_version, token, &settings.http)
            .context("failed to build agent service client")?,
    );

    // 4. Session factory (registers the agent now under the shared policy)
    let factory = Arc::new(
        SessionFactory::new(service, &settings.agent, &tool, settings.session_policy)
            .context("invalid GetWeather tool descriptor")?,
    );
    factory
        .prepare()
        .await
        .context("failed to register the shared agent")?;
    info!(policy = ?factory.policy(), tool = %tool.name, "session factory ready");

    // 5. Bundle State + Routes
    let conversation = Arc::new(Conversation::new(Arc::clone(&factory), Runtime::new(settings.poll)));
    if settings.server.function_key.is_none() {
        info!("no FUNCTION_KEY set; /prompt is open");
    }
    let app = router(AppState::new(conversation, settings.server.function_key.clone()));

    // 6. Start Server
    let listener = TcpListener::bind(&settings.server.bind_address)
        .await
        .with_context(|| format!("cannot bind {}", settings.server.bind_address))?;
    info!(address = %settings.server.bind_address, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // 7. Release the shared agent, if any
    factory.shutdown().await;
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown requested");
    }
}
