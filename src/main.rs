mod compare;
mod config;
mod error;
mod gateway;
mod models;
mod registry;
mod server;
mod storage;

use std::sync::Arc;

use config::Config;
use gateway::LlmGateway;
use registry::SessionRegistry;
use server::AppState;
use storage::ConversationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();

    let log_dir = config.logs_dir();
    std::fs::create_dir_all(&log_dir)?;

    // Console + daily-rotated file logging
    let file_appender = tracing_appender::rolling::daily(&log_dir, "chatledger.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(true)
                .with_target(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(non_blocking),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let store = ConversationStore::init(&config)?;

    tracing::info!("chatledger starting");
    tracing::info!("Server: http://127.0.0.1:{}", config.port);
    tracing::info!("Ollama host: {}", config.ollama_host);
    tracing::info!("Default model: {}", config.default_model);
    tracing::info!(
        "Context window: {} turns (0 = unlimited)",
        config.context_window_size
    );
    tracing::info!("Data directory: {:?}", config.data_dir);

    let state = AppState {
        gateway: Arc::new(LlmGateway::new(&config)),
        registry: SessionRegistry::new(),
        store,
        config: Arc::new(config),
    };

    let port = state.config.port;
    server::run(state, port).await
}
