pub mod routes;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::gateway::LlmGateway;
use crate::registry::SessionRegistry;
use crate::storage::ConversationStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: SessionRegistry,
    pub store: ConversationStore,
    pub gateway: Arc<LlmGateway>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/conversation/new", post(routes::new_conversation))
        .route("/conversation/send", post(routes::send_message))
        .route("/conversation/compare", post(routes::compare))
        .route("/conversation/compare-stream", post(routes::compare_stream))
        .route("/conversation/clear-context", post(routes::clear_context))
        .route("/conversation/end", post(routes::end_conversation))
        .route("/conversation/restore", post(routes::restore_conversation))
        .route("/conversation/export/:id", get(routes::export_conversation))
        .route("/conversations/list", get(routes::list_conversations))
        .route("/conversations/load/:id", get(routes::load_conversation))
        .route("/models/list", get(routes::list_models))
        .route("/upload", post(routes::upload_file))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API until interrupted.
pub async fn run(state: AppState, port: u16) -> Result<()> {
    let app = build_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to install shutdown handler: {}", e);
    } else {
        tracing::info!("Shutting down");
    }
}
