use crate::cli::Args;
use crate::gateway::ChatGateway;
use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use axum::{ routing::{ any, get }, Router, extract::State, response::IntoResponse, Json };
use governor::{ DefaultDirectRateLimiter, Quota, RateLimiter };
use serde::Serialize;
use tower_http::cors::{ Any, CorsLayer };
use log::info;

use super::websocket::chat_upgrade_handler;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    conversations: usize,
    connections: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ChatGateway>,
    pub limiter: Arc<DefaultDirectRateLimiter>,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(gateway: Arc<ChatGateway>, args: &Args) -> Self {
        let rate = NonZeroU32::new(args.connection_rate).unwrap_or(NonZeroU32::MIN);
        Self {
            gateway,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rate))),
            api_key: args.server_api_key.clone().filter(|k| !k.is_empty()),
        }
    }
}

pub fn router(state: AppState, ws_path: &str) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route(ws_path, any(chat_upgrade_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(state: AppState, args: &Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = args.server_addr.parse::<SocketAddr>()?;
    let app = router(state, &args.ws_path);

    match (args.enable_tls, &args.tls_cert_path, &args.tls_key_path) {
        (true, Some(cert_path), Some(key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path,
                key_path
            ).await?;
            info!("Chat server listening on wss://{}{}", addr, args.ws_path);
            axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
        }
        (true, _, _) => {
            return Err("--enable-tls requires both --tls-cert-path and --tls-key-path".into());
        }
        _ => {
            let listener = tokio::net::TcpListener
                ::bind(addr).await
                .map_err(|e| format!("Failed to bind chat server to {}: {}", addr, e))?;
            info!("Chat server listening on ws://{}{}", addr, args.ws_path);
            axum::serve(listener, app.into_make_service()).await?;
        }
    }

    Ok(())
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.gateway.registry();
    Json(HealthResponse {
        status: "ok",
        conversations: registry.conversation_count(),
        connections: registry.connection_count().await,
    })
}
