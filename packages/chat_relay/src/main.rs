//! chat-relay: streaming chat server backed by an OpenAI-compatible
//! completion provider.
//!
//! Two front doors share one relay core: anonymous in-memory conversations
//! under `/api/conversations`, and authenticated persistent sessions under
//! `/api/sessions` backed by SQLite.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{delete, get, post},
};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod config;
mod db;
mod handlers;
mod models;
mod provider;
mod registry;
mod relay;
mod repository;
mod title;

use auth::{AuthService, AuthState};
use config::{AuthConfig, FileConfig, ProviderConfig, RelayDirs};
use db::Database;
use provider::{CompletionParams, CompletionProvider, GroqClient};
use registry::ConversationRegistry;
use repository::ChatRepository;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(about = "Streaming chat relay with anonymous and persistent sessions")]
struct Cli {
    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Custom data directory (defaults to ~/.chat-relay)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<ConversationRegistry>,
    pub repository: Arc<ChatRepository>,
    pub provider: Arc<dyn CompletionProvider>,
    pub chat_params: CompletionParams,
    pub title_params: CompletionParams,
    pub auth: AuthService,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "chat_relay=debug,tower_http=debug,info"
    } else {
        "chat_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let dirs = RelayDirs::new(cli.data_dir.clone())?;

    let file_config: FileConfig = config::load_config(&dirs.data_dir)
        .extract()
        .context("Failed to load configuration")?;
    let auth_config = AuthConfig::from_file(&file_config.auth);
    let provider_config = ProviderConfig::from_file(&file_config.provider)?;

    let host = cli
        .host
        .or(file_config.server.host)
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = cli.port.or(file_config.server.port).unwrap_or(8000);

    let database = Database::new(&dirs).await?;
    let repository = Arc::new(ChatRepository::new(database.pool.clone()));

    let groq = GroqClient::new(provider_config);
    let chat_params = groq.chat_params();
    let title_params = groq.title_params();
    let provider: Arc<dyn CompletionProvider> = Arc::new(groq);

    let auth_service = AuthService::new(repository.clone(), auth_config);
    let auth_state = AuthState {
        service: auth_service.clone(),
    };

    let app_state = AppState {
        registry: Arc::new(ConversationRegistry::new()),
        repository: repository.clone(),
        provider,
        chat_params,
        title_params,
        auth: auth_service,
    };

    let app = Router::new()
        // Anonymous in-memory conversations
        .route("/api/conversations/{id}", get(handlers::get_conversation))
        .route(
            "/api/conversations/{id}",
            delete(handlers::close_conversation),
        )
        .route(
            "/api/conversations/{id}/ws",
            get(handlers::conversation_ws),
        )
        // Persistent sessions (auth required)
        .route("/api/sessions", post(handlers::create_session))
        .route("/api/sessions/messages", get(handlers::get_latest_sessions))
        .route(
            "/api/sessions/{session_number}/messages",
            get(handlers::get_session_messages),
        )
        .route("/api/sessions/{session_number}/ws", get(handlers::session_ws))
        // Auth endpoints
        .route("/api/auth/register", post(handlers::register_handler))
        .route("/api/auth/login", post(handlers::login_handler))
        .route("/api/auth/logout", post(handlers::logout_handler))
        // Health
        .route("/health", get(handlers::health_handler))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            auth::auth_middleware,
        ));

    // Periodic expired token cleanup
    let cleanup_repo = repository.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            match cleanup_repo
                .cleanup_expired_auth_sessions(chrono::Utc::now().timestamp())
                .await
            {
                Ok(n) if n > 0 => info!("Cleaned up {} expired auth sessions", n),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "expired token cleanup failed"),
            }
        }
    });

    let app = app
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = format!("{host}:{port}").parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("chat-relay listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/conversations/:id     - Conversation history");
    info!("  DELETE /api/conversations/:id     - Close conversation");
    info!("  GET    /api/conversations/:id/ws  - Anonymous chat WebSocket");
    info!("  POST   /api/sessions              - Create persistent session");
    info!("  GET    /api/sessions/:n/ws        - Persistent chat WebSocket");

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
