//! # Speech Relay - Main Application Entry Point
//!
//! This is the main entry point for the speech-relay server. It relays live
//! microphone audio from client WebSockets to Deepgram and streams transcripts
//! back, and forwards text-to-speech requests to ElevenLabs.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Every socket, upstream connection and HTTP request is an async task
//! - **modules**: Code is organized into separate modules (mod statements)
//! - **Result<T, E>**: Error handling using Rust's Result type
//! - **Arc & RwLock**: Thread-safe shared state management
//! - **CancellationToken**: One shutdown signal observed by every part of the server
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **state**: Manages shared application state and metrics
//! - **relay**: The streaming relay core (sessions, upstream, relay loop, registry)
//! - **websocket**: Binds client sockets to relay sessions
//! - **health**: Provides health and metrics endpoints
//! - **middleware**: Custom request processing logic (logging, metrics)
//! - **handlers**: HTTP request handlers for the REST endpoints (config, sessions, TTS)
//! - **error**: Custom error types and HTTP error responses

// Module declarations - These tell Rust about our other source files
mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod state;       // Application state management (state.rs)
mod health;      // Health check endpoints (health.rs)
mod middleware;  // Custom middleware (middleware/ directory)
mod handlers;    // HTTP request handlers (handlers/ directory)
mod relay;       // Streaming relay core (relay/ directory)
mod websocket;   // WebSocket actor and upgrade handlers (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use relay::DeepgramConnector;
use state::AppState;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Builds the Deepgram connector** and the shared application state
/// 4. **Configures the HTTP server** with middleware and routes
/// 5. **Handles graceful shutdown**: stop accepting, close every session, stop the server
///
/// ## Error Handling:
/// A missing `DEEPGRAM_API_KEY` or an invalid configuration fails here, before
/// anything listens, and the process exits with the error.
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate()?;

    info!("Starting speech-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(
        upstream = %config.upstream.url,
        tts_configured = config.tts.api_key.is_some(),
        "Upstream services configured"
    );
    if config.audio.sample_rate.is_none() {
        info!("No default sample rate configured; clients must send sample_rate in their handshake");
    }

    let connector = DeepgramConnector::from_config(&config.upstream)?;
    let app_state = AppState::new(config.clone(), Arc::new(connector))?;
    let registry = app_state.registry.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware execute in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            // Listen socket: the root (for existing clients) and an explicit path
            .route("/", web::get().to(websocket::index))
            .route("/ws/listen", web::get().to(websocket::relay_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/text-to-speech/{voice_id}", web::post().to(handlers::text_to_speech))
            .route("/voices", web::get().to(handlers::list_voices))
            .route("/health", web::get().to(health::health_check))
    })
    // Signals are handled below, so that sessions close before the server stops
    .disable_signals()
    .shutdown_timeout(config.session.shutdown_timeout().as_secs().max(1))
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = shutdown.cancelled() => {
            info!("Shutdown signal received, stopping server...");

            // No new connections while sessions drain
            server_handle.pause().await;

            let remaining = registry.shutdown_all(config.session.shutdown_timeout()).await;
            if remaining > 0 {
                warn!(remaining, "sessions still open after shutdown timeout");
            } else {
                info!("All sessions closed");
            }

            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "speech_relay=trace")
/// - If not set, defaults to "speech_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Cancel `shutdown` on SIGINT (Ctrl+C) or SIGTERM.
///
/// If a handler cannot be installed the server keeps running without it; the
/// failure is logged rather than aborting startup.
fn setup_signal_handlers(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received SIGINT"),
                    Err(e) => {
                        error!("Failed to listen for SIGINT: {}", e);
                        return;
                    }
                }
            }
            _ = terminate() => {
                info!("Received SIGTERM");
            }
        }

        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
