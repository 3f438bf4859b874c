//! Main Entrypoint for the Live Session Relay
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Building the upstream session factory, tool executor and audio sink.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use gemini_realtime::GeminiSessionFactory;
use relay_api::{
    audio::WavAudioSink,
    config::Config,
    registry::SessionRegistry,
    router::create_router,
    state::AppState,
    tools::{RelayToolExecutor, tool_declarations},
};
use relay_core::LiveSessionConfig;
use secrecy::{ExposeSecret, SecretString};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");
    config.log_summary();

    // --- 3. Initialize Collaborators ---
    let base_config = LiveSessionConfig {
        voice: config.voice.clone(),
        tools: tool_declarations(),
        system_instruction: config.load_system_instructions(),
        ..Default::default()
    };
    let api_key = config
        .google_api_key
        .as_ref()
        .map(|key| SecretString::from(key.expose_secret().to_owned()));
    let upstream_factory = GeminiSessionFactory::new(
        config.live_endpoint.clone(),
        api_key,
        config.model.clone(),
        base_config,
    );
    let tool_executor = RelayToolExecutor::new(config.function_urls.clone())
        .context("Failed to build the tool executor")?;
    let audio_sink = WavAudioSink::new(config.audio_output_dir.clone());

    let bind_address = config.bind_address;
    let model = config.model.clone();
    let app_state = Arc::new(AppState {
        config: Arc::new(config),
        registry: Arc::new(SessionRegistry::new()),
        upstream_factory: Arc::new(upstream_factory),
        tool_executor: Arc::new(tool_executor),
        audio_sink: Arc::new(audio_sink),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        %model,
        %bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
