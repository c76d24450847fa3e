//! # ASR Relay - Main Application Entry Point
//!
//! Edge devices stream audio to this relay; ASR workers connect to it and do
//! the recognition. The relay binds each device to a session on a randomly
//! chosen worker and moves audio one way and recognized text the other.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: Both listeners and the heartbeat run on one async runtime
//! - **actors**: Every WebSocket connection is an actix actor with its own mailbox
//! - **Arc**: The worker pool is shared by the backend and device listeners
//! - **Result<T, E>**: Startup failures propagate to `main` with `?`
//!
//! ## Application Architecture:
//! - **config**: Relay configuration (defaults, config file, environment variables)
//! - **state**: Shared device-side state and metrics
//! - **relay**: Worker pool, sessions, framing and the backend listener
//! - **websocket**: Device WebSocket actor
//! - **server**: Device listener routes
//! - **health**: Health endpoint
//! - **middleware**: Connection logging
//! - **error**: Relay error type

mod config;      // Configuration management (config.rs)
mod error;       // Error handling types (error.rs)
mod health;      // Health endpoint (health.rs)
mod middleware;  // Connection logging (middleware/ directory)
mod relay;       // Session relay core (relay/ directory)
mod server;      // Device listener (server.rs)
mod state;       // Device-side state (state.rs)
mod websocket;   // Device WebSocket actor (websocket.rs)

use anyhow::Result;
use config::AppConfig;
use relay::WorkerPoolManager;
use state::AppState;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from the config file and environment variables
/// 2. **Sets up logging** for debugging and monitoring
/// 3. **Starts the backend listener** that ASR workers connect to
/// 4. **Starts the device listener** that edge devices connect to
/// 5. **Shuts down** on SIGINT/SIGTERM: workers (and with them their devices) first,
///    then the device listener
///
/// A listener that cannot bind aborts startup with an error.
#[actix_web::main]
async fn main() -> Result<()> {
    // It's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting asr-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        device = %config.device_bind_addr(),
        backend = %config.backend_bind_addr(),
        sample_rate = config.audio.decode_sample_rate,
        channels = config.audio.channels,
        "Configuration loaded"
    );

    let app_state = AppState::new(config.clone());

    // Workers first, so devices that connect right away can be bound
    let (manager, backend_server) =
        WorkerPoolManager::start(app_state.pool.clone(), &config, &config.backend_bind_addr())?;
    let (device_server, device_addrs) =
        server::bind_device_server(app_state.clone(), &config.device_bind_addr())?;
    info!(backend = ?manager.local_addrs(), device = ?device_addrs, "Relay is ready");

    let device_handle = device_server.handle();
    let backend_task = tokio::spawn(backend_server);
    let device_task = tokio::spawn(device_server);

    // tokio::select! is a "race" - whichever finishes first wins
    tokio::select! {
        result = backend_task => log_server_exit("backend", result),
        result = device_task => log_server_exit("device", result),
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping listeners...");
        }
    }

    server::shutdown_relay(&manager, &device_handle).await;

    info!("Relay stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "asr_relay=trace")
/// - If not set, defaults to "asr_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "asr_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn log_server_exit(listener: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!(listener, "Listener exited"),
        Ok(Err(e)) => error!(listener, error = %e, "Listener error"),
        Err(e) => error!(listener, error = %e, "Listener task error"),
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
///
/// If the SIGTERM handler cannot be installed, only Ctrl+C stops the relay.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
                return;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
    }
}
