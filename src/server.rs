//! # Device Listener
//!
//! The HTTP server edge devices connect to. `/` upgrades to the device
//! WebSocket; `/health` reports the relay and its worker pool.

use crate::health;
use crate::middleware::ConnectionLogging;
use crate::relay::WorkerPoolManager;
use crate::state::AppState;
use crate::websocket::device_websocket;

use actix_cors::Cors;
use actix_web::dev::{Server, ServerHandle};
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::info;
use tracing_actix_web::TracingLogger;

/// Seconds the device listener waits for open connections on shutdown.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Bind the device listener on `bind_addr`.
///
/// Returns the server future (not yet running) and the bound addresses, which
/// differ from `bind_addr` when it asks for port 0.
pub fn bind_device_server(state: AppState, bind_addr: &str) -> Result<(Server, Vec<SocketAddr>)> {
    let http_server = HttpServer::new(move || {
        // Devices and dashboards on the LAN probe /health from browsers
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(cors)
            .wrap(ConnectionLogging::device())
            .wrap(TracingLogger::default())
            .route("/", web::get().to(device_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
    .bind(bind_addr)
    .with_context(|| format!("Failed to bind device listener on {}", bind_addr))?;

    let addrs = http_server.addrs();
    info!(addrs = ?addrs, "Device listener is accepting connections");
    Ok((http_server.run(), addrs))
}

/// Stop both listeners.
///
/// Workers go first: closing them cascades a close to every bound device, so
/// the device listener has no open connections left to wait for.
pub async fn shutdown_relay(manager: &WorkerPoolManager, device_listener: &ServerHandle) {
    manager.destroy().await;
    device_listener.stop(true).await;
    info!("Device listener stopped");
}
