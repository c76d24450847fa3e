//! # Worker Pool Manager
//!
//! Owns the backend listener that ASR workers connect to and the heartbeat that
//! keeps the pool honest.
//!
//! ## What this manages:
//! 1. **Accept loop**: an actix `HttpServer` upgrading each worker to a `WorkerSocket`
//! 2. **Heartbeat**: a tokio interval pinging every worker in the pool
//! 3. **Shutdown**: `destroy()` stops the heartbeat, closes every worker and the listener
//!
//! A listener that fails to bind is returned as an error from [`WorkerPoolManager::start`];
//! the process treats that as fatal at startup.

use crate::config::AppConfig;
use crate::middleware::ConnectionLogging;
use crate::relay::pool::WorkerPool;
use crate::relay::socket::{worker_websocket, BackendListener};

use actix_web::dev::{Server, ServerHandle};
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tracing_actix_web::TracingLogger;

/// Seconds the backend listener waits for worker connections to close on shutdown.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Accepts ASR worker connections into a [`WorkerPool`] and keeps them alive.
pub struct WorkerPoolManager {
    pool: Arc<WorkerPool>,
    local_addrs: Vec<SocketAddr>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    server: Mutex<Option<ServerHandle>>,
}

impl WorkerPoolManager {
    /// Bind the backend listener on `bind_addr` and start the heartbeat.
    ///
    /// Returns the manager and the server future; the caller decides where the
    /// server runs. Must be called from within an actix runtime.
    pub fn start(pool: Arc<WorkerPool>, config: &AppConfig, bind_addr: &str) -> Result<(Self, Server)> {
        let listener = BackendListener {
            pool: pool.clone(),
            client_timeout: config.heartbeat.client_timeout(),
            max_frame_bytes: config.limits.max_frame_bytes,
        };

        let http_server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(listener.clone()))
                .wrap(ConnectionLogging::backend())
                .wrap(TracingLogger::default())
                .route("/", web::get().to(worker_websocket))
        })
        .shutdown_timeout(SHUTDOWN_TIMEOUT_SECS)
        .bind(bind_addr)
        .with_context(|| format!("Failed to bind ASR backend listener on {}", bind_addr))?;

        let local_addrs = http_server.addrs();
        let server = http_server.run();
        info!(addrs = ?local_addrs, "ASR backend listener is accepting workers");

        let heartbeat = spawn_heartbeat(pool.clone(), config.heartbeat.interval());

        let manager = Self {
            pool,
            local_addrs,
            heartbeat: Mutex::new(Some(heartbeat)),
            server: Mutex::new(Some(server.handle())),
        };
        Ok((manager, server))
    }

    /// Addresses the backend listener is bound to.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop the heartbeat, close every worker (and with them every session),
    /// then close the listener. Calling it again does nothing.
    pub async fn destroy(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner).take() {
            heartbeat.abort();
        }

        self.pool.destroy();

        let server = self.server.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(server) = server {
            server.stop(true).await;
            info!("ASR backend listener stopped");
        }
    }
}

fn spawn_heartbeat(pool: Arc<WorkerPool>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately; workers that just connected
        // do not need a ping yet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let pinged = pool.ping_all();
            debug!(workers = pinged, "Heartbeat sent to ASR workers");
        }
    })
}
