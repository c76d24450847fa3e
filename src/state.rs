//! # Application State Management
//!
//! Shared state handed to every device connection and HTTP handler on the
//! device listener.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: Many connections hold a reference to the same state
//! - **RwLock**: Many readers, or one writer at a time
//!
//! The worker pool has its own internal locking, so it is shared as a plain
//! `Arc<WorkerPool>`.

use crate::config::AppConfig;
use crate::relay::WorkerPool;
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

/// State shared across the device listener.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Relay configuration
    pub config: Arc<RwLock<AppConfig>>,

    /// Live ASR workers, shared with the backend listener
    pub pool: Arc<WorkerPool>,

    /// Relay traffic counters (updated by every device connection)
    pub metrics: Arc<RwLock<RelayMetrics>>,

    /// When the relay started (never changes, so no lock needed)
    pub start_time: Instant,
}

/// Traffic counters for the device side of the relay.
///
/// ## Why these metrics matter:
/// - **devices_rejected**: devices that connected while no worker was available
/// - **active_devices**: current load on the worker pool
/// - **messages_dropped**: malformed or unrecognized device messages
#[derive(Debug, Default, Clone, Serialize)]
pub struct RelayMetrics {
    /// Device connections bound to a worker since startup
    pub devices_accepted: u64,

    /// Device connections closed because no worker was available
    pub devices_rejected: u64,

    /// Devices currently bound to a session
    pub active_devices: u32,

    /// Audio frames forwarded to workers
    pub audio_frames: u64,

    /// `listen` control messages forwarded to workers
    pub control_messages: u64,

    /// Text results sent back to devices
    pub results_delivered: u64,

    /// Device messages dropped (malformed, unrecognized or undeliverable)
    pub messages_dropped: u64,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self::with_pool(config, Arc::new(WorkerPool::new()))
    }

    pub fn with_pool(config: AppConfig, pool: Arc<WorkerPool>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            pool,
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other connections aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn record_device_accepted(&self) {
        self.update_metrics(|metrics| {
            metrics.devices_accepted += 1;
            metrics.active_devices += 1;
        });
    }

    pub fn record_device_rejected(&self) {
        self.update_metrics(|metrics| metrics.devices_rejected += 1);
    }

    /// Called when a device that was bound to a session disconnects.
    ///
    /// Saturates at zero so a mismatched call cannot underflow the gauge.
    pub fn record_device_closed(&self) {
        self.update_metrics(|metrics| {
            metrics.active_devices = metrics.active_devices.saturating_sub(1);
        });
    }

    pub fn record_audio_frame(&self) {
        self.update_metrics(|metrics| metrics.audio_frames += 1);
    }

    pub fn record_control_message(&self) {
        self.update_metrics(|metrics| metrics.control_messages += 1);
    }

    pub fn record_result_delivered(&self) {
        self.update_metrics(|metrics| metrics.results_delivered += 1);
    }

    pub fn record_message_dropped(&self) {
        self.update_metrics(|metrics| metrics.messages_dropped += 1);
    }

    /// Get a snapshot of current metrics (used by the health endpoint).
    pub fn get_metrics_snapshot(&self) -> RelayMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn update_metrics(&self, update: impl FnOnce(&mut RelayMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }
}
