//! # Configuration Management
//!
//! This module handles loading and managing relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables `HOST` and `PORT` (`PORT` sets the device-facing port)
//! 2. Environment variables (APP_SERVER__DEVICE_PORT, APP_HEARTBEAT__INTERVAL_MS, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore in environment variables because most
//! field names already contain a single one.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main relay configuration that contains all settings.
///
/// ## Why separate config structs:
/// The listeners, the worker heartbeat and the audio settings change for
/// different reasons, so each lives in its own group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub heartbeat: HeartbeatConfig,
    pub audio: AudioConfig,
    pub limits: LimitsConfig,
}

/// Listener settings.
///
/// ## Fields:
/// - `host`: Interface both listeners bind to ("0.0.0.0" accepts devices on the LAN)
/// - `device_port`: Port edge devices connect to
/// - `backend_port`: Port ASR workers connect to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub device_port: u16,
    pub backend_port: u16,
}

/// Worker liveness settings.
///
/// ## Fields:
/// - `interval_ms`: How often the pool pings every worker
/// - `client_timeout_ms`: How long a worker may stay silent (no pong, no message)
///   before its connection is dropped and the worker leaves the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub client_timeout_ms: u64,
}

/// Audio settings that devices and workers agree on.
///
/// The relay never decodes audio itself; these values are carried so they can
/// be reported and handed to a decoder placed in front of the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub decode_sample_rate: u32,
    pub channels: u8,
}

/// Transport limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest websocket frame accepted from a device or a worker
    pub max_frame_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                device_port: 8082,
                backend_port: 8081,
            },
            heartbeat: HeartbeatConfig {
                interval_ms: 10_000,
                client_timeout_ms: 30_000,
            },
            audio: AudioConfig {
                decode_sample_rate: 16000, // 16kHz mono opus from the devices
                channels: 1,
            },
            limits: LimitsConfig {
                max_frame_bytes: 1024 * 1024,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__BACKEND_PORT=9001`: Override the worker port
    /// - `APP_HEARTBEAT__INTERVAL_MS=5000`: Ping workers every 5 seconds
    /// - `PORT=3000`: Special case for deployment platforms (device port)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.device_port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Both ports are non-zero and different from each other
    /// - The heartbeat fires at all, and a worker gets at least one interval to answer
    /// - Audio settings and the frame limit are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.device_port == 0 || self.server.backend_port == 0 {
            return Err(anyhow::anyhow!("Listener ports cannot be 0"));
        }

        if self.server.device_port == self.server.backend_port {
            return Err(anyhow::anyhow!(
                "Device and backend listeners cannot share port {}",
                self.server.device_port
            ));
        }

        if self.heartbeat.interval_ms == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }

        if self.heartbeat.client_timeout_ms < self.heartbeat.interval_ms {
            return Err(anyhow::anyhow!(
                "Heartbeat client timeout ({}ms) must be at least one interval ({}ms)",
                self.heartbeat.client_timeout_ms,
                self.heartbeat.interval_ms
            ));
        }

        if self.audio.decode_sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and channels must be greater than 0"));
        }

        if self.limits.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Max frame size must be greater than 0"));
        }

        Ok(())
    }

    pub fn device_bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.device_port)
    }

    pub fn backend_bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.backend_port)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client_timeout_ms)
    }
}
