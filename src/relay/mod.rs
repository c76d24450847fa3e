//! # Session Relay Core
//!
//! Binds edge devices to ASR workers and moves audio and results between them.
//!
//! ## Key Components:
//! - **Framer**: binary layout of session-tagged audio sent to workers
//! - **Session**: one device's channel multiplexed over a worker connection
//! - **Worker**: one backend recognition process and its session table
//! - **Pool**: the live workers, random selection, heartbeat fan-out
//! - **Manager**: backend listener and heartbeat task
//! - **Device**: per-device protocol handling on top of a session
//!
//! ## Data Flow:
//! ```text
//! device --binary--> DeviceBridge --send_audio--> WorkerSession --framed--> Worker --> ASR
//! device --listen--> DeviceBridge --send_json---> WorkerSession --tagged--> Worker --> ASR
//! ASR --chat--> Worker --by session id--> WorkerSession --Text--> device
//! ```

pub mod device;    // Device-side message routing
pub mod framer;    // Session framing for the worker link
pub mod manager;   // Backend listener and heartbeat
pub mod pool;      // Live worker table and selection
pub mod session;   // Per-device worker sessions
pub mod socket;    // Worker WebSocket actor
pub mod worker;    // Worker connection and session table

#[cfg(test)]
pub(crate) mod test_support;

pub use device::{DeviceBridge, DeviceRoute};
pub use manager::WorkerPoolManager;
pub use pool::WorkerPool;
pub use session::SessionEvent;
pub use worker::WorkerEvent;
