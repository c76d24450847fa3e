//! # Device WebSocket Handler
//!
//! Edge devices connect to the device listener and stream audio over WebSocket.
//! Each connection is a `DeviceWebSocket` actor bound to one session on one
//! ASR worker for its whole lifetime.
//!
//! ## Connection Lifecycle:
//! 1. **Bind**: Draw a worker from the pool; with no worker, close immediately
//! 2. **Watch**: Close the device if its worker goes away (no retry)
//! 3. **Relay**: Binary audio and `listen` messages go to the session, `text`
//!    results come back to the device
//! 4. **Release**: On disconnect, finish the session so the worker can drop it
//!
//! Devices never receive structured errors; a closed connection is the only
//! failure signal.

use crate::error::RelayError;
use crate::relay::{DeviceBridge, DeviceRoute, SessionEvent, WorkerEvent};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, UnboundedReceiverStream};
use tracing::{debug, error, info, warn};

/// WebSocket actor for one edge device.
pub struct DeviceWebSocket {
    state: AppState,

    /// Session binding, present once a worker was acquired
    bridge: Option<DeviceBridge>,
}

impl DeviceWebSocket {
    pub fn new(state: AppState) -> Self {
        Self { state, bridge: None }
    }

    fn reject(&self, ctx: &mut ws::WebsocketContext<Self>) {
        self.state.record_device_rejected();
        ctx.close(Some(ws::CloseCode::Again.into()));
        ctx.stop();
    }

    fn handle_audio(&self, data: &[u8]) {
        let Some(bridge) = &self.bridge else {
            return;
        };

        match bridge.on_audio(data) {
            Ok(()) => {
                self.state.record_audio_frame();
                debug!(session_id = %bridge.session().id(), bytes = data.len(), "Audio forwarded");
            }
            Err(err) => {
                self.state.record_message_dropped();
                warn!(session_id = %bridge.session().id(), error = %err, "Dropping device audio");
            }
        }
    }

    fn handle_control(&self, text: &str) {
        let Some(bridge) = &self.bridge else {
            return;
        };

        match bridge.on_control(text) {
            Ok(DeviceRoute::Forwarded) => self.state.record_control_message(),
            Ok(DeviceRoute::Ignored(_)) => self.state.record_message_dropped(),
            Err(err) => {
                self.state.record_message_dropped();
                warn!(session_id = %bridge.session().id(), error = %err, "Dropping device message");
            }
        }
    }
}

impl Actor for DeviceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Bind the device to a worker as soon as the connection is up.
    fn started(&mut self, ctx: &mut Self::Context) {
        let Some(worker) = self.state.pool.get_worker() else {
            error!(error = %RelayError::WorkerUnavailable, "Closing device connection");
            self.reject(ctx);
            return;
        };

        // Subscribe before opening the session so a close in between is not missed.
        ctx.add_stream(BroadcastStream::new(worker.subscribe()));

        match DeviceBridge::bind(&worker) {
            Ok((bridge, events)) => {
                info!(
                    worker = %worker.key(),
                    session_id = %bridge.session().id(),
                    "Device bound to ASR worker"
                );
                ctx.add_stream(UnboundedReceiverStream::new(events));
                self.state.record_device_accepted();
                self.bridge = Some(bridge);
            }
            Err(err) => {
                warn!(worker = %worker.key(), error = %err, "Could not open session, closing device");
                self.reject(ctx);
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(bridge) = self.bridge.take() {
            bridge.release();
            self.state.record_device_closed();
            info!(session_id = %bridge.session().id(), "Device disconnected");
        }
    }
}

/// Session notifications: results to forward, or the end of the session.
impl StreamHandler<SessionEvent> for DeviceWebSocket {
    fn handle(&mut self, event: SessionEvent, ctx: &mut Self::Context) {
        match event {
            SessionEvent::Text(content) => {
                self.state.record_result_delivered();
                debug!(content = %content, "Sending text to device");
                ctx.text(DeviceBridge::text_message(&content));
            }
            SessionEvent::Message(message) => {
                debug!(message = %message, "Worker message not relayed to device");
            }
            SessionEvent::Closed => {
                info!("Session closed by worker, closing device connection");
                ctx.close(Some(ws::CloseCode::Away.into()));
                ctx.stop();
            }
        }
    }
}

/// Worker lifecycle: a closed worker takes its devices down with it.
impl StreamHandler<Result<WorkerEvent, BroadcastStreamRecvError>> for DeviceWebSocket {
    fn handle(&mut self, event: Result<WorkerEvent, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match event {
            Ok(WorkerEvent::Closed) => {
                info!("ASR worker closed, closing device connection");
                ctx.close(Some(ws::CloseCode::Away.into()));
                ctx.stop();
            }
            Ok(WorkerEvent::Error(reason)) => {
                debug!(error = %reason, "ASR worker reported an error");
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed ASR worker events");
            }
        }
    }

    /// The worker's event channel ends when the worker is dropped; the session
    /// stream already covers that case.
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

/// Frames from the device.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DeviceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Binary(data)) => self.handle_audio(&data),
            Ok(ws::Message::Text(text)) => self.handle_control(&text),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "Device closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "Device WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Device listener endpoint: upgrade a device's HTTP request to WebSocket.
pub async fn device_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.peer_addr(), "Device connection request");

    let max_frame_bytes = app_state.get_config().limits.max_frame_bytes;
    let socket = DeviceWebSocket::new(app_state.get_ref().clone());
    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}
