//! # Device Bridge
//!
//! Protocol logic for one connected edge device, independent of the socket that
//! carries it. The websocket actor in `websocket.rs` owns a `DeviceBridge` and
//! hands it every inbound frame.
//!
//! ## Device Protocol:
//! - **Device → Relay (binary)**: raw audio, forwarded to the session as-is
//! - **Device → Relay (text)**: JSON `{"type": ...}`; only `listen` is forwarded
//! - **Relay → Device (text)**: `{"type": "text", "content": ...}`

use crate::error::{RelayError, RelayResult};
use crate::relay::session::{SessionEvents, WorkerSession};
use crate::relay::worker::Worker;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// The only control message type a device may send.
const LISTEN: &str = "listen";

/// Outcome of a device text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceRoute {
    /// Forwarded to the worker with the session id attached
    Forwarded,
    /// Not a recognized control message; carries the type, if any
    Ignored(Option<String>),
}

/// Binds one device connection to one session on one worker.
#[derive(Debug)]
pub struct DeviceBridge {
    session: Arc<WorkerSession>,
}

impl DeviceBridge {
    /// Open a session for a new device on `worker`.
    pub fn bind(worker: &Arc<Worker>) -> RelayResult<(Self, SessionEvents)> {
        let (session, events) = worker.new_session()?;
        Ok((Self { session }, events))
    }

    pub fn session(&self) -> &Arc<WorkerSession> {
        &self.session
    }

    /// Forward one binary frame from the device.
    pub fn on_audio(&self, audio: &[u8]) -> RelayResult<()> {
        self.session.send_audio(audio)
    }

    /// Handle one text frame from the device.
    ///
    /// Malformed JSON is returned as an error for the caller to log. Messages
    /// of any type other than `listen` are dropped with a warning; the device
    /// is never told.
    pub fn on_control(&self, text: &str) -> RelayResult<DeviceRoute> {
        let mut message: Value = serde_json::from_str(text)?;
        let kind = message.get("type").and_then(Value::as_str).map(str::to_string);

        match kind.as_deref() {
            Some(LISTEN) => {
                self.session.send_json(&mut message)?;
                Ok(DeviceRoute::Forwarded)
            }
            _ => {
                warn!(
                    session_id = %self.session.id(),
                    message_type = ?kind,
                    "Unrecognized device message type"
                );
                Ok(DeviceRoute::Ignored(kind))
            }
        }
    }

    /// Finish the session when the device goes away, so the worker can free
    /// its recognizer and the session leaves the worker's table.
    pub fn release(&self) {
        match self.session.finish() {
            Ok(()) => debug!(session_id = %self.session.id(), "Session finished on device disconnect"),
            // Already closed by its worker.
            Err(RelayError::SessionClosed(_)) => {}
            Err(err) => debug!(session_id = %self.session.id(), error = %err, "Could not notify worker of finish"),
        }
    }

    /// JSON sent to the device for recognized text.
    pub fn text_message(content: &Value) -> String {
        json!({ "type": "text", "content": content }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::framer::decode_audio_frame;
    use crate::relay::session::SessionEvent;
    use crate::relay::test_support::test_worker;

    #[test]
    fn test_listen_is_forwarded_with_session_id() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (bridge, _events) = DeviceBridge::bind(&worker).unwrap();

        let route = bridge.on_control(r#"{"type":"listen","mode":"once"}"#).unwrap();

        assert_eq!(route, DeviceRoute::Forwarded);
        let sent = link.json_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "listen");
        assert_eq!(sent[0]["mode"], "once");
        assert_eq!(sent[0]["session_id"], bridge.session().id());
    }

    #[test]
    fn test_unknown_type_is_not_forwarded() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (bridge, _events) = DeviceBridge::bind(&worker).unwrap();

        let route = bridge.on_control(r#"{"type":"unknown"}"#).unwrap();
        assert_eq!(route, DeviceRoute::Ignored(Some("unknown".to_string())));

        let route = bridge.on_control(r#"{"mode":"once"}"#).unwrap();
        assert_eq!(route, DeviceRoute::Ignored(None));

        assert!(link.frames().is_empty());
    }

    #[test]
    fn test_malformed_json_is_an_error_and_keeps_the_session() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (bridge, _events) = DeviceBridge::bind(&worker).unwrap();

        assert!(matches!(bridge.on_control("listen"), Err(RelayError::InvalidMessage(_))));
        assert!(link.frames().is_empty());

        bridge.on_control(r#"{"type":"listen"}"#).unwrap();
        assert_eq!(link.frames().len(), 1);
    }

    #[test]
    fn test_audio_is_forwarded_framed() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (bridge, _events) = DeviceBridge::bind(&worker).unwrap();

        bridge.on_audio(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]).unwrap();

        let frame = &link.binary_frames()[0];
        let decoded = decode_audio_frame(frame).unwrap();
        assert_eq!(decoded.session_id, bridge.session().id());
        assert_eq!(decoded.audio, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    }

    /// Device disconnects finish their session instead of leaving it in the
    /// worker's table until the worker itself goes away.
    #[test]
    fn test_release_finishes_session_on_device_disconnect() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (bridge, mut events) = DeviceBridge::bind(&worker).unwrap();
        assert_eq!(worker.session_count(), 1);

        bridge.release();

        assert_eq!(worker.session_count(), 0);
        let sent = link.json_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "finish");
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Closed);
    }

    #[test]
    fn test_release_after_worker_close_sends_nothing() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (bridge, _events) = DeviceBridge::bind(&worker).unwrap();

        worker.close();
        bridge.release();

        assert!(link.frames().is_empty());
    }

    #[test]
    fn test_session_churn_leaves_no_sessions_behind() {
        let (worker, _link) = test_worker("127.0.0.1:9000");
        for _ in 0..100 {
            let (bridge, _events) = DeviceBridge::bind(&worker).unwrap();
            bridge.on_audio(&[0]).unwrap();
            bridge.release();
        }
        assert_eq!(worker.session_count(), 0);
    }

    #[test]
    fn test_text_message_shape() {
        let message: Value = serde_json::from_str(&DeviceBridge::text_message(&json!("hi"))).unwrap();
        assert_eq!(message, json!({"type": "text", "content": "hi"}));
    }
}
