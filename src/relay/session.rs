//! # Worker Sessions
//!
//! A session is one device's logical channel inside a shared worker connection.
//! It owns a unique id, tags everything it sends to the worker with that id, and
//! hands results the worker addresses to it to exactly one observer: the device
//! connection that created it.
//!
//! ## Session Lifecycle:
//! 1. **Open**: Created by [`Worker::new_session`](super::worker::Worker::new_session)
//! 2. **Closed**: Finished by the device, or cascaded from the worker closing
//!
//! The observer receives exactly one [`SessionEvent::Closed`] and nothing after it.

use crate::error::{RelayError, RelayResult};
use crate::relay::framer::{tag_session, AudioFrameEncoder};
use crate::relay::worker::{Worker, WorkerFrame};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::debug;

/// Notifications raised to a session's observer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Recognized text for the device (sent by the worker as a `chat` result)
    Text(Value),

    /// Any other worker message addressed to this session, unchanged
    Message(Value),

    /// Terminal notification; the session is gone from its worker
    Closed,
}

/// Receiving half handed to the session's single observer.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// One device's channel on a worker connection.
///
/// ## Ownership:
/// The worker's session table owns the session (`Arc`); the session only keeps
/// a `Weak` back-reference, so it never keeps a disconnected worker alive.
#[derive(Debug)]
pub struct WorkerSession {
    /// Unique id (UUID v4) carried on every frame for this session
    id: String,

    /// Owning worker
    worker: Weak<Worker>,

    /// Pre-encoded id prefix for audio frames
    encoder: AudioFrameEncoder,

    /// Sending half of the observer channel, dropped on close
    observer: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,

    closed: AtomicBool,
}

impl WorkerSession {
    pub(crate) fn new(id: String, worker: Weak<Worker>) -> RelayResult<(Self, SessionEvents)> {
        let encoder = AudioFrameEncoder::new(&id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Self {
            id,
            worker,
            encoder,
            observer: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        };
        Ok((session, rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The worker this session belongs to, if it is still alive.
    pub fn worker(&self) -> Option<Arc<Worker>> {
        self.worker.upgrade()
    }

    /// Frame `audio` with this session's id and send it as a binary frame.
    pub fn send_audio(&self, audio: &[u8]) -> RelayResult<()> {
        let worker = self.open_worker()?;
        let frame = self.encoder.encode(audio)?;
        worker.send(WorkerFrame::Binary(frame))
    }

    /// Stamp `message` with this session's id and send it as a text frame.
    ///
    /// The id is written into `message` itself, so the caller sees the
    /// tagged object after the call.
    pub fn send_json(&self, message: &mut Value) -> RelayResult<()> {
        let worker = self.open_worker()?;
        tag_session(message, &self.id)?;
        worker.send(WorkerFrame::Text(message.to_string()))
    }

    /// Tell the worker this session is done, then leave the worker's table.
    ///
    /// The session is closed afterwards even when the `finish` message could
    /// not be delivered; the delivery error is still returned.
    pub fn finish(&self) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::SessionClosed(self.id.clone()));
        }

        let sent = self.send_json(&mut json!({ "type": "finish" }));
        if let Some(worker) = self.worker() {
            worker.remove_session(&self.id);
        }
        self.close();
        sent
    }

    /// Raise `event` to the observer. Returns false once the session is closed
    /// or the observer has gone away.
    pub(crate) fn deliver(&self, event: SessionEvent) -> bool {
        let observer = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        match observer.as_ref() {
            Some(tx) if !self.is_closed() => tx.send(event).is_ok(),
            _ => false,
        }
    }

    /// Emit the terminal close notification. Only the first call has any effect.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = observer {
            let _ = tx.send(SessionEvent::Closed);
        }
        debug!(session_id = %self.id, "Session closed");
        true
    }

    fn open_worker(&self) -> RelayResult<Arc<Worker>> {
        if self.is_closed() {
            return Err(RelayError::SessionClosed(self.id.clone()));
        }
        self.worker()
            .ok_or_else(|| RelayError::WorkerGone(format!("session {}", self.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::framer::decode_audio_frame;
    use crate::relay::pool::WorkerKey;
    use crate::relay::test_support::{test_worker, RecordingLink};

    #[test]
    fn test_send_audio_frames_with_session_id() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (session, _events) = worker.new_session().unwrap();

        session.send_audio(&[0x01, 0x02, 0x03]).unwrap();

        let frames = link.binary_frames();
        assert_eq!(frames.len(), 1);
        let decoded = decode_audio_frame(&frames[0]).unwrap();
        assert_eq!(decoded.session_id, session.id());
        assert_eq!(decoded.audio, &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_send_json_injects_session_id() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (session, _events) = worker.new_session().unwrap();

        let mut message = json!({"type": "listen", "mode": "once"});
        session.send_json(&mut message).unwrap();

        assert_eq!(message["session_id"], session.id());
        let sent = link.json_frames();
        assert_eq!(sent, vec![message]);
    }

    #[test]
    fn test_frames_keep_submission_order() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (session, _events) = worker.new_session().unwrap();

        session.send_json(&mut json!({"type": "listen"})).unwrap();
        session.send_audio(&[1]).unwrap();
        session.send_audio(&[2]).unwrap();

        let frames = link.frames();
        assert!(matches!(frames[0], WorkerFrame::Text(_)));
        assert_eq!(decode_audio_frame(&link.binary_frames()[0]).unwrap().audio, &[1]);
        assert_eq!(decode_audio_frame(&link.binary_frames()[1]).unwrap().audio, &[2]);
    }

    #[test]
    fn test_finish_sends_finish_and_leaves_worker() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (session, mut events) = worker.new_session().unwrap();

        session.finish().unwrap();

        assert_eq!(
            link.json_frames(),
            vec![json!({"type": "finish", "session_id": session.id()})]
        );
        assert_eq!(worker.session_count(), 0);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Closed);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_send_after_finish_is_rejected() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let (session, _events) = worker.new_session().unwrap();
        session.finish().unwrap();

        assert!(matches!(session.send_audio(&[1]), Err(RelayError::SessionClosed(_))));
        assert!(matches!(
            session.send_json(&mut json!({"type": "listen"})),
            Err(RelayError::SessionClosed(_))
        ));
        assert!(matches!(session.finish(), Err(RelayError::SessionClosed(_))));
        assert_eq!(link.frames().len(), 1);
    }

    #[test]
    fn test_close_notifies_once_and_silences_session() {
        let (worker, _link) = test_worker("127.0.0.1:9000");
        let (session, mut events) = worker.new_session().unwrap();

        assert!(session.close());
        assert!(!session.close());
        assert!(!session.deliver(SessionEvent::Text(json!("late"))));

        assert_eq!(events.try_recv().unwrap(), SessionEvent::Closed);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_send_fails_once_worker_is_dropped() {
        let link = RecordingLink::new();
        let worker = Worker::new(WorkerKey::from_peer("127.0.0.1:9001".parse().unwrap()), link.clone());
        let (session, _events) = worker.new_session().unwrap();
        worker.remove_session(session.id());
        drop(worker);

        assert!(session.worker().is_none());
        assert!(matches!(session.send_audio(&[1]), Err(RelayError::WorkerGone(_))));
        assert!(link.frames().is_empty());
    }
}
