//! # ASR Workers
//!
//! A [`Worker`] is one backend recognition process connected to the relay. Many
//! device sessions share its single connection: audio goes out as framed binary
//! messages, results come back as JSON text tagged with a session id, and the
//! worker routes each result to the session it names.
//!
//! ## Transport Seam:
//! The worker never touches a socket directly. Everything goes through the
//! [`WorkerLink`] trait, implemented by the websocket actor in production and by
//! an in-memory recorder in tests.

use crate::error::{RelayError, RelayResult};
use crate::relay::framer::SESSION_ID_FIELD;
use crate::relay::pool::WorkerKey;
use crate::relay::session::{SessionEvent, SessionEvents, WorkerSession};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Capacity of the worker event channel. Only `Closed` and the occasional
/// `Error` are ever sent, so lagging subscribers are not a concern.
const EVENT_CAPACITY: usize = 16;

/// Worker result type that carries recognized text for the device.
const CHAT_RESULT: &str = "chat";

/// A frame on the worker connection. The binary/text distinction is part of the
/// protocol and is preserved end to end.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerFrame {
    /// Session-framed audio
    Binary(Vec<u8>),
    /// JSON control message
    Text(String),
}

/// Events a worker raises to anyone watching it.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// The connection is gone; every session has been closed
    Closed,
    /// A transport-level failure was reported; the worker may still close after it
    Error(String),
}

/// What happened to an inbound worker message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Handed to the addressed session
    Delivered,
    /// No live session with this id; the message was dropped
    UnknownSession(Option<String>),
}

/// Outbound side of a worker connection.
pub trait WorkerLink: Send + Sync {
    /// Queue a frame for the worker. Frames queued from one caller are written
    /// in the order they were queued.
    fn send(&self, frame: WorkerFrame) -> RelayResult<()>;

    /// Send a protocol-level liveness probe.
    fn ping(&self);

    /// Close the underlying connection.
    fn close(&self);
}

/// One backend recognition process and the sessions multiplexed over it.
pub struct Worker {
    key: WorkerKey,
    link: Arc<dyn WorkerLink>,

    /// Live sessions by id
    sessions: RwLock<HashMap<String, Arc<WorkerSession>>>,

    events: broadcast::Sender<WorkerEvent>,
    closed: AtomicBool,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("key", &self.key)
            .field("sessions", &self.session_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Worker {
    pub fn new(key: WorkerKey, link: Arc<dyn WorkerLink>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            key,
            link,
            sessions: RwLock::new(HashMap::new()),
            events,
            closed: AtomicBool::new(false),
        })
    }

    pub fn key(&self) -> &WorkerKey {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.read_sessions().len()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<WorkerSession>> {
        self.read_sessions().get(session_id).cloned()
    }

    /// Watch for `Closed` and `Error` events.
    ///
    /// Subscribers only see events raised after they subscribe, so check
    /// [`is_closed`](Self::is_closed) afterwards if the outcome matters.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Open a session on this worker.
    ///
    /// Ids are random UUIDs, and each candidate is checked against the table
    /// before it is used, so an id is never shared with a live session.
    pub fn new_session(self: &Arc<Self>) -> RelayResult<(Arc<WorkerSession>, SessionEvents)> {
        let mut sessions = self.write_sessions();

        // Checked under the table lock so close() cannot miss this session.
        if self.is_closed() {
            return Err(RelayError::WorkerGone(self.key.to_string()));
        }

        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
            warn!(worker = %self.key, session_id = %candidate, "Session id collision, regenerating");
        };

        let (session, events) = WorkerSession::new(id.clone(), Arc::downgrade(self))?;
        let session = Arc::new(session);
        sessions.insert(id, Arc::clone(&session));

        debug!(worker = %self.key, session_id = %session.id(), sessions = sessions.len(), "Session opened");
        Ok((session, events))
    }

    /// Drop a session from the table. Unknown ids are ignored.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self.write_sessions().remove(session_id).is_some();
        if removed {
            debug!(worker = %self.key, session_id = %session_id, "Session removed");
        }
        removed
    }

    /// Write a frame to the worker connection.
    pub fn send(&self, frame: WorkerFrame) -> RelayResult<()> {
        if self.is_closed() {
            return Err(RelayError::WorkerGone(self.key.to_string()));
        }
        self.link.send(frame)
    }

    pub fn ping(&self) {
        if !self.is_closed() {
            self.link.ping();
        }
    }

    /// Route one JSON message received from the worker.
    ///
    /// ## Routing Rules:
    /// - `chat` results become [`SessionEvent::Text`]; devices only understand
    ///   `text`, so the relabeling is part of the device protocol
    /// - any other type is passed to the session unchanged as [`SessionEvent::Message`]
    /// - messages for unknown sessions are dropped
    ///
    /// Unparseable messages are returned as errors for the caller to log; they
    /// never reach a session.
    pub fn handle_message(&self, text: &str) -> RelayResult<Inbound> {
        let message: Value = serde_json::from_str(text)?;
        let kind = message
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::InvalidMessage("worker message has no type".to_string()))?;
        let session_id = message.get(SESSION_ID_FIELD).and_then(Value::as_str);

        let Some(session) = session_id.and_then(|id| self.session(id)) else {
            return Ok(Inbound::UnknownSession(session_id.map(str::to_string)));
        };

        let event = if kind == CHAT_RESULT {
            SessionEvent::Text(message.get("content").cloned().unwrap_or(Value::Null))
        } else {
            SessionEvent::Message(message.clone())
        };

        if session.deliver(event) {
            Ok(Inbound::Delivered)
        } else {
            Ok(Inbound::UnknownSession(Some(session.id().to_string())))
        }
    }

    /// Surface a transport failure to subscribers. Does not close the worker.
    pub fn report_error(&self, reason: &str) {
        error!(worker = %self.key, error = %reason, "Worker connection error");
        let _ = self.events.send(WorkerEvent::Error(reason.to_string()));
    }

    /// Close every session, clear the table and close the connection.
    ///
    /// Safe to call more than once; only the first call does anything.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let sessions: Vec<Arc<WorkerSession>> = self
            .write_sessions()
            .drain()
            .map(|(_, session)| session)
            .collect();
        let cascaded = sessions.iter().filter(|session| session.close()).count();

        let _ = self.events.send(WorkerEvent::Closed);
        self.link.close();

        info!(worker = %self.key, sessions_closed = cascaded, "Worker closed");
    }

    fn read_sessions(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<WorkerSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<WorkerSession>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::test_support::test_worker;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_new_session_registers_in_table() {
        let (worker, _link) = test_worker("127.0.0.1:9000");
        let (session, _events) = worker.new_session().unwrap();

        assert_eq!(worker.session_count(), 1);
        let found = worker.session(session.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &session));
        assert!(Arc::ptr_eq(&session.worker().unwrap(), &worker));
    }

    #[test]
    fn test_session_ids_are_unique() {
        let workers: Vec<_> = (0..4)
            .map(|i| test_worker(&format!("127.0.0.1:{}", 9000 + i)).0)
            .collect();

        let mut ids = HashSet::new();
        let mut keep = Vec::new();
        for n in 0..10_000 {
            let (session, events) = workers[n % workers.len()].new_session().unwrap();
            ids.insert(session.id().to_string());
            keep.push((session, events));
        }

        assert_eq!(ids.len(), 10_000);
        assert_eq!(workers.iter().map(|w| w.session_count()).sum::<usize>(), 10_000);
    }

    #[test]
    fn test_remove_session_is_idempotent() {
        let (worker, _link) = test_worker("127.0.0.1:9000");
        let (session, _events) = worker.new_session().unwrap();

        assert!(worker.remove_session(session.id()));
        assert!(!worker.remove_session(session.id()));
        assert!(!worker.remove_session("never-existed"));
        assert_eq!(worker.session_count(), 0);
    }

    /// Workers report recognized text as `chat`; devices expect `text`.
    /// This mapping is part of the device protocol and must not change.
    #[test]
    fn test_chat_result_is_relabeled_as_text() {
        let (worker, _link) = test_worker("127.0.0.1:9000");
        let (session, mut events) = worker.new_session().unwrap();

        let message = json!({"type": "chat", "session_id": session.id(), "content": "hello"});
        let routed = worker.handle_message(&message.to_string()).unwrap();

        assert_eq!(routed, Inbound::Delivered);
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Text(json!("hello")));
    }

    #[test]
    fn test_other_result_types_pass_through_unchanged() {
        let (worker, _link) = test_worker("127.0.0.1:9000");
        let (session, mut events) = worker.new_session().unwrap();

        let message = json!({"type": "partial", "session_id": session.id(), "content": "hel"});
        worker.handle_message(&message.to_string()).unwrap();

        assert_eq!(events.try_recv().unwrap(), SessionEvent::Message(message));
    }

    #[test]
    fn test_unknown_session_is_dropped() {
        let (worker, _link) = test_worker("127.0.0.1:9000");
        let (_session, mut events) = worker.new_session().unwrap();

        let routed = worker
            .handle_message(r#"{"type":"chat","session_id":"nonexistent","content":"x"}"#)
            .unwrap();

        assert_eq!(routed, Inbound::UnknownSession(Some("nonexistent".to_string())));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_malformed_message_is_rejected_without_side_effects() {
        let (worker, _link) = test_worker("127.0.0.1:9000");
        let (_session, mut events) = worker.new_session().unwrap();

        assert!(matches!(worker.handle_message("{oops"), Err(RelayError::InvalidMessage(_))));
        assert!(matches!(
            worker.handle_message(r#"{"session_id":"x"}"#),
            Err(RelayError::InvalidMessage(_))
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(worker.session_count(), 1);
    }

    #[test]
    fn test_send_preserves_frame_kind() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        worker.send(WorkerFrame::Binary(vec![1, 2])).unwrap();
        worker.send(WorkerFrame::Text("{}".to_string())).unwrap();

        assert_eq!(
            link.frames(),
            vec![WorkerFrame::Binary(vec![1, 2]), WorkerFrame::Text("{}".to_string())]
        );
    }

    #[test]
    fn test_close_cascades_to_every_session_once() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        let mut watchers = worker.subscribe();
        let mut observers: Vec<_> = (0..3).map(|_| worker.new_session().unwrap()).collect();

        worker.close();
        worker.close();

        assert_eq!(worker.session_count(), 0);
        for (session, events) in observers.iter_mut() {
            assert!(session.is_closed());
            assert_eq!(events.try_recv().unwrap(), SessionEvent::Closed);
            assert!(events.try_recv().is_err());
        }
        assert_eq!(watchers.try_recv().unwrap(), WorkerEvent::Closed);
        assert!(watchers.try_recv().is_err());
        assert_eq!(link.close_count(), 1);
    }

    #[test]
    fn test_closed_worker_refuses_new_work() {
        let (worker, link) = test_worker("127.0.0.1:9000");
        worker.close();

        assert!(matches!(worker.new_session(), Err(RelayError::WorkerGone(_))));
        assert!(worker.send(WorkerFrame::Text("{}".to_string())).is_err());
        worker.ping();
        assert_eq!(link.ping_count(), 0);
    }

    #[test]
    fn test_report_error_is_observable_and_non_fatal() {
        let (worker, _link) = test_worker("127.0.0.1:9000");
        let mut watchers = worker.subscribe();

        worker.report_error("connection reset");

        assert_eq!(
            watchers.try_recv().unwrap(),
            WorkerEvent::Error("connection reset".to_string())
        );
        assert!(!worker.is_closed());
    }
}
