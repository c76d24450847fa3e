//! # Worker WebSocket Handler
//!
//! ASR workers connect to the backend listener over WebSocket. Each connection
//! becomes a `WorkerSocket` actor that registers a [`Worker`] in the pool, writes
//! the frames the relay queues for it, and feeds worker results back in.
//!
//! ## Liveness:
//! The pool's heartbeat sends [`WorkerCommand::Ping`]. Every pong, ping or
//! message from the worker refreshes `last_heartbeat`; if the worker has been
//! silent for longer than the client timeout when the next ping is due, the
//! actor stops. Stopping runs the disconnect path, which removes the worker
//! from the pool and closes its sessions.

use crate::error::{RelayError, RelayResult};
use crate::relay::pool::{WorkerKey, WorkerPool};
use crate::relay::worker::{Inbound, Worker, WorkerFrame, WorkerLink};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Settings shared by every worker connection on the backend listener.
#[derive(Clone)]
pub struct BackendListener {
    pub pool: Arc<WorkerPool>,
    pub client_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// Commands the relay sends to a worker connection.
#[derive(Message, Debug)]
#[rtype(result = "()")]
pub enum WorkerCommand {
    Frame(WorkerFrame),
    Ping,
    Close,
}

/// [`WorkerLink`] that forwards to a `WorkerSocket` actor's mailbox.
struct ActorLink {
    key: WorkerKey,
    addr: Addr<WorkerSocket>,
}

impl WorkerLink for ActorLink {
    fn send(&self, frame: WorkerFrame) -> RelayResult<()> {
        if !self.addr.connected() {
            return Err(RelayError::WorkerGone(self.key.to_string()));
        }
        // do_send ignores the mailbox capacity, so audio is never refused
        // while the connection is up.
        self.addr.do_send(WorkerCommand::Frame(frame));
        Ok(())
    }

    fn ping(&self) {
        self.addr.do_send(WorkerCommand::Ping);
    }

    fn close(&self) {
        if self.addr.connected() {
            self.addr.do_send(WorkerCommand::Close);
        }
    }
}

/// WebSocket actor for one ASR worker connection.
pub struct WorkerSocket {
    pool: Arc<WorkerPool>,
    key: WorkerKey,

    /// Set once the worker is registered in the pool
    worker: Option<Arc<Worker>>,

    /// Last time the worker showed any sign of life
    last_heartbeat: Instant,
    client_timeout: Duration,
}

impl WorkerSocket {
    pub fn new(pool: Arc<WorkerPool>, key: WorkerKey, client_timeout: Duration) -> Self {
        Self {
            pool,
            key,
            worker: None,
            last_heartbeat: Instant::now(),
            client_timeout,
        }
    }

    fn handle_result(&self, text: &str) {
        let Some(worker) = &self.worker else {
            return;
        };

        match worker.handle_message(text) {
            Ok(Inbound::Delivered) => {}
            Ok(Inbound::UnknownSession(session_id)) => {
                debug!(worker = %self.key, session_id = ?session_id, "Result for unknown session dropped");
            }
            Err(err) => {
                warn!(worker = %self.key, error = %err, "Dropping malformed worker message");
            }
        }
    }
}

impl Actor for WorkerSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let link = Arc::new(ActorLink {
            key: self.key.clone(),
            addr: ctx.address(),
        });

        match self.pool.register(self.key.clone(), link) {
            Some(worker) => self.worker = Some(worker),
            None => ctx.stop(),
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(worker) = self.worker.take() {
            self.pool.remove_worker(&worker);
        }
    }
}

impl Handler<WorkerCommand> for WorkerSocket {
    type Result = ();

    fn handle(&mut self, cmd: WorkerCommand, ctx: &mut Self::Context) {
        match cmd {
            WorkerCommand::Frame(WorkerFrame::Binary(data)) => ctx.binary(data),
            WorkerCommand::Frame(WorkerFrame::Text(text)) => ctx.text(text),
            WorkerCommand::Ping => {
                if Instant::now().duration_since(self.last_heartbeat) > self.client_timeout {
                    warn!(worker = %self.key, "Worker heartbeat timeout, dropping connection");
                    ctx.stop();
                } else {
                    ctx.ping(b"");
                }
            }
            WorkerCommand::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WorkerSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_result(&text);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                warn!(worker = %self.key, bytes = data.len(), "Unexpected binary frame from worker");
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(worker = %self.key, reason = ?reason, "Worker closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(worker = %self.key, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                if let Some(worker) = &self.worker {
                    worker.report_error(&err.to_string());
                }
                ctx.stop();
            }
        }
    }
}

/// Backend listener endpoint: upgrade a worker's HTTP request to WebSocket.
pub async fn worker_websocket(
    req: HttpRequest,
    stream: web::Payload,
    listener: web::Data<BackendListener>,
) -> ActixResult<HttpResponse> {
    let peer = req
        .peer_addr()
        .ok_or_else(|| actix_web::error::ErrorBadRequest("worker peer address unavailable"))?;
    let key = WorkerKey::from_peer(peer);
    debug!(worker = %key, "ASR worker connection request");

    let socket = WorkerSocket::new(listener.pool.clone(), key, listener.client_timeout);
    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(listener.max_frame_bytes)
        .start()
}
