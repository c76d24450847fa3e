//! # Worker Pool
//!
//! The table of connected ASR workers. Devices draw a worker from here, the
//! accept path adds to it, and the disconnect path removes from it.
//!
//! ## Thread Safety:
//! One `RwLock` guards the table. Selection and heartbeat take a read lock and
//! work on a snapshot; accept, disconnect and shutdown take the write lock.
//! Removal is idempotent, so the heartbeat eviction and the socket close
//! handler can race without double-closing anything.

use crate::relay::worker::{Worker, WorkerLink};
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

/// Stable identity of a worker connection: `"<ip>:<port>"` of the remote end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey(String);

impl WorkerKey {
    /// Build the key from the worker's remote address.
    ///
    /// The IPv6 loopback is reported as `127.0.0.1`, and IPv4-mapped IPv6
    /// addresses as plain IPv4, so a worker gets the same key whichever
    /// stack accepted it.
    pub fn from_peer(peer: SocketAddr) -> Self {
        let ip = match peer.ip() {
            IpAddr::V6(v6) if v6.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip.to_canonical(),
        };
        Self(format!("{}:{}", ip, peer.port()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Point-in-time view of one worker, for health reporting.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSummary {
    pub key: String,
    pub sessions: usize,
}

/// Live ASR workers keyed by their remote address.
#[derive(Debug)]
pub struct WorkerPool {
    workers: RwLock<HashMap<WorkerKey, Arc<Worker>>>,

    /// Cleared by `destroy`; late connections are closed instead of pooled
    accepting: AtomicBool,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Add a newly accepted worker connection.
    ///
    /// Returns `None` (after closing the link) once the pool is shut down. A
    /// stale entry under the same key is replaced and closed.
    pub fn register(&self, key: WorkerKey, link: Arc<dyn WorkerLink>) -> Option<Arc<Worker>> {
        let worker = Worker::new(key.clone(), link);

        // Checked under the table lock so destroy() cannot drain before the insert.
        let admitted = {
            let mut workers = self.write_workers();
            if self.accepting.load(Ordering::SeqCst) {
                Some(workers.insert(key.clone(), Arc::clone(&worker)))
            } else {
                None
            }
        };

        let Some(replaced) = admitted else {
            warn!(worker = %key, "Worker pool is shut down, refusing worker");
            worker.close();
            return None;
        };

        if let Some(stale) = replaced {
            warn!(worker = %key, "Replacing stale worker with the same address");
            stale.close();
        }

        info!(worker = %key, workers = self.len(), "ASR worker connected");
        Some(worker)
    }

    /// Remove `worker` from the pool and close it.
    ///
    /// The entry is only removed if it is still this exact worker, so a late
    /// close from a replaced connection cannot evict its successor. Returns
    /// whether an entry was removed; the worker is closed either way.
    pub fn remove_worker(&self, worker: &Arc<Worker>) -> bool {
        let removed = {
            let mut workers = self.write_workers();
            match workers.get(worker.key()) {
                Some(current) if Arc::ptr_eq(current, worker) => workers.remove(worker.key()).is_some(),
                _ => false,
            }
        };

        worker.close();
        if removed {
            info!(worker = %worker.key(), workers = self.len(), "ASR worker disconnected");
        }
        removed
    }

    /// Pick a live worker uniformly at random, or `None` when the pool is empty.
    pub fn get_worker(&self) -> Option<Arc<Worker>> {
        self.read_workers()
            .values()
            .filter(|worker| !worker.is_closed())
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Ping every worker. Returns how many were pinged.
    pub fn ping_all(&self) -> usize {
        let workers = self.snapshot();
        for worker in &workers {
            worker.ping();
        }
        workers.len()
    }

    pub fn len(&self) -> usize {
        self.read_workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_workers().is_empty()
    }

    /// Sessions open across all workers.
    pub fn session_count(&self) -> usize {
        self.snapshot().iter().map(|worker| worker.session_count()).sum()
    }

    pub fn summaries(&self) -> Vec<WorkerSummary> {
        let mut summaries: Vec<WorkerSummary> = self
            .snapshot()
            .iter()
            .map(|worker| WorkerSummary {
                key: worker.key().as_str().to_string(),
                sessions: worker.session_count(),
            })
            .collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// Stop accepting workers, then close and forget every worker.
    pub fn destroy(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let workers: Vec<Arc<Worker>> = self.write_workers().drain().map(|(_, worker)| worker).collect();
        for worker in &workers {
            worker.close();
        }

        info!(workers_closed = workers.len(), "Worker pool destroyed");
    }

    fn snapshot(&self) -> Vec<Arc<Worker>> {
        self.read_workers().values().cloned().collect()
    }

    fn read_workers(&self) -> RwLockReadGuard<'_, HashMap<WorkerKey, Arc<Worker>>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_workers(&self) -> RwLockWriteGuard<'_, HashMap<WorkerKey, Arc<Worker>>> {
        self.workers.write().unwrap_or_else(PoisonError::into_inner)
    }
}
