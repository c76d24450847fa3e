//! In-memory worker link for unit tests.

use crate::error::RelayResult;
use crate::relay::pool::WorkerKey;
use crate::relay::worker::{Worker, WorkerFrame, WorkerLink};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records everything the relay writes to a worker.
#[derive(Default)]
pub struct RecordingLink {
    frames: Mutex<Vec<WorkerFrame>>,
    pings: AtomicUsize,
    closes: AtomicUsize,
}

impl RecordingLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn frames(&self) -> Vec<WorkerFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn binary_frames(&self) -> Vec<Vec<u8>> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                WorkerFrame::Binary(data) => Some(data),
                WorkerFrame::Text(_) => None,
            })
            .collect()
    }

    pub fn json_frames(&self) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                WorkerFrame::Text(text) => Some(serde_json::from_str(&text).unwrap()),
                WorkerFrame::Binary(_) => None,
            })
            .collect()
    }

    pub fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl WorkerLink for RecordingLink {
    fn send(&self, frame: WorkerFrame) -> RelayResult<()> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }

    fn ping(&self) {
        self.pings.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// A worker at `addr` backed by a fresh [`RecordingLink`].
pub fn test_worker(addr: &str) -> (Arc<Worker>, Arc<RecordingLink>) {
    let link = RecordingLink::new();
    let worker = Worker::new(WorkerKey::from_peer(addr.parse().unwrap()), link.clone());
    (worker, link)
}
