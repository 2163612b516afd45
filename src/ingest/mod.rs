//! Asynchronous write path: a FIFO of raw payloads drained by a fixed pool
//! of workers. Callers get an acknowledgement as soon as the payload is queued;
//! anything that fails afterwards is logged and dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StoreError};
use crate::recorder::Recorder;
use crate::state::{FlowState, Snapshot, Step};

/// A raw JSON payload waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Step(Vec<u8>),
    Snapshot(Vec<u8>),
    FlowStart(Vec<u8>),
    FlowEnd(Vec<u8>),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::Step(_) => "step",
            Payload::Snapshot(_) => "snapshot",
            Payload::FlowStart(_) => "flow start",
            Payload::FlowEnd(_) => "flow end",
        }
    }
}

struct Shared {
    queue: Mutex<VecDeque<Payload>>,
    available: Notify,
    closed: AtomicBool,
    capacity: Option<usize>,
    recorder: Arc<Recorder>,
}

impl Shared {
    async fn process(&self, payload: Payload) {
        let kind = payload.kind();
        let outcome = match payload {
            Payload::Step(raw) => match serde_json::from_slice::<Step>(&raw) {
                Ok(step) => self.recorder.save_step(&step).await,
                Err(e) => Err(StoreError::from(e)),
            },
            Payload::Snapshot(raw) => match serde_json::from_slice::<Snapshot>(&raw) {
                Ok(snapshot) => self.recorder.save_snapshot(&snapshot).await,
                Err(e) => Err(StoreError::from(e)),
            },
            Payload::FlowStart(raw) => match serde_json::from_slice::<FlowState>(&raw) {
                Ok(state) => self.recorder.record_start(&state).await,
                Err(e) => Err(StoreError::from(e)),
            },
            Payload::FlowEnd(raw) => match serde_json::from_slice::<FlowState>(&raw) {
                Ok(state) => self.recorder.record_end(&state).await,
                Err(e) => Err(StoreError::from(e)),
            },
        };

        match outcome {
            Ok(()) => debug!(kind, "Persisted queued payload"),
            Err(StoreError::Serialization(e)) => {
                warn!(kind, error = %e, "Dropping malformed payload");
            }
            Err(e) => error!(kind, error = %e, "Dropping payload after write failure"),
        }
    }
}

/// Queue plus worker pool in front of a [`Recorder`].
pub struct IngestionPipeline {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestionPipeline {
    /// Spawn `workers` drain tasks. `capacity` bounds the number of queued payloads.
    pub fn start(recorder: Arc<Recorder>, workers: usize, capacity: Option<usize>) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
            recorder,
        });

        let workers = workers.max(1);
        let handles = (0..workers)
            .map(|id| tokio::spawn(worker(id, shared.clone())))
            .collect();
        info!(workers, "Ingestion pipeline started");

        Self {
            shared,
            workers: Mutex::new(handles),
        }
    }

    /// Queue a payload and return immediately.
    pub async fn submit(&self, payload: Payload) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        {
            let mut queue = self.shared.queue.lock().await;
            if let Some(cap) = self.shared.capacity
                && queue.len() >= cap
            {
                return Err(StoreError::Overloaded(queue.len()));
            }
            queue.push_back(payload);
        }
        self.shared.available.notify_one();
        Ok(())
    }

    pub async fn pending(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Stop accepting payloads, let workers drain the queue, and wait for them.
    pub async fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.available.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Ingestion worker panicked");
            }
        }
        info!("Ingestion pipeline stopped");
    }
}

async fn worker(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "Ingestion worker started");
    loop {
        // Register interest before looking at the queue so a notification
        // sent in between is not lost.
        let notified = shared.available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = shared.queue.lock().await.pop_front();
        match next {
            Some(payload) => shared.process(payload).await,
            None if shared.closed.load(Ordering::Acquire) => break,
            None => notified.await,
        }
    }
    debug!(worker = id, "Ingestion worker stopped");
}
