//! In-process frame routing with a bounded in-flight window per destination.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use quarry_common::metrics::global_metrics;
use quarry_common::{QuarryError, Result, WorkerId};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::frame::ExchangeFrame;

/// Moves encoded frames to a destination worker.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Deliver `bytes` to `dest`, suspending while its window is full.
    ///
    /// # Errors
    /// `WorkerUnreachable` for unknown or disconnected destinations.
    async fn deliver(&self, dest: &WorkerId, bytes: Vec<u8>) -> Result<()>;
}

/// Receiving end of one worker's channel.
pub struct WorkerInbox {
    worker: WorkerId,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl WorkerInbox {
    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Next frame, or `None` once the hub dropped this worker.
    ///
    /// Undecodable frames are returned as errors; the inbox stays usable.
    pub async fn recv(&mut self) -> Option<Result<ExchangeFrame>> {
        let bytes = self.rx.recv().await?;
        Some(ExchangeFrame::decode(&bytes))
    }
}

/// Registry of per-worker bounded channels.
///
/// The channel capacity is the destination's in-flight frame budget: a
/// sender targeting a full destination waits until the receiver drains it.
#[derive(Default)]
pub struct ExchangeHub {
    senders: Mutex<HashMap<WorkerId, mpsc::Sender<Vec<u8>>>>,
}

impl ExchangeHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open (or replace) the channel for `worker` with `capacity` in-flight
    /// frames.
    pub fn register_worker(&self, worker: WorkerId, capacity: usize) -> Result<WorkerInbox> {
        if capacity == 0 {
            return Err(QuarryError::InvalidConfig(
                "exchange inbox capacity must be > 0".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(capacity);
        lock(&self.senders).insert(worker.clone(), tx);
        info!(worker_id = %worker, capacity, "exchange inbox registered");
        Ok(WorkerInbox { worker, rx })
    }

    /// Drop `worker`'s channel; later deliveries to it fail.
    pub fn disconnect(&self, worker: &WorkerId) {
        if lock(&self.senders).remove(worker).is_some() {
            info!(worker_id = %worker, "exchange inbox disconnected");
        }
    }

    fn sender_for(&self, dest: &WorkerId) -> Result<mpsc::Sender<Vec<u8>>> {
        lock(&self.senders)
            .get(dest)
            .cloned()
            .ok_or_else(|| QuarryError::WorkerUnreachable(format!("{dest} is not registered")))
    }
}

#[async_trait]
impl FrameTransport for ExchangeHub {
    async fn deliver(&self, dest: &WorkerId, bytes: Vec<u8>) -> Result<()> {
        let tx = self.sender_for(dest)?;
        if tx.capacity() == 0 {
            global_metrics().inc_exchange_backpressure_waits(dest.as_str());
            debug!(worker_id = %dest, "exchange destination window full; waiting");
        }
        tx.send(bytes)
            .await
            .map_err(|_| QuarryError::WorkerUnreachable(format!("{dest} inbox closed")))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn full_window_suspends_sender_until_drained() {
        let hub = ExchangeHub::new();
        let w = WorkerId::new("w1");
        let mut inbox = hub.register_worker(w.clone(), 2).unwrap();
        hub.deliver(&w, vec![1]).await.unwrap();
        hub.deliver(&w, vec![2]).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), hub.deliver(&w, vec![3])).await;
        assert!(blocked.is_err(), "third frame must wait for capacity");

        let hub2 = Arc::clone(&hub);
        let w2 = w.clone();
        let pending = tokio::spawn(async move { hub2.deliver(&w2, vec![3]).await });
        assert!(inbox.recv().await.is_some());
        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_and_disconnected_destinations_are_unreachable() {
        let hub = ExchangeHub::new();
        let err = hub.deliver(&WorkerId::new("nope"), vec![]).await.unwrap_err();
        assert!(matches!(err, QuarryError::WorkerUnreachable(_)));

        let w = WorkerId::new("w1");
        let inbox = hub.register_worker(w.clone(), 1).unwrap();
        drop(inbox);
        let err = hub.deliver(&w, vec![]).await.unwrap_err();
        assert!(matches!(err, QuarryError::WorkerUnreachable(_)));

        let _inbox = hub.register_worker(w.clone(), 1).unwrap();
        hub.disconnect(&w);
        assert!(hub.deliver(&w, vec![]).await.is_err());
    }
}
