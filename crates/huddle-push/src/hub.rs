//! Sharded push notification hub.
//!
//! A fixed array of bounded queues, one worker per queue. A task is routed
//! by `fnv1a32(user_id) % shard_count`, so every task for one user lands on
//! the same worker in enqueue order.

use std::sync::Arc;
use std::time::Duration;

use huddle_settings::PushSettings;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::PushError;
use crate::sender::PushSender;
use crate::task::PushNotification;
use crate::worker::run_worker;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Shard index for `user_id` among `shard_count` shards.
pub fn shard_for(user_id: &str, shard_count: usize) -> usize {
    fnv1a32(user_id.as_bytes()) as usize % shard_count
}

/// Running push hub.
pub struct PushHub {
    shards: RwLock<Vec<mpsc::Sender<PushNotification>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sender: Arc<PushSender>,
    shard_count: usize,
}

impl PushHub {
    /// Create the queues and spawn one worker per shard.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(sender: Arc<PushSender>, settings: &PushSettings) -> Self {
        let shard_count = settings.shard_count.max(1);
        let capacity = settings.shard_capacity.max(1);
        let mut shards = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for shard in 0..shard_count {
            let (tx, rx) = mpsc::channel(capacity);
            shards.push(tx);
            workers.push(tokio::spawn(run_worker(shard, rx, sender.clone())));
        }
        info!(shard_count, capacity, "push hub started");
        Self {
            shards: RwLock::new(shards),
            workers: Mutex::new(workers),
            sender,
            shard_count,
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    /// The shared sender (for acks).
    pub fn sender(&self) -> &Arc<PushSender> {
        &self.sender
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.shards.read().is_empty()
    }

    /// Route a task to its user's shard.
    ///
    /// Waits while the shard's queue is full. Fails with
    /// [`PushError::HubStopped`] after [`stop`](Self::stop).
    pub async fn enqueue(&self, notification: PushNotification) -> Result<(), PushError> {
        let shard = shard_for(notification.user_id.as_str(), self.shard_count);
        let tx = self
            .shards
            .read()
            .get(shard)
            .cloned()
            .ok_or(PushError::HubStopped)?;

        let kind = notification.kind.as_str();
        self.sender.observer().enqueued(
            &notification.id,
            kind,
            &notification.user_id,
            &notification.channel_id,
            notification.post_id(),
        );
        debug!(notification_id = %notification.id, shard, kind, "push notification enqueued");

        tx.send(notification)
            .await
            .map_err(|_| PushError::HubStopped)?;
        counter!("push_enqueued_total", "kind" => kind).increment(1);
        Ok(())
    }

    /// Close every shard queue. Workers drain what is already queued and exit.
    pub fn stop(&self) {
        let closed = std::mem::take(&mut *self.shards.write());
        if !closed.is_empty() {
            info!(shard_count = closed.len(), "push hub stopping");
        }
    }

    /// Stop and wait up to `timeout` for the workers to drain.
    ///
    /// Returns `true` when every worker exited in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        let workers = std::mem::take(&mut *self.workers.lock());
        let joined = tokio::time::timeout(timeout, async {
            for worker in workers {
                let _ = worker.await;
            }
        })
        .await;
        if joined.is_err() {
            warn!(?timeout, "push workers did not finish before the shutdown timeout");
        }
        joined.is_ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
