//! Shard worker loop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::sender::PushSender;
use crate::task::PushNotification;

/// Process tasks from one shard until its queue is closed and drained.
///
/// Dispatch is sequential, so a slow relay call only holds up this shard.
#[instrument(skip_all, fields(shard = shard))]
pub async fn run_worker(
    shard: usize,
    mut rx: mpsc::Receiver<PushNotification>,
    sender: Arc<PushSender>,
) {
    while let Some(notification) = rx.recv().await {
        let report = sender.process(notification).await;
        if report.failed > 0 {
            debug!(shard, failed = report.failed, sent = report.sent, "push task finished with failures");
        }
    }
    debug!(shard, "push worker exiting");
}
