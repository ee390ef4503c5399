//! Bridges live chain subscriptions to the coordinator.
//!
//! Subscription callbacks only push hints into a channel; a forwarder task
//! coalesces whatever has queued up and requests one best-effort pass for it.

use crate::indexing::coordinator::{IndexingCoordinator, UpdateRequest};
use crate::models::Hint;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct LiveUpdates {
    sender: mpsc::UnboundedSender<Vec<Hint>>,
}

impl LiveUpdates {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<Hint>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn request(&self, hints: Vec<Hint>) {
        if self.sender.send(hints).is_err() {
            debug!("Live update dropped: forwarder stopped");
        }
    }
}

pub fn spawn_forwarder(
    coordinator: Arc<IndexingCoordinator>,
    mut receiver: mpsc::UnboundedReceiver<Vec<Hint>>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut hints = tokio::select! {
                _ = token.cancelled() => break,
                received = receiver.recv() => match received {
                    Some(hints) => hints,
                    None => break,
                },
            };

            while let Ok(more) = receiver.try_recv() {
                hints.extend(more);
            }
            let mut seen = std::collections::HashSet::new();
            hints.retain(|hint| seen.insert(hint.clone()));

            debug!("Live update with {} hints", hints.len());
            if let Err(e) = coordinator.update(UpdateRequest::best_effort(hints)).await {
                warn!("Live indexing pass failed: {}", e);
            }
        }
        debug!("Live update forwarder stopped");
    })
}
