//! Live subscriptions, realised by polling the chain head.
//!
//! Each subscription runs as its own task. Callbacks fire in chain order; a
//! block or log may be delivered again after a failed poll, so consumers must
//! be idempotent.

use crate::blockchain::client::{ChainClient, ChainError};
use crate::blockchain::models::{Block, BlockId, BlockNotification, Log, LogFilter};
use alloy_primitives::Address;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
pub(crate) struct Subscriptions {
    token: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Addresses the live block subscription reports as touched
#[derive(Clone, Default)]
pub struct LiveFilter {
    addresses: Arc<RwLock<HashSet<Address>>>,
}

impl LiveFilter {
    pub async fn watch(&self, address: Address) {
        self.addresses.write().await.insert(address);
    }

    pub async fn unwatch(&self, address: &Address) {
        self.addresses.write().await.remove(address);
    }

    pub async fn contains(&self, address: &Address) -> bool {
        self.addresses.read().await.contains(address)
    }

    pub async fn len(&self) -> usize {
        self.addresses.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.addresses.read().await.is_empty()
    }

    /// Watched addresses appearing as sender or recipient in `block`
    pub async fn touched_by(&self, block: &Block) -> Vec<Address> {
        let watched = self.addresses.read().await;
        let mut touched = Vec::new();
        for tx in &block.transactions {
            for address in std::iter::once(&tx.from).chain(tx.to.as_ref()) {
                if watched.contains(address) && !touched.contains(address) {
                    touched.push(*address);
                }
            }
        }
        touched
    }
}

impl ChainClient {
    /// Invoke `callback` for every block mined after this call returns
    pub async fn subscribe_new_blocks<F>(
        self: &Arc<Self>,
        filter: LiveFilter,
        callback: F,
    ) -> Result<(), ChainError>
    where
        F: Fn(BlockNotification) + Send + Sync + 'static,
    {
        let head = self.current_block_height().await?;
        let token = self.subscriptions.token.lock().await.child_token();
        let client = Arc::clone(self);

        let handle = tokio::spawn(async move {
            poll_blocks(client, head, filter, callback, token).await;
        });
        self.subscriptions.handles.lock().await.push(handle);

        info!("Subscribed to new blocks from {}", head + 1);
        Ok(())
    }

    /// Invoke `callback` for every log matching `filter` mined after this call returns
    pub async fn subscribe_logs<F>(
        self: &Arc<Self>,
        filter: LogFilter,
        callback: F,
    ) -> Result<(), ChainError>
    where
        F: Fn(Log) + Send + Sync + 'static,
    {
        let head = self.current_block_height().await?;
        let token = self.subscriptions.token.lock().await.child_token();
        let client = Arc::clone(self);

        let handle = tokio::spawn(async move {
            poll_logs(client, head, filter, callback, token).await;
        });
        self.subscriptions.handles.lock().await.push(handle);

        info!("Subscribed to logs from {}", head + 1);
        Ok(())
    }

    /// Tear down every subscription. No callback runs after this returns;
    /// new subscriptions may be created afterwards.
    pub async fn stop_all(&self) {
        let token = {
            let mut guard = self.subscriptions.token.lock().await;
            std::mem::take(&mut *guard)
        };
        token.cancel();

        let handles = std::mem::take(&mut *self.subscriptions.handles.lock().await);
        let count = handles.len();
        for handle in handles {
            let _ = handle.await;
        }

        if count > 0 {
            info!("Stopped {} chain subscriptions", count);
        }
    }
}

async fn poll_blocks<F>(
    client: Arc<ChainClient>,
    mut last_seen: u64,
    filter: LiveFilter,
    callback: F,
    token: CancellationToken,
) where
    F: Fn(BlockNotification) + Send + Sync + 'static,
{
    let mut ticker = interval(client.settings().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Block subscription cancelled");
                break;
            }
            _ = ticker.tick() => {
                let head = match client.current_block_height().await {
                    Ok(head) => head,
                    Err(e) => {
                        warn!("Block poll failed to read head: {}", e);
                        continue;
                    }
                };

                for number in (last_seen + 1)..=head {
                    let block = match client.get_block(BlockId::Number(number)).await {
                        Ok(block) => block,
                        Err(e) => {
                            // Picked up again on the next tick
                            warn!("Block poll failed to fetch block {}: {}", number, e);
                            break;
                        }
                    };

                    let touched = filter.touched_by(&block).await;
                    if token.is_cancelled() {
                        return;
                    }
                    callback(BlockNotification { block, touched });
                    last_seen = number;
                }
            }
        }
    }
}

async fn poll_logs<F>(
    client: Arc<ChainClient>,
    mut last_seen: u64,
    filter: LogFilter,
    callback: F,
    token: CancellationToken,
) where
    F: Fn(Log) + Send + Sync + 'static,
{
    let mut ticker = interval(client.settings().poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Log subscription cancelled");
                break;
            }
            _ = ticker.tick() => {
                let head = match client.current_block_height().await {
                    Ok(head) if head > last_seen => head,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Log poll failed to read head: {}", e);
                        continue;
                    }
                };

                match client.get_past_logs(last_seen + 1, head, &filter).await {
                    Ok(logs) => {
                        for log in logs {
                            if token.is_cancelled() {
                                return;
                            }
                            callback(log);
                        }
                        last_seen = head;
                    }
                    Err(e) => warn!("Log poll for {}-{} failed: {}", last_seen + 1, head, e),
                }
            }
        }
    }
}
