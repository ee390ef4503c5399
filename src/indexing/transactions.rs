use crate::blockchain::abi::address_id;
use crate::blockchain::client::ChainClient;
use crate::blockchain::models::{Block, BlockId, Receipt, Transaction};
use crate::indexing::error::IndexingError;
use crate::indexing::keyed::KeyedLocks;
use crate::indexing::operations::Operations;
use crate::indexing::tracker::AddressTracker;
use crate::indexing::IndexingSettings;
use crate::models::ethereum::{
    position_of, transaction_document, transaction_ref, AddressDocument, ADDRESS_TYPE,
};
use crate::models::DocumentRef;
use alloy_primitives::{Address, B256};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Indexes the transactions of tracked addresses.
///
/// Blocks are scanned in ascending order, in pages of `backfill_page_size`
/// blocks fetched with bounded concurrency. Every tracked address carries a
/// last indexed block. It moves forward as pages are scanned and is reset to
/// the persisted meta at the start of each pass, so a pass after a restart or
/// a failed flush resumes exactly where the stored documents end.
pub struct TransactionIndexer {
    client: Arc<ChainClient>,
    tracker: Arc<AddressTracker>,
    locks: KeyedLocks,
    last_indexed: Mutex<BTreeMap<Address, u64>>,
    start_block: u64,
    page_size: u64,
    concurrency: usize,
}

impl TransactionIndexer {
    pub fn new(
        client: Arc<ChainClient>,
        tracker: Arc<AddressTracker>,
        start_block: u64,
        settings: &IndexingSettings,
    ) -> Self {
        Self {
            client,
            tracker,
            locks: KeyedLocks::new(),
            last_indexed: Mutex::new(BTreeMap::new()),
            start_block,
            page_size: settings.backfill_page_size.max(1),
            concurrency: settings.concurrency.max(1),
        }
    }

    pub fn tracker(&self) -> &Arc<AddressTracker> {
        &self.tracker
    }

    /// Replace the in-memory bookkeeping with the persisted meta. Progress
    /// made by a pass whose writes never reached the store is discarded, so
    /// the blocks it covered are scanned again.
    pub async fn restore(&self, persisted: &BTreeMap<String, u64>) {
        let mut last_indexed = self.last_indexed.lock().await;
        last_indexed.clear();
        for (address, block) in persisted {
            match Address::from_str(address) {
                Ok(address) => {
                    last_indexed.insert(address, *block);
                }
                Err(e) => warn!("Ignoring persisted block height for {}: {}", address, e),
            }
        }
    }

    pub async fn snapshot(&self) -> BTreeMap<String, u64> {
        self.last_indexed
            .lock()
            .await
            .iter()
            .map(|(address, block)| (address_id(address), *block))
            .collect()
    }

    pub async fn last_indexed_block(&self, address: &Address) -> Option<u64> {
        self.last_indexed.lock().await.get(address).copied()
    }

    async fn resume_block(&self, address: &Address) -> u64 {
        match self.last_indexed.lock().await.get(address) {
            Some(block) => block + 1,
            None => self.start_block,
        }
    }

    /// Index one block for every tracked address. Bookkeeping advances only
    /// for addresses whose history is contiguous up to the block's parent;
    /// the others are caught up by the next [`catch_up`](Self::catch_up).
    ///
    /// This is the single-block entry point. Live indexing does not call it:
    /// block notifications become address hints, and the pass they trigger
    /// runs [`catch_up`](Self::catch_up) from each address's persisted block.
    pub async fn index_new_block(&self, block: &Block, ops: &Operations) -> Result<usize, IndexingError> {
        let tracked = self.tracker.tracked().await;
        let indexed = self.apply_block(block, &tracked, ops).await?;

        let mut last_indexed = self.last_indexed.lock().await;
        for address in &tracked {
            if block.number > 0 && last_indexed.get(address) == Some(&(block.number - 1)) {
                last_indexed.insert(*address, block.number);
            }
        }
        Ok(indexed)
    }

    /// Scan from `since_block` (or just after the address's last indexed
    /// block) up to the head. Safe to re-run: transactions already listed on
    /// the address document are recognised by hash.
    pub async fn backfill_address(
        &self,
        address: Address,
        since_block: Option<u64>,
        ops: &Operations,
    ) -> Result<u64, IndexingError> {
        let from = match since_block {
            Some(block) => block,
            None => self.resume_block(&address).await,
        };
        let head = self.client.current_block_height().await?;

        info!("Backfilling {} from block {} to {}", address, from, head);
        self.scan(&[(address, from)], head, ops).await?;
        self.ensure_document(address, head, ops).await?;
        Ok(head)
    }

    /// Backfill several addresses with one joint block scan, each from just
    /// after its last indexed block
    pub async fn backfill(&self, addresses: &[Address], ops: &Operations) -> Result<u64, IndexingError> {
        let head = self.client.current_block_height().await?;

        let mut work = Vec::with_capacity(addresses.len());
        for address in addresses {
            let from = self.resume_block(address).await;
            if from <= head {
                work.push((*address, from));
            }
        }

        if !work.is_empty() {
            debug!("Scanning {} addresses up to block {}", work.len(), head);
            self.scan(&work, head, ops).await?;
        }
        for address in addresses {
            self.ensure_document(*address, head, ops).await?;
        }
        Ok(head)
    }

    /// Bring every tracked address up to the current head
    pub async fn catch_up(&self, ops: &Operations) -> Result<u64, IndexingError> {
        let tracked = self.tracker.tracked().await;
        self.backfill(&tracked, ops).await
    }

    /// Addresses with bookkeeping that are no longer tracked, e.g. because
    /// their referrers disappeared while the service was down
    pub async fn orphaned(&self) -> Vec<Address> {
        let known: Vec<Address> = self.last_indexed.lock().await.keys().copied().collect();
        let mut orphaned = Vec::new();
        for address in known {
            if !self.tracker.is_tracked(&address).await {
                orphaned.push(address);
            }
        }
        orphaned
    }

    async fn scan(&self, work: &[(Address, u64)], head: u64, ops: &Operations) -> Result<(), IndexingError> {
        let Some(from) = work.iter().map(|(_, from)| *from).min() else {
            return Ok(());
        };

        let mut page_start = from;
        while page_start <= head {
            let page_end = page_start.saturating_add(self.page_size - 1).min(head);

            let blocks: Vec<Block> = stream::iter(page_start..=page_end)
                .map(|number| self.client.get_block(BlockId::Number(number)))
                .buffered(self.concurrency)
                .try_collect()
                .await?;

            for block in &blocks {
                let active: Vec<Address> = work
                    .iter()
                    .filter(|(_, from)| *from <= block.number)
                    .map(|(address, _)| *address)
                    .collect();
                self.apply_block(block, &active, ops).await?;
            }

            let mut last_indexed = self.last_indexed.lock().await;
            for (address, from) in work {
                if *from <= page_end {
                    let entry = last_indexed.entry(*address).or_insert(page_end);
                    *entry = (*entry).max(page_end);
                }
            }
            drop(last_indexed);

            page_start = page_end + 1;
        }
        Ok(())
    }

    async fn apply_block(&self, block: &Block, addresses: &[Address], ops: &Operations) -> Result<usize, IndexingError> {
        let relevant: Vec<(&Transaction, Vec<Address>)> = block
            .transactions
            .iter()
            .filter_map(|tx| {
                let involved: Vec<Address> = addresses.iter().filter(|a| tx.involves(a)).copied().collect();
                (!involved.is_empty()).then_some((tx, involved))
            })
            .collect();
        if relevant.is_empty() {
            return Ok(0);
        }

        let hashes: Vec<B256> = relevant.iter().map(|(tx, _)| tx.hash).collect();
        let receipts: Vec<Receipt> = stream::iter(hashes)
            .map(|hash| self.client.get_transaction_receipt(hash))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let mut touched: BTreeMap<Address, Vec<DocumentRef>> = BTreeMap::new();
        for ((tx, involved), receipt) in relevant.iter().zip(&receipts) {
            ops.save(transaction_document(block, tx, receipt)).await?;
            let tx_ref = transaction_ref(&tx.hash.to_string(), position_of(tx, block));
            for address in involved {
                touched.entry(*address).or_default().push(tx_ref.clone());
            }
        }

        stream::iter(touched)
            .map(|(address, refs)| self.update_address(address, refs, block.number, ops))
            .buffer_unordered(self.concurrency)
            .try_collect::<Vec<()>>()
            .await?;

        debug!("Indexed {} transactions from block {}", relevant.len(), block.number);
        Ok(relevant.len())
    }

    async fn update_address(
        &self,
        address: Address,
        refs: Vec<DocumentRef>,
        block_number: u64,
        ops: &Operations,
    ) -> Result<(), IndexingError> {
        let id = address_id(&address);
        let _guard = self.locks.lock(&id).await;

        let existing = ops.read(ADDRESS_TYPE, &id).await?;
        let mut doc = existing
            .as_ref()
            .and_then(AddressDocument::from_document)
            .unwrap_or_else(|| AddressDocument::new(address));

        if !doc.merge_transactions(refs) && existing.is_some() {
            return Ok(());
        }

        doc.balance_wei = self.client.get_balance(address).await?;
        doc.record_update(block_number);
        ops.save(doc.into_document()).await
    }

    /// Create the address document for an address without transactions
    async fn ensure_document(&self, address: Address, head: u64, ops: &Operations) -> Result<(), IndexingError> {
        let id = address_id(&address);
        let _guard = self.locks.lock(&id).await;

        if ops.read(ADDRESS_TYPE, &id).await?.is_some() {
            return Ok(());
        }

        let mut doc = AddressDocument::new(address);
        doc.balance_wei = self.client.get_balance(address).await?;
        doc.record_update(head);
        ops.save(doc.into_document()).await
    }

    /// Re-read the live balance of a tracked address
    pub async fn refresh_balance(&self, address: Address, ops: &Operations) -> Result<(), IndexingError> {
        if !self.tracker.is_tracked(&address).await {
            return Ok(());
        }

        let id = address_id(&address);
        let _guard = self.locks.lock(&id).await;

        let Some(existing) = ops.read(ADDRESS_TYPE, &id).await? else {
            return Ok(());
        };
        let Some(mut doc) = AddressDocument::from_document(&existing) else {
            return Ok(());
        };

        let balance = self.client.get_balance(address).await?;
        if balance == doc.balance_wei {
            return Ok(());
        }

        let head = self.client.current_block_height().await?;
        doc.balance_wei = balance;
        doc.record_update(head);
        ops.save(doc.into_document()).await
    }

    /// Drop the address document and bookkeeping of an untracked address.
    /// Transaction documents stay: other addresses may list them.
    pub async fn purge(&self, address: Address, ops: &Operations) -> Result<(), IndexingError> {
        let id = address_id(&address);
        let _guard = self.locks.lock(&id).await;

        ops.delete(ADDRESS_TYPE, &id).await?;
        self.last_indexed.lock().await.remove(&address);
        info!("Purged address document for {}", address);
        Ok(())
    }
}

