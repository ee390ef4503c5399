use crate::db::documents;
use crate::models::{Document, DocumentRef};
use sqlx::{Pool, Sqlite};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Example ids kept (and logged) per distinct failure reason
pub const MAX_EXAMPLES_PER_REASON: usize = 5;

#[derive(Debug, Clone)]
pub enum WriteOp {
    Upsert {
        doc: Document,
        source_id: Option<String>,
        generation: Option<String>,
    },
    Delete(DocumentRef),
}

impl WriteOp {
    fn target(&self) -> (&str, &str) {
        match self {
            WriteOp::Upsert { doc, .. } => (&doc.doc_type, &doc.id),
            WriteOp::Delete(doc_ref) => (&doc_ref.doc_type, &doc_ref.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureReason {
    pub count: usize,
    pub examples: Vec<String>,
}

/// A flushed batch in which some operations failed. The operations that
/// succeeded stay committed.
#[derive(Error, Debug, Clone)]
#[error("Bulk write failed for {failed} of {attempted} operations: {}", summarize(.reasons))]
pub struct BulkWriteError {
    pub attempted: usize,
    pub failed: usize,
    pub reasons: BTreeMap<String, FailureReason>,
}

fn summarize(reasons: &BTreeMap<String, FailureReason>) -> String {
    reasons
        .iter()
        .map(|(reason, failure)| {
            format!("{} x{} (e.g. {})", reason, failure.count, failure.examples.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Default)]
struct BufferState {
    pending: Vec<WriteOp>,
    in_flight: Arc<Vec<WriteOp>>,
    written_types: HashSet<String>,
}

/// Batches document writes against the store.
///
/// Writes flush when the pending queue reaches `batch_size`, on an explicit
/// [`flush`](Self::flush), or from the periodic flusher. The pending queue is
/// swapped out under the state lock, so writes enqueued while a flush runs
/// land in the next batch. Reads see pending and in-flight writes.
pub struct BulkWriteBuffer {
    pool: Pool<Sqlite>,
    batch_size: usize,
    state: Mutex<BufferState>,
    flush_lock: Mutex<()>,
    failed_flushes: AtomicU64,
}

impl BulkWriteBuffer {
    pub fn new(pool: Pool<Sqlite>, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
            state: Mutex::new(BufferState::default()),
            flush_lock: Mutex::new(()),
            failed_flushes: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn save(
        &self,
        doc: Document,
        source_id: Option<String>,
        generation: Option<String>,
    ) -> Result<(), BulkWriteError> {
        self.enqueue(WriteOp::Upsert {
            doc,
            source_id,
            generation,
        })
        .await
    }

    pub async fn delete(&self, doc_ref: DocumentRef) -> Result<(), BulkWriteError> {
        self.enqueue(WriteOp::Delete(doc_ref)).await
    }

    async fn enqueue(&self, op: WriteOp) -> Result<(), BulkWriteError> {
        let full = {
            let mut state = self.state.lock().await;
            state.pending.push(op);
            state.pending.len() >= self.batch_size
        };

        if full {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Latest buffered state of a document: `Some(None)` for a buffered
    /// delete, `None` when the buffer holds nothing for it.
    async fn buffered(&self, doc_type: &str, id: &str) -> Option<Option<Document>> {
        let state = self.state.lock().await;
        state
            .pending
            .iter()
            .rev()
            .chain(state.in_flight.iter().rev())
            .find(|op| op.target() == (doc_type, id))
            .map(|op| match op {
                WriteOp::Upsert { doc, .. } => Some(doc.clone()),
                WriteOp::Delete(_) => None,
            })
    }

    /// Read through the buffer to the store
    pub async fn read(&self, doc_type: &str, id: &str) -> Result<Option<Document>, sqlx::Error> {
        match self.buffered(doc_type, id).await {
            Some(buffered) => Ok(buffered),
            None => documents::get_document(&self.pool, doc_type, id).await,
        }
    }

    /// Flushes that dropped at least one operation since startup. A caller
    /// compares readings to learn whether anything it queued was lost, even
    /// when another caller's flush carried it.
    pub fn failed_flushes(&self) -> u64 {
        self.failed_flushes.load(Ordering::SeqCst)
    }

    /// Document types written by flushes since the last call
    pub async fn take_written_types(&self) -> HashSet<String> {
        std::mem::take(&mut self.state.lock().await.written_types)
    }

    /// Write every pending operation in one transaction. Failed operations
    /// are collated into a [`BulkWriteError`]; the rest are committed.
    pub async fn flush(&self) -> Result<usize, BulkWriteError> {
        let _flushing = self.flush_lock.lock().await;

        let batch = {
            let mut state = self.state.lock().await;
            if state.pending.is_empty() {
                return Ok(0);
            }
            let batch = Arc::new(std::mem::take(&mut state.pending));
            state.in_flight = Arc::clone(&batch);
            batch
        };

        let result = self.write_batch(&batch).await;

        let mut state = self.state.lock().await;
        state.in_flight = Arc::new(Vec::new());

        match result {
            Ok((written_types, failures)) => {
                state.written_types.extend(written_types);
                drop(state);

                if failures.is_empty() {
                    debug!("Flushed {} document operations", batch.len());
                    return Ok(batch.len());
                }
                self.failed_flushes.fetch_add(1, Ordering::SeqCst);
                Err(collate(batch.len(), failures))
            }
            Err(e) => {
                drop(state);
                self.failed_flushes.fetch_add(1, Ordering::SeqCst);
                error!("Bulk write of {} operations failed: {}", batch.len(), e);
                Err(collate(
                    batch.len(),
                    batch
                        .iter()
                        .map(|op| (describe(op), e.to_string()))
                        .collect(),
                ))
            }
        }
    }

    async fn write_batch(
        &self,
        batch: &[WriteOp],
    ) -> Result<(HashSet<String>, Vec<(String, String)>), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mut written_types = HashSet::new();
        let mut failures = Vec::new();

        for op in batch {
            let result = match op {
                WriteOp::Upsert {
                    doc,
                    source_id,
                    generation,
                } => {
                    documents::upsert_document(&mut tx, doc, source_id.as_deref(), generation.as_deref())
                        .await
                        .map(|_| ())
                }
                WriteOp::Delete(doc_ref) => documents::delete_document(&mut tx, doc_ref).await.map(|_| ()),
            };

            match result {
                Ok(()) => {
                    written_types.insert(op.target().0.to_string());
                }
                Err(e) => failures.push((describe(op), e.to_string())),
            }
        }

        tx.commit().await?;
        Ok((written_types, failures))
    }

    /// Flush every `every` until `token` is cancelled, then flush once more
    pub fn spawn_periodic_flush(self: &Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let buffer = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = buffer.flush().await {
                            error!("Periodic flush failed: {}", e);
                        }
                    }
                }
            }

            match buffer.flush().await {
                Ok(count) => info!("Final flush wrote {} document operations", count),
                Err(e) => error!("Final flush failed: {}", e),
            }
        })
    }
}

fn describe(op: &WriteOp) -> String {
    let (doc_type, id) = op.target();
    format!("{}/{}", doc_type, id)
}

fn collate(attempted: usize, failures: Vec<(String, String)>) -> BulkWriteError {
    let failed = failures.len();
    let mut reasons: BTreeMap<String, FailureReason> = BTreeMap::new();

    for (target, reason) in failures {
        let entry = reasons.entry(reason).or_insert(FailureReason {
            count: 0,
            examples: Vec::new(),
        });
        entry.count += 1;
        if entry.examples.len() < MAX_EXAMPLES_PER_REASON {
            entry.examples.push(target);
        }
    }

    for (reason, failure) in &reasons {
        error!(
            "{} document writes failed: {} (examples: {})",
            failure.count,
            reason,
            failure.examples.join(", ")
        );
    }

    BulkWriteError {
        attempted,
        failed,
        reasons,
    }
}
