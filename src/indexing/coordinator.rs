use crate::cache::SchemaCache;
use crate::db::meta;
use crate::indexing::bulk_writer::BulkWriteBuffer;
use crate::indexing::error::IndexingError;
use crate::indexing::operations::Operations;
use crate::indexing::registry::{DataSourceRegistry, DataSourceSession};
use crate::models::{is_schema_type, Hint};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use serde_json::Value;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    /// Served before best-effort requests
    pub real_time: bool,
    /// Records likely to be dirty; empty means reconcile everything
    pub hints: Vec<Hint>,
}

impl UpdateRequest {
    pub fn real_time() -> Self {
        Self {
            real_time: true,
            hints: Vec::new(),
        }
    }

    pub fn best_effort(hints: Vec<Hint>) -> Self {
        Self {
            real_time: false,
            hints,
        }
    }

    pub fn with_hints(mut self, hints: Vec<Hint>) -> Self {
        self.hints = hints;
        self
    }
}

/// Update requests accepted and answered so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub requested: u64,
    pub completed: u64,
}

pub type PassResult = Result<(), Arc<IndexingError>>;

struct Waiter {
    hints: Vec<Hint>,
    done: oneshot::Sender<PassResult>,
}

#[derive(Default)]
struct Queues {
    running: bool,
    real_time: Vec<Waiter>,
    best_effort: Vec<Waiter>,
}

/// Runs indexing passes over every data source, one pass at a time.
///
/// Requests that arrive while a pass runs wait for the next one, which
/// serves all of them together. The loop drains the real-time queue before
/// the best-effort queue and stops once both are empty; the next `update`
/// starts it again. A failed pass rejects every request it served and the
/// loop carries on with the next.
pub struct IndexingCoordinator {
    buffer: Arc<BulkWriteBuffer>,
    sources: DataSourceRegistry,
    schema_cache: SchemaCache,
    queues: Mutex<Queues>,
    progress: watch::Sender<Progress>,
    passes: AtomicU64,
}

impl IndexingCoordinator {
    pub fn new(buffer: Arc<BulkWriteBuffer>, sources: DataSourceRegistry, schema_cache: SchemaCache) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            buffer,
            sources,
            schema_cache,
            queues: Mutex::new(Queues::default()),
            progress,
            passes: AtomicU64::new(0),
        }
    }

    pub fn sources(&self) -> &DataSourceRegistry {
        &self.sources
    }

    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    pub fn buffer(&self) -> &Arc<BulkWriteBuffer> {
        &self.buffer
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    /// Passes run since startup
    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Resolves once a completed pass has included this request
    pub async fn update(self: &Arc<Self>, request: UpdateRequest) -> PassResult {
        let (done, receiver) = oneshot::channel();

        let start_loop = {
            let mut queues = self.queues();
            let waiter = Waiter {
                hints: request.hints,
                done,
            };
            if request.real_time {
                queues.real_time.push(waiter);
            } else {
                queues.best_effort.push(waiter);
            }
            self.progress.send_modify(|p| p.requested += 1);

            let start = !queues.running;
            queues.running = true;
            start
        };

        if start_loop {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move { coordinator.run_loop().await });
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(Arc::new(IndexingError::Stopped)),
        }
    }

    /// Resolves when every request made so far has been answered
    pub async fn wait_for_quiescence(&self) {
        let mut receiver = self.progress.subscribe();
        let _ = receiver.wait_for(|p| p.completed >= p.requested).await;
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            let (batch, real_time) = {
                let mut queues = self.queues();
                if !queues.real_time.is_empty() {
                    (std::mem::take(&mut queues.real_time), true)
                } else if !queues.best_effort.is_empty() {
                    (std::mem::take(&mut queues.best_effort), false)
                } else {
                    queues.running = false;
                    return;
                }
            };

            let hints = merge_hints(&batch);
            debug!(
                "Running {} pass for {} requests ({})",
                if real_time { "real-time" } else { "best-effort" },
                batch.len(),
                if hints.is_empty() { "full".to_string() } else { format!("{} hints", hints.len()) }
            );

            let result = self.run_pass(&hints).await.map_err(Arc::new);
            if let Err(e) = &result {
                error!("Indexing pass failed: {}", e);
            }

            let answered = batch.len() as u64;
            for waiter in batch {
                let _ = waiter.done.send(result.clone());
            }
            self.progress.send_modify(|p| p.completed += answered);
        }
    }

    async fn run_pass(&self, hints: &[Hint]) -> Result<(), IndexingError> {
        let failed_flushes = self.buffer.failed_flushes();
        let results = join_all(self.sources.sessions().map(|session| self.run_source(session, hints))).await;

        let mut first_error = None;
        let mut indexed = Vec::new();
        for result in results {
            match result {
                Ok(next) => indexed.push(next),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        // Documents land before the meta that claims them
        let flushed = self.buffer.flush().await;
        let lost_writes = self.buffer.failed_flushes() != failed_flushes;
        match flushed {
            Err(e) => {
                first_error.get_or_insert(e.into());
            }
            Ok(_) if lost_writes => {
                first_error.get_or_insert(IndexingError::WritesLost);
            }
            Ok(_) => {
                let pool = self.buffer.pool();
                for (source_id, next) in indexed {
                    if let Err(e) = meta::set_meta(pool, &source_id, &next).await {
                        first_error.get_or_insert(e.into());
                    }
                }
            }
        }
        if lost_writes {
            warn!("Writes failed during the pass, keeping the previous meta of every source");
        }

        let written = self.buffer.take_written_types().await;
        if written.iter().any(|doc_type| is_schema_type(doc_type)) {
            info!("Schema documents changed, invalidating schema cache");
            self.schema_cache.invalidate_all();
        }

        self.passes.fetch_add(1, Ordering::SeqCst);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run one source's updater. Its next meta is returned rather than
    /// stored, since the pass decides whether its documents made it.
    async fn run_source(
        &self,
        session: &DataSourceSession,
        hints: &[Hint],
    ) -> Result<(String, Value), IndexingError> {
        let source_id = session.indexer.source_id();

        let previous = meta::get_meta(self.buffer.pool(), source_id).await?;
        let ops = Operations::new(Arc::clone(&self.buffer), source_id);
        let mut updater = session.indexer.begin_update();

        match updater.update_content(previous, hints, &ops).await {
            Ok(next) => {
                debug!("Data source {} indexed", source_id);
                Ok((source_id.to_string(), next))
            }
            Err(e) => {
                error!("Data source {} failed: {}", source_id, e);
                Err(e)
            }
        }
    }

    /// Stop live subscriptions and flush whatever is still buffered
    pub async fn shutdown(&self) {
        for session in self.sources.sessions() {
            session.indexer.shutdown().await;
        }
        if let Err(e) = self.buffer.flush().await {
            error!("Flush during shutdown failed: {}", e);
        }
        info!("Indexing coordinator stopped");
    }
}

/// Union of the batch's hints, or none at all when any request asked for a
/// full reconciliation
fn merge_hints(batch: &[Waiter]) -> Vec<Hint> {
    if batch.iter().any(|waiter| waiter.hints.is_empty()) {
        return Vec::new();
    }

    let mut seen = HashSet::new();
    batch
        .iter()
        .flat_map(|waiter| waiter.hints.iter())
        .filter(|hint| seen.insert((*hint).clone()))
        .cloned()
        .collect()
}
