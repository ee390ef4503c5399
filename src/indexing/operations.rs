use crate::db::documents::{self, DocumentQuery};
use crate::indexing::bulk_writer::BulkWriteBuffer;
use crate::indexing::error::IndexingError;
use crate::models::{Document, DocumentRef};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

/// Write handle given to an updater for one pass.
///
/// Everything saved is tagged with the handle's source tag, plus the current
/// generation nonce while a replace-all is open. Finishing a replace-all
/// deletes whatever under the same tag was not saved during it.
pub struct Operations {
    buffer: Arc<BulkWriteBuffer>,
    source_tag: String,
    generation: Mutex<Option<String>>,
}

impl Operations {
    pub fn new(buffer: Arc<BulkWriteBuffer>, source_id: &str) -> Self {
        Self {
            buffer,
            source_tag: source_id.to_string(),
            generation: Mutex::new(None),
        }
    }

    /// Handle whose writes are tagged separately, so a replace-all on it
    /// never touches documents written through the parent.
    pub fn scoped(&self, scope: &str) -> Self {
        Self::new(Arc::clone(&self.buffer), &format!("{}/{}", self.source_tag, scope))
    }

    pub fn source_tag(&self) -> &str {
        &self.source_tag
    }

    fn current_generation(&self) -> Option<String> {
        match self.generation.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_generation(&self, generation: Option<String>) {
        match self.generation.lock() {
            Ok(mut guard) => *guard = generation,
            Err(poisoned) => *poisoned.into_inner() = generation,
        }
    }

    pub async fn save(&self, doc: Document) -> Result<(), IndexingError> {
        self.buffer
            .save(doc, Some(self.source_tag.clone()), self.current_generation())
            .await?;
        Ok(())
    }

    pub async fn delete(&self, doc_type: &str, id: &str) -> Result<(), IndexingError> {
        self.buffer.delete(DocumentRef::new(doc_type, id)).await?;
        Ok(())
    }

    /// Reads see writes made earlier in the pass, flushed or not
    pub async fn read(&self, doc_type: &str, id: &str) -> Result<Option<Document>, IndexingError> {
        Ok(self.buffer.read(doc_type, id).await?)
    }

    /// Every stored document of `doc_type`, after flushing buffered writes
    pub async fn query_all(&self, doc_type: &str) -> Result<Vec<Document>, IndexingError> {
        self.buffer.flush().await?;
        Ok(documents::query_all_documents(self.buffer.pool(), &DocumentQuery::of_type(doc_type)).await?)
    }

    pub async fn flush(&self) -> Result<(), IndexingError> {
        self.buffer.flush().await?;
        Ok(())
    }

    /// Open a replace-all generation and return its nonce
    pub fn begin_replace_all(&self) -> String {
        let nonce = Uuid::new_v4().to_string();
        debug!("{} begins replace-all generation {}", self.source_tag, nonce);
        self.set_generation(Some(nonce.clone()));
        nonce
    }

    pub fn in_replace_all(&self) -> bool {
        self.current_generation().is_some()
    }

    /// Close the open generation, deleting documents it did not re-save.
    /// Returns the number of stale documents removed.
    pub async fn finish_replace_all(&self) -> Result<u64, IndexingError> {
        let Some(nonce) = self.current_generation() else {
            return Ok(0);
        };

        self.buffer.flush().await?;
        let removed =
            documents::delete_stale_documents(self.buffer.pool(), &self.source_tag, &nonce).await?;
        self.set_generation(None);

        info!(
            "{} finished replace-all generation {} ({} stale documents removed)",
            self.source_tag, nonce, removed
        );
        Ok(removed)
    }
}
