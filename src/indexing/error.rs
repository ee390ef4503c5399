use crate::blockchain::abi::AbiError;
use crate::blockchain::client::ChainError;
use crate::config::ConfigError;
use crate::indexing::bulk_writer::BulkWriteError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexingError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    BulkWrite(#[from] BulkWriteError),

    #[error("ABI error: {0}")]
    Abi(#[from] AbiError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid indexer meta for {source_id}: {reason}")]
    InvalidMeta { source_id: String, reason: String },

    #[error("Data source {source_id} failed: {reason}")]
    DataSource { source_id: String, reason: String },

    #[error("Document writes were lost during the pass")]
    WritesLost,

    #[error("Indexing coordinator stopped before the request completed")]
    Stopped,
}
