pub mod connection;
pub mod documents;
pub mod meta;

pub const INIT_SCHEMA: &str = r#"
-- Documents written by indexers, keyed by JSON:API type and id
CREATE TABLE IF NOT EXISTS documents (
    doc_type TEXT NOT NULL CHECK (length(doc_type) > 0),
    id TEXT NOT NULL CHECK (length(id) > 0),
    source_id TEXT,
    generation TEXT,
    block_height INTEGER,
    body TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (doc_type, id)
);

-- Per data source resume state
CREATE TABLE IF NOT EXISTS indexer_meta (
    source_id TEXT PRIMARY KEY,
    meta TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_documents_source_generation ON documents(source_id, generation);
CREATE INDEX IF NOT EXISTS idx_documents_type ON documents(doc_type);
"#;
