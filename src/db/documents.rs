// Document store: bulk upsert/delete, lookups, paginated queries and
// generation-based cleanup after replace-all passes.

use crate::models::{Document, DocumentRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite, SqliteConnection};

/// Filter for [`query_documents`]
#[derive(Debug, Clone, Default)]
pub struct DocumentQuery {
    pub doc_type: Option<String>,
    pub source_id: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl DocumentQuery {
    pub fn of_type(doc_type: &str) -> Self {
        Self {
            doc_type: Some(doc_type.to_string()),
            limit: 1000,
            ..Self::default()
        }
    }

    pub fn from_source(source_id: &str) -> Self {
        Self {
            source_id: Some(source_id.to_string()),
            limit: 1000,
            ..Self::default()
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn decode_body(row: &SqliteRow) -> Result<Document, sqlx::Error> {
    let body: String = row.try_get("body")?;
    serde_json::from_str(&body).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

pub async fn upsert_document(
    conn: &mut SqliteConnection,
    doc: &Document,
    source_id: Option<&str>,
    generation: Option<&str>,
) -> Result<(), sqlx::Error> {
    let body = serde_json::to_string(doc).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let block_height = doc.meta.block_height.map(|h| h as i64);

    sqlx::query(
        r#"
        INSERT INTO documents (doc_type, id, source_id, generation, block_height, body, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(doc_type, id) DO UPDATE SET
            source_id = excluded.source_id,
            generation = excluded.generation,
            block_height = excluded.block_height,
            body = excluded.body,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&doc.doc_type)
    .bind(&doc.id)
    .bind(source_id)
    .bind(generation)
    .bind(block_height)
    .bind(body)
    .bind(now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn delete_document(
    conn: &mut SqliteConnection,
    doc_ref: &DocumentRef,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM documents WHERE doc_type = ? AND id = ?")
        .bind(&doc_ref.doc_type)
        .bind(&doc_ref.id)
        .execute(&mut *conn)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Upsert a batch in one transaction
pub async fn upsert_documents(
    pool: &Pool<Sqlite>,
    docs: &[Document],
    source_id: Option<&str>,
    generation: Option<&str>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for doc in docs {
        upsert_document(&mut tx, doc, source_id, generation).await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn delete_documents(pool: &Pool<Sqlite>, refs: &[DocumentRef]) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let mut deleted = 0;
    for doc_ref in refs {
        if delete_document(&mut tx, doc_ref).await? {
            deleted += 1;
        }
    }
    tx.commit().await?;
    Ok(deleted)
}

pub async fn get_document(
    pool: &Pool<Sqlite>,
    doc_type: &str,
    id: &str,
) -> Result<Option<Document>, sqlx::Error> {
    let row = sqlx::query("SELECT body FROM documents WHERE doc_type = ? AND id = ?")
        .bind(doc_type)
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(decode_body).transpose()
}

/// One page of documents, ordered by (type, id)
pub async fn query_documents(
    pool: &Pool<Sqlite>,
    query: &DocumentQuery,
) -> Result<Vec<Document>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT body FROM documents
           WHERE (?1 IS NULL OR doc_type = ?1)
           AND (?2 IS NULL OR source_id = ?2)
           ORDER BY doc_type ASC, id ASC
           LIMIT ?3 OFFSET ?4"#,
    )
    .bind(query.doc_type.as_deref())
    .bind(query.source_id.as_deref())
    .bind(query.limit)
    .bind(query.offset)
    .fetch_all(pool)
    .await?;

    rows.iter().map(decode_body).collect()
}

/// Every matching document, paging until a short page comes back
pub async fn query_all_documents(
    pool: &Pool<Sqlite>,
    query: &DocumentQuery,
) -> Result<Vec<Document>, sqlx::Error> {
    let page_size = query.limit.max(1);
    let mut page_query = DocumentQuery {
        limit: page_size,
        offset: 0,
        ..query.clone()
    };
    let mut all = Vec::new();

    loop {
        let page = query_documents(pool, &page_query).await?;
        let exhausted = (page.len() as i64) < page_size;
        all.extend(page);
        if exhausted {
            break;
        }
        page_query.offset += page_size;
    }

    Ok(all)
}

pub async fn count_documents(pool: &Pool<Sqlite>, doc_type: &str) -> Result<i64, sqlx::Error> {
    let count = sqlx::query("SELECT COUNT(*) FROM documents WHERE doc_type = ?")
        .bind(doc_type)
        .fetch_one(pool)
        .await?
        .try_get::<i64, _>(0)?;

    Ok(count)
}

/// Drop every document of `source_id` not tagged with `keep_generation`
pub async fn delete_stale_documents(
    pool: &Pool<Sqlite>,
    source_id: &str,
    keep_generation: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM documents WHERE source_id = ? AND (generation IS NULL OR generation != ?)",
    )
    .bind(source_id)
    .bind(keep_generation)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
