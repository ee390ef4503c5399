use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};

/// Resume state previously written by the indexer of `source_id`
pub async fn get_meta(pool: &Pool<Sqlite>, source_id: &str) -> Result<Option<Value>, sqlx::Error> {
    let row = sqlx::query("SELECT meta FROM indexer_meta WHERE source_id = ?")
        .bind(source_id)
        .fetch_optional(pool)
        .await?;

    match row {
        Some(row) => {
            let meta: String = row.try_get("meta")?;
            let value = serde_json::from_str(&meta).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub async fn set_meta(pool: &Pool<Sqlite>, source_id: &str, meta: &Value) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO indexer_meta (source_id, meta, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(source_id) DO UPDATE SET meta = excluded.meta, updated_at = excluded.updated_at",
    )
    .bind(source_id)
    .bind(meta.to_string())
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
