use akidb_core::{CoreError, CoreResult};
use async_trait::async_trait;
use sqlx::{query, Row, SqlitePool};

use crate::kv::KvBackend;
use crate::util::{create_sqlite_pool, run_migrations};

/// SQLite-backed ordered key-value store.
pub struct SqliteKvBackend {
    pool: SqlitePool,
}

impl SqliteKvBackend {
    /// Creates a backend over a pool whose migrations already ran.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if missing) the database at `database_url` and
    /// applies the embedded migrations.
    pub async fn connect(database_url: &str) -> CoreResult<Self> {
        let pool = create_sqlite_pool(database_url)
            .await
            .map_err(map_sqlx_error)?;
        run_migrations(&pool)
            .await
            .map_err(|err| CoreError::MetaUnavailable(format!("migration failed: {err}")))?;
        tracing::info!(url = %database_url, "Opened SQLite metadata store");
        Ok(Self::new(pool))
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl KvBackend for SqliteKvBackend {
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        let row = query("SELECT value FROM kv WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|row| row.try_get::<Vec<u8>, _>("value"))
            .transpose()
            .map_err(map_sqlx_error)
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> CoreResult<()> {
        query(
            r#"
            INSERT INTO kv (key, value, updated_at)
            VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT(key) DO UPDATE
               SET value = excluded.value,
                   updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(map_sqlx_error)
    }

    async fn delete(&self, key: &str) -> CoreResult<()> {
        query("DELETE FROM kv WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }

    async fn scan_prefix(&self, prefix: &str) -> CoreResult<Vec<(String, Vec<u8>)>> {
        let rows = query(
            r#"
            SELECT key, value
              FROM kv
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                let key: String = row.try_get("key")?;
                let value: Vec<u8> = row.try_get("value")?;
                Ok((key, value))
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(map_sqlx_error)
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> CoreResult<bool> {
        // Single statements keep the check and the write atomic.
        let result = match expected {
            None => {
                query(
                    r#"
                    INSERT INTO kv (key, value) VALUES (?1, ?2)
                    ON CONFLICT(key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(value)
                .execute(&self.pool)
                .await
            }
            Some(expected) => {
                query(
                    r#"
                    UPDATE kv
                       SET value = ?2,
                           updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                     WHERE key = ?1 AND value = ?3
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(expected.to_vec())
                .execute(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }
}

fn map_sqlx_error(err: sqlx::Error) -> CoreError {
    match err {
        sqlx::Error::Database(db_err) => CoreError::MetaUnavailable(db_err.message().to_string()),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            CoreError::DeserializationError(err.to_string())
        }
        other => CoreError::MetaUnavailable(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> SqliteKvBackend {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteKvBackend::new(pool)
    }

    #[tokio::test]
    async fn test_put_get_overwrite() {
        let kv = setup().await;
        assert_eq!(kv.get("k").await.unwrap(), None);

        kv.put("k", b"v1".to_vec()).await.unwrap();
        kv.put("k", b"v2".to_vec()).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v2".to_vec()));

        kv.delete("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_scan_prefix_does_not_leak_neighbours() {
        let kv = setup().await;
        kv.put("meta/segment/2", b"b".to_vec()).await.unwrap();
        kv.put("meta/segment/1", b"a".to_vec()).await.unwrap();
        kv.put("meta/segmentx", b"x".to_vec()).await.unwrap();
        kv.put("meta/collection/1", b"c".to_vec()).await.unwrap();

        let entries = kv.scan_prefix("meta/segment/").await.unwrap();
        let keys: Vec<_> = entries.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["meta/segment/1", "meta/segment/2"]);
    }

    #[tokio::test]
    async fn test_compare_and_put() {
        let kv = setup().await;
        assert!(kv.compare_and_put("id", None, b"10".to_vec()).await.unwrap());
        assert!(!kv.compare_and_put("id", None, b"20".to_vec()).await.unwrap());
        assert!(!kv
            .compare_and_put("id", Some(b"11"), b"20".to_vec())
            .await
            .unwrap());
        assert!(kv
            .compare_and_put("id", Some(b"10"), b"20".to_vec())
            .await
            .unwrap());
        assert_eq!(kv.get("id").await.unwrap(), Some(b"20".to_vec()));
    }
}
