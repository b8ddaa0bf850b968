//! SQLite-backed chunk store.

use std::path::Path;

use async_trait::async_trait;
use ccwallet_spv_verify::{Hash256, RawHeader, CHUNK_SIZE};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite, SqliteConnection};
use tokio::fs;
use tracing::debug;

use crate::store::{ChunkStore, ChunkStoreBatch, StoreError, StoreOp};

/// SQLite busy timeout in milliseconds
const SQLITE_BUSY_TIMEOUT: &str = "5000";

const LAST_HASH_KEY: &str = "last_hash";

/// Chunk store persisted in a single SQLite file.
/// - WAL journal
/// - Single connection, so every batch has exclusive access
/// - Each batch is one transaction
#[derive(Debug, Clone)]
pub struct SqliteChunkStore {
    pool: Pool<Sqlite>,
}

impl SqliteChunkStore {
    /// Open (creating if missing) the store at `path`
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::SQLite(sqlx::Error::Io(e)))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Create the tables if missing
    async fn init(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chunks (
                idx INTEGER PRIMARY KEY,
                hash TEXT NOT NULL
            );"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS headers (
                idx INTEGER PRIMARY KEY,
                header BLOB NOT NULL
            );"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count(&self, table: &str) -> Result<u32, StoreError> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as u32)
    }
}

fn decode_header(data: Vec<u8>) -> Result<RawHeader, StoreError> {
    RawHeader::try_from(data.as_slice())
        .map_err(|_| StoreError::Corrupted(format!("header of {} bytes", data.len())))
}

fn decode_hash(value: &str) -> Result<Hash256, StoreError> {
    Hash256::from_hex(value).map_err(|e| StoreError::Corrupted(e.to_string()))
}

async fn apply_op(conn: &mut SqliteConnection, op: &StoreOp) -> Result<(), sqlx::Error> {
    match op {
        StoreOp::PushHeader(header) => {
            sqlx::query(
                "INSERT INTO headers (idx, header) VALUES ((SELECT COUNT(*) FROM headers), ?)",
            )
            .bind(header.as_slice())
            .execute(conn)
            .await?;
        }
        StoreOp::PushChunkHash(hash) => {
            sqlx::query("INSERT INTO chunks (idx, hash) VALUES ((SELECT COUNT(*) FROM chunks), ?)")
                .bind(hash.to_string())
                .execute(conn)
                .await?;
        }
        StoreOp::TruncateHeaders(len) => {
            sqlx::query("DELETE FROM headers WHERE idx >= ?")
                .bind(*len)
                .execute(conn)
                .await?;
        }
        StoreOp::TruncateChunks(len) => {
            sqlx::query("DELETE FROM chunks WHERE idx >= ?")
                .bind(*len)
                .execute(conn)
                .await?;
        }
        StoreOp::SetLastHash(hash) => {
            sqlx::query("INSERT OR REPLACE INTO store (key, value) VALUES (?, ?)")
                .bind(LAST_HASH_KEY)
                .bind(hash.to_string())
                .execute(conn)
                .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn chunks_count(&self) -> Result<u32, StoreError> {
        self.count("chunks").await
    }

    async fn headers_count(&self) -> Result<u32, StoreError> {
        self.count("headers").await
    }

    async fn header(&self, index: u32) -> Result<Option<RawHeader>, StoreError> {
        let row = sqlx::query("SELECT header FROM headers WHERE idx = ?")
            .bind(index)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_header(row.get("header"))).transpose()
    }

    async fn pending_header(&self, height: u32) -> Result<Option<RawHeader>, StoreError> {
        // One statement sees one snapshot of both tables
        let row = sqlx::query(
            r#"SELECT header FROM headers
               WHERE idx = ?1 % ?2 AND ?1 / ?2 = (SELECT COUNT(*) FROM chunks)"#,
        )
        .bind(height)
        .bind(CHUNK_SIZE)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| decode_header(row.get("header"))).transpose()
    }

    async fn headers(&self) -> Result<Vec<RawHeader>, StoreError> {
        let rows = sqlx::query("SELECT header FROM headers ORDER BY idx")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| decode_header(row.get("header")))
            .collect()
    }

    async fn chunk_hash(&self, index: u32) -> Result<Option<Hash256>, StoreError> {
        let row = sqlx::query("SELECT hash FROM chunks WHERE idx = ?")
            .bind(index)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_hash(row.get("hash"))).transpose()
    }

    async fn last_hash(&self) -> Result<Option<Hash256>, StoreError> {
        let row = sqlx::query("SELECT value FROM store WHERE key = ?")
            .bind(LAST_HASH_KEY)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_hash(row.get("value"))).transpose()
    }

    async fn apply(&self, batch: ChunkStoreBatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for op in batch.ops() {
            apply_op(&mut tx, op).await?;
        }

        let row = sqlx::query("SELECT COUNT(*) AS n FROM headers")
            .fetch_one(&mut *tx)
            .await?;
        let pending: i64 = row.try_get("n")?;
        if pending > i64::from(CHUNK_SIZE) {
            // Dropping the transaction rolls it back
            return Err(StoreError::Inconsistent(format!(
                "open period would hold {pending} headers"
            )));
        }

        tx.commit().await?;
        debug!("Applied batch of {} store operations", batch.ops().len());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM headers").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM store").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(byte: u8) -> Hash256 {
        Hash256::from_display_bytes([byte; 32])
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("chain.sqlite");

        {
            let store = SqliteChunkStore::open(&path).await.unwrap();
            let mut batch = ChunkStoreBatch::new();
            batch
                .push_chunk_hash(hash(1))
                .push_chunk_hash(hash(2))
                .push_header([7u8; 80])
                .push_header([8u8; 80])
                .set_last_hash(hash(8));
            store.apply(batch).await.unwrap();
        }

        let store = SqliteChunkStore::open(&path).await.unwrap();
        assert_eq!(store.chunks_count().await.unwrap(), 2);
        assert_eq!(store.headers_count().await.unwrap(), 2);
        assert_eq!(store.chunk_hash(1).await.unwrap(), Some(hash(2)));
        assert_eq!(store.chunk_hash(2).await.unwrap(), None);
        assert_eq!(store.header(1).await.unwrap(), Some([8u8; 80]));
        assert_eq!(store.headers().await.unwrap(), vec![[7u8; 80], [8u8; 80]]);
        assert_eq!(store.last_hash().await.unwrap(), Some(hash(8)));
    }

    #[tokio::test]
    async fn test_truncate_then_push_reuses_indices() {
        let dir = TempDir::new().unwrap();
        let store = SqliteChunkStore::open(dir.path().join("chain.sqlite"))
            .await
            .unwrap();

        let mut batch = ChunkStoreBatch::new();
        batch
            .push_chunk_hash(hash(1))
            .push_chunk_hash(hash(2))
            .push_header([1u8; 80])
            .push_header([2u8; 80]);
        store.apply(batch).await.unwrap();

        let mut batch = ChunkStoreBatch::new();
        batch
            .truncate_chunks(1)
            .push_chunk_hash(hash(3))
            .truncate_headers(0)
            .push_header([3u8; 80])
            .set_last_hash(hash(3));
        store.apply(batch).await.unwrap();

        assert_eq!(store.chunks_count().await.unwrap(), 2);
        assert_eq!(store.chunk_hash(1).await.unwrap(), Some(hash(3)));
        assert_eq!(store.headers().await.unwrap(), vec![[3u8; 80]]);
    }

    #[tokio::test]
    async fn test_pending_header_by_height() {
        let dir = TempDir::new().unwrap();
        let store = SqliteChunkStore::open(dir.path().join("chain.sqlite"))
            .await
            .unwrap();

        let mut batch = ChunkStoreBatch::new();
        batch
            .push_chunk_hash(hash(1))
            .push_header([1u8; 80])
            .push_header([2u8; 80]);
        store.apply(batch).await.unwrap();

        assert_eq!(store.pending_header(CHUNK_SIZE + 1).await.unwrap(), Some([2u8; 80]));
        assert_eq!(store.pending_header(1).await.unwrap(), None);
        assert_eq!(store.pending_header(CHUNK_SIZE * 2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_open_period_is_rolled_back() {
        let dir = TempDir::new().unwrap();
        let store = SqliteChunkStore::open(dir.path().join("chain.sqlite"))
            .await
            .unwrap();

        let mut batch = ChunkStoreBatch::new();
        batch.set_last_hash(hash(5));
        for _ in 0..=CHUNK_SIZE {
            batch.push_header([0u8; 80]);
        }
        assert!(matches!(
            store.apply(batch).await,
            Err(StoreError::Inconsistent(_))
        ));
        assert_eq!(store.headers_count().await.unwrap(), 0);
        assert_eq!(store.last_hash().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();
        let store = SqliteChunkStore::open(dir.path().join("chain.sqlite"))
            .await
            .unwrap();
        let mut batch = ChunkStoreBatch::new();
        batch.push_chunk_hash(hash(1)).set_last_hash(hash(1));
        store.apply(batch).await.unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.chunks_count().await.unwrap(), 0);
        assert_eq!(store.last_hash().await.unwrap(), None);
    }
}
