//! SQLite-based session store

use crate::core::PipelineSession;
use crate::persistence::{dehydrate, hydrate_with, SessionStore};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

type BlobMap = HashMap<String, Arc<[u8]>>;

/// Single-row session store; image bytes live in a separate blob table
///
/// The store remembers which blobs it last wrote, so a save only touches
/// images that were added, replaced or dropped since then. Until the first
/// save or hydrate the blob table contents are unknown and a save rewrites
/// it in full.
pub struct SqliteSessionStore {
    pool: SqlitePool,
    written: Mutex<Option<BlobMap>>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        let store = Self {
            pool,
            written: Mutex::new(None),
        };
        store.init().await?;

        Ok(store)
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        Self::open(&data_dir.join("forgeline").join("session.db")).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                data BLOB NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn written(&self) -> std::sync::MutexGuard<'_, Option<BlobMap>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Blobs to write and keys to delete so the table matches `blobs`
fn blob_changes(
    written: &BlobMap,
    blobs: &[(String, Arc<[u8]>)],
) -> (Vec<(String, Arc<[u8]>)>, Vec<String>) {
    let upserts = blobs
        .iter()
        .filter(|(key, data)| match written.get(key) {
            Some(prev) => !Arc::ptr_eq(prev, data) && prev[..] != data[..],
            None => true,
        })
        .cloned()
        .collect();
    let stale = written
        .keys()
        .filter(|key| !blobs.iter().any(|(k, _)| k == *key))
        .cloned()
        .collect();
    (upserts, stale)
}

#[async_trait::async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self) -> Result<Option<PipelineSession>> {
        let row = sqlx::query("SELECT payload FROM session WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load session")?;

        match row {
            Some(row) => {
                let payload: String = row.get("payload");
                let session = serde_json::from_str(&payload)
                    .context("Stored session is not valid JSON")?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, session: &PipelineSession) -> Result<()> {
        let mut record = session.clone();
        let blobs = dehydrate(&mut record);
        let payload = serde_json::to_string(&record).context("Failed to serialize session")?;

        let known = self.written().clone();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO session (id, payload, updated_at)
            VALUES (1, ?1, ?2)
            "#,
        )
        .bind(payload)
        .bind(Utc::now().naive_utc())
        .execute(&mut *tx)
        .await
        .context("Failed to save session")?;

        // Blobs are keyed by filename; unreferenced ones are dropped
        let (upserts, stale) = match &known {
            Some(written) => blob_changes(written, &blobs),
            None => {
                sqlx::query("DELETE FROM blobs")
                    .execute(&mut *tx)
                    .await
                    .context("Failed to reset image blobs")?;
                (blobs.clone(), Vec::new())
            }
        };
        for key in &stale {
            sqlx::query("DELETE FROM blobs WHERE key = ?1")
                .bind(key.as_str())
                .execute(&mut *tx)
                .await
                .context("Failed to drop image blob")?;
        }
        for (key, data) in &upserts {
            sqlx::query("INSERT OR REPLACE INTO blobs (key, data) VALUES (?1, ?2)")
                .bind(key.as_str())
                .bind(&data[..])
                .execute(&mut *tx)
                .await
                .context("Failed to save image blob")?;
        }

        tx.commit().await?;
        *self.written() = Some(blobs.into_iter().collect());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM session").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM blobs").execute(&mut *tx).await?;
        tx.commit().await.context("Failed to clear session")?;
        *self.written() = Some(HashMap::new());
        Ok(())
    }

    async fn hydrate(&self, session: &mut PipelineSession) -> Result<()> {
        let rows = sqlx::query("SELECT key, data FROM blobs")
            .fetch_all(&self.pool)
            .await
            .context("Failed to load image blobs")?;

        let blobs: BlobMap = rows
            .iter()
            .map(|row| {
                let data: Vec<u8> = row.get("data");
                (row.get("key"), Arc::from(data))
            })
            .collect();

        hydrate_with(session, |key| blobs.get(key).cloned())?;
        *self.written() = Some(blobs);
        Ok(())
    }

    async fn updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT updated_at FROM session WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read session timestamp")?;

        Ok(row.map(|row| {
            DateTime::from_naive_utc_and_offset(row.get::<NaiveDateTime, _>("updated_at"), Utc)
        }))
    }
}
