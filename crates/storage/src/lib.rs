use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use shared::domain::MatchId;

/// A document body as it crosses the adapter boundary: a flat JSON field map.
pub type Fields = serde_json::Map<String, serde_json::Value>;

const SUBSCRIPTION_BUFFER: usize = 64;

/// Change event pushed to subscribers of a single document. Carries the full
/// post-write field map.
#[derive(Debug, Clone)]
pub enum DocumentChange {
    Updated { fields: Fields },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {collection}/{key} not found")]
    NotFound { collection: String, key: String },
    #[error("read of {collection}/{key} failed: {source}")]
    Read {
        collection: String,
        key: String,
        source: anyhow::Error,
    },
    #[error("write of {collection}/{key} failed: {source}")]
    Write {
        collection: String,
        key: String,
        source: anyhow::Error,
    },
    #[error("append to {collection} failed: {source}")]
    Append {
        collection: String,
        source: anyhow::Error,
    },
    #[error("query of {collection} failed: {source}")]
    Query {
        collection: String,
        source: anyhow::Error,
    },
    #[error("invalid document body in {collection}/{key}: {source}")]
    Decode {
        collection: String,
        key: String,
        source: serde_json::Error,
    },
}

/// The document operations the composer core requires of its store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Fields>, StoreError>;

    /// Creates or overwrites the whole document. Merges are not assumed;
    /// callers supply every field they intend to persist.
    async fn upsert(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError>;

    /// Merges the named fields into an existing document; fails with
    /// `NotFound` when the key is absent. A `null` value removes the field.
    async fn update(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError>;

    /// Appends one entry to an ordered log collection. The entry's `matchId`
    /// field, when present, is indexed for `query_recent`.
    async fn append(&self, collection: &str, fields: Fields) -> Result<(), StoreError>;

    /// The most recent `limit` log entries for one match, newest first.
    async fn query_recent(
        &self,
        collection: &str,
        match_id: &MatchId,
        limit: u32,
    ) -> Result<Vec<Fields>, StoreError>;

    /// Every document in a collection, as (key, fields) pairs. Pure read.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Fields)>, StoreError>;

    /// Push-based change feed for a single document. Cancelling a
    /// subscription is dropping the receiver; a `Closed` recv error is the
    /// terminal signal that the store went away.
    async fn subscribe(&self, collection: &str, key: &str) -> broadcast::Receiver<DocumentChange>;
}

type WatcherMap = HashMap<(String, String), broadcast::Sender<DocumentChange>>;

/// SQLite-backed document store. Documents are JSON bodies keyed by
/// (collection, key); the action log is a separate append-only table.
/// Change notifications are delivered in-process only: a write performed by
/// another process against the same database file will not be observed.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    watchers: Arc<RwLock<WatcherMap>>,
}

impl Storage {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;

        let storage = Self {
            pool,
            watchers: Arc::new(RwLock::new(HashMap::new())),
        };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                doc_key    TEXT NOT NULL,
                body       TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (collection, doc_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure documents table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS action_log (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                collection  TEXT NOT NULL,
                match_id    TEXT NOT NULL,
                body        TEXT NOT NULL,
                recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure action_log table exists")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_action_log_recency
             ON action_log (collection, match_id, id)",
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure action_log index exists")?;

        Ok(())
    }

    async fn notify(&self, collection: &str, key: &str, fields: Fields) {
        let watchers = self.watchers.read().await;
        if let Some(sender) = watchers.get(&(collection.to_string(), key.to_string())) {
            // Send fails only when no receiver is currently attached.
            let _ = sender.send(DocumentChange::Updated { fields });
        }
    }
}

#[async_trait]
impl DocumentStore for Storage {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Fields>, StoreError> {
        let row = sqlx::query("SELECT body FROM documents WHERE collection = ? AND doc_key = ?")
            .bind(collection)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::Read {
                collection: collection.to_string(),
                key: key.to_string(),
                source: err.into(),
            })?;

        let Some(row) = row else {
            return Ok(None);
        };

        let body: String = row.get(0);
        let fields = serde_json::from_str(&body).map_err(|err| StoreError::Decode {
            collection: collection.to_string(),
            key: key.to_string(),
            source: err,
        })?;
        Ok(Some(fields))
    }

    async fn upsert(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError> {
        let body = serde_json::Value::Object(fields.clone()).to_string();
        sqlx::query(
            "INSERT INTO documents (collection, doc_key, body, updated_at)
             VALUES (?, ?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(collection, doc_key) DO UPDATE SET
                body = excluded.body,
                updated_at = CURRENT_TIMESTAMP",
        )
        .bind(collection)
        .bind(key)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::Write {
            collection: collection.to_string(),
            key: key.to_string(),
            source: err.into(),
        })?;

        self.notify(collection, key, fields).await;
        Ok(())
    }

    async fn update(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError> {
        let patch = serde_json::Value::Object(fields).to_string();
        let row = sqlx::query(
            "UPDATE documents
             SET body = json_patch(body, ?), updated_at = CURRENT_TIMESTAMP
             WHERE collection = ? AND doc_key = ?
             RETURNING body",
        )
        .bind(&patch)
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| StoreError::Write {
            collection: collection.to_string(),
            key: key.to_string(),
            source: err.into(),
        })?;

        let Some(row) = row else {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        };

        let merged: String = row.get(0);
        let fields = serde_json::from_str(&merged).map_err(|err| StoreError::Decode {
            collection: collection.to_string(),
            key: key.to_string(),
            source: err,
        })?;

        self.notify(collection, key, fields).await;
        Ok(())
    }

    async fn append(&self, collection: &str, fields: Fields) -> Result<(), StoreError> {
        let match_id = fields
            .get("matchId")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        let body = serde_json::Value::Object(fields).to_string();

        sqlx::query("INSERT INTO action_log (collection, match_id, body) VALUES (?, ?, ?)")
            .bind(collection)
            .bind(&match_id)
            .bind(&body)
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::Append {
                collection: collection.to_string(),
                source: err.into(),
            })?;
        Ok(())
    }

    async fn query_recent(
        &self,
        collection: &str,
        match_id: &MatchId,
        limit: u32,
    ) -> Result<Vec<Fields>, StoreError> {
        let rows = sqlx::query(
            "SELECT body FROM action_log
             WHERE collection = ? AND match_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )
        .bind(collection)
        .bind(match_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Query {
            collection: collection.to_string(),
            source: err.into(),
        })?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get(0);
            let fields: Fields =
                serde_json::from_str(&body).map_err(|err| StoreError::Query {
                    collection: collection.to_string(),
                    source: err.into(),
                })?;
            entries.push(fields);
        }
        Ok(entries)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Fields)>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc_key, body FROM documents WHERE collection = ? ORDER BY doc_key ASC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::Query {
            collection: collection.to_string(),
            source: err.into(),
        })?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get(0);
            let body: String = row.get(1);
            let fields: Fields =
                serde_json::from_str(&body).map_err(|err| StoreError::Query {
                    collection: collection.to_string(),
                    source: err.into(),
                })?;
            documents.push((key, fields));
        }
        Ok(documents)
    }

    async fn subscribe(&self, collection: &str, key: &str) -> broadcast::Receiver<DocumentChange> {
        let mut watchers = self.watchers.write().await;
        watchers
            .entry((collection.to_string(), key.to_string()))
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .subscribe()
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
