use std::sync::Arc;

use shared::{domain::MatchId, records::HistoryEntry};
use storage::{DocumentStore, StoreError};
use tracing::warn;

use crate::fields_of;

pub(crate) const HISTORY_COLLECTION: &str = "history";

/// Read-time bound on history queries; the underlying log is unbounded and
/// append-only.
pub const HISTORY_QUERY_LIMIT: u32 = 20;

/// Append-only, time-ordered record of recent operator actions per match.
#[derive(Clone)]
pub struct HistoryLog {
    store: Arc<dyn DocumentStore>,
}

impl HistoryLog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, entry: &HistoryEntry) -> Result<(), StoreError> {
        self.store.append(HISTORY_COLLECTION, fields_of(entry)).await
    }

    /// The most recent actions for one match, newest first, bounded to 20.
    /// Entries that no longer decode are skipped, never fatal.
    pub async fn query(&self, match_id: &MatchId) -> Result<Vec<HistoryEntry>, StoreError> {
        let rows = self
            .store
            .query_recent(HISTORY_COLLECTION, match_id, HISTORY_QUERY_LIMIT)
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for fields in rows {
            match serde_json::from_value::<HistoryEntry>(serde_json::Value::Object(fields)) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(%match_id, %err, "skipping malformed history entry"),
            }
        }
        Ok(entries)
    }
}
