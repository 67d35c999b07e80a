use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ActionValue, Channel, MatchId},
    records::{ControlDocument, HistoryEntry, MatchSummary, MatchTickerRecord, StickerRecord},
};
use storage::{DocumentStore, Fields, StoreError};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, warn};

pub mod alerts;
pub mod error;
pub mod history;
pub mod registry;

pub use alerts::{
    default_allowed_actions, alert_message, AlertAllowList, AlertEvent, AlertQueue,
    AlertSubscriptionEngine, ALERT_QUEUE_CAPACITY,
};
pub use error::ComposerError;
pub use history::{HistoryLog, HISTORY_QUERY_LIMIT};

pub const MATCHES_COLLECTION: &str = "matches";

const ENGINE_EVENT_BUFFER: usize = 256;

/// Snapshot of one channel's control flags, keyed by cue document key.
/// Missing documents are omitted, which is equivalent to inactive.
pub type ChannelSnapshot = HashMap<String, ControlDocument>;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    MatchSelected {
        match_id: MatchId,
    },
    ChannelStateRefreshed {
        channel: Channel,
        docs: ChannelSnapshot,
    },
    HistoryRefreshed {
        entries: Vec<HistoryEntry>,
    },
}

fn control_collection(channel: Channel) -> &'static str {
    channel.as_str()
}

fn sticker_collection(channel: Channel) -> &'static str {
    match channel {
        Channel::Preview => "sticker_preview",
        Channel::Live => "sticker_live",
    }
}

fn ticker_field(channel: Channel) -> &'static str {
    match channel {
        Channel::Preview => "ticker_preview",
        Channel::Live => "ticker_live",
    }
}

// Record types serialize to JSON objects; anything else would be a bug in
// the record definitions, not a runtime condition.
pub(crate) fn fields_of<T: Serialize>(record: &T) -> Fields {
    match serde_json::to_value(record) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => Fields::new(),
    }
}

fn json_of<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

fn decode_document<T: DeserializeOwned>(
    collection: &str,
    key: &str,
    fields: Fields,
) -> Result<T, StoreError> {
    serde_json::from_value(serde_json::Value::Object(fields)).map_err(|source| {
        StoreError::Decode {
            collection: collection.to_string(),
            key: key.to_string(),
            source,
        }
    })
}

struct EngineState {
    selected_match: Option<MatchId>,
    channel_docs: HashMap<Channel, ChannelSnapshot>,
}

/// Control state synchronization engine: owns the toggle fan-out, the
/// per-channel control caches, the history view and the alert subscription
/// for the selected match.
pub struct ComposerEngine {
    store: Arc<dyn DocumentStore>,
    history: HistoryLog,
    alerts: Arc<AlertSubscriptionEngine>,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl ComposerEngine {
    pub fn new(store: Arc<dyn DocumentStore>, allow_list: AlertAllowList) -> Arc<Self> {
        let (events, _) = broadcast::channel(ENGINE_EVENT_BUFFER);
        Arc::new(Self {
            history: HistoryLog::new(Arc::clone(&store)),
            alerts: AlertSubscriptionEngine::new(Arc::clone(&store), allow_list),
            store,
            inner: Mutex::new(EngineState {
                selected_match: None,
                channel_docs: HashMap::new(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn alerts(&self) -> &Arc<AlertSubscriptionEngine> {
        &self.alerts
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub async fn selected_match(&self) -> Option<MatchId> {
        self.inner.lock().await.selected_match.clone()
    }

    /// Selects the active match: re-attaches the alert subscription and
    /// refreshes both channel caches and the history view.
    pub async fn select_match(self: &Arc<Self>, match_id: MatchId) -> Result<(), ComposerError> {
        {
            let mut state = self.inner.lock().await;
            state.selected_match = Some(match_id.clone());
        }
        let _ = self.events.send(EngineEvent::MatchSelected {
            match_id: match_id.clone(),
        });

        self.alerts.attach(match_id).await;
        for channel in Channel::ALL {
            self.refresh_channel(channel).await?;
        }
        self.refresh_history().await?;
        Ok(())
    }

    /// Toggles a cue's control flag for one channel and fans the change out
    /// to the match ticker field, the sticker record and the action history.
    ///
    /// The four writes share no transaction: when the match record turns out
    /// to be missing, the control write has already committed and the other
    /// records stay untouched until the next successful toggle of the same
    /// cue. Concurrent toggles of the same (channel, cue) pair are
    /// last-write-wins.
    pub async fn toggle(
        self: &Arc<Self>,
        action: &ActionValue,
        channel: Channel,
    ) -> Result<bool, ComposerError> {
        let cue = registry::resolve(action).ok_or_else(|| ComposerError::UnknownCue {
            action: action.clone(),
        })?;
        let match_id = self
            .selected_match()
            .await
            .ok_or(ComposerError::NoMatchSelected)?;

        // Control flag first, then ticker, sticker, history: display
        // overlays read the later records against the flag, so the order is
        // load-bearing.
        let collection = control_collection(channel);
        let previous = match self.store.get(collection, cue.doc_key).await? {
            Some(fields) => Some(decode_document::<ControlDocument>(
                collection,
                cue.doc_key,
                fields,
            )?),
            None => None,
        };
        let new_control = !previous.as_ref().map(|doc| doc.control).unwrap_or(false);
        let control_doc = ControlDocument {
            control: new_control,
            last_updated: Utc::now(),
            title: previous.and_then(|doc| doc.title),
        };
        self.store
            .upsert(collection, cue.doc_key, fields_of(&control_doc))
            .await?;

        if self
            .store
            .get(MATCHES_COLLECTION, match_id.as_str())
            .await?
            .is_none()
        {
            error!(
                %match_id,
                %channel,
                %action,
                "match record missing after control write; ticker, sticker and history skipped"
            );
            return Err(ComposerError::MatchNotFound { match_id, channel });
        }

        let ticker_value = new_control.then(|| cue.action.clone());
        let mut patch = Fields::new();
        patch.insert(ticker_field(channel).to_string(), json_of(&ticker_value));
        patch.insert("lastUpdated".to_string(), json_of(&Utc::now()));
        self.store
            .update(MATCHES_COLLECTION, match_id.as_str(), patch)
            .await?;

        let sticker = StickerRecord {
            action: cue.action.clone(),
            active: new_control,
            last_updated: Utc::now(),
        };
        self.store
            .upsert(
                sticker_collection(channel),
                match_id.as_str(),
                fields_of(&sticker),
            )
            .await?;

        // History is best-effort: a dropped entry must not block the
        // operator's next action.
        let entry = HistoryEntry {
            action: ticker_value.unwrap_or_else(|| cue.action.clone()),
            mode: channel,
            timestamp: Utc::now(),
            match_id: match_id.clone(),
        };
        if let Err(err) = self.history.record(&entry).await {
            warn!(%match_id, %err, "failed to append history entry");
        }

        self.spawn_refreshes(channel, match_id);
        Ok(new_control)
    }

    /// The common cue's dedicated flow: when the invoked channel's flag is
    /// inactive, stores the title on BOTH channels' common documents and
    /// activates only the invoked channel; when already active, clears the
    /// flag and keeps the stored title. Returns the new flag value.
    pub async fn set_common_title(
        self: &Arc<Self>,
        channel: Channel,
        title: &str,
    ) -> Result<bool, ComposerError> {
        let collection = control_collection(channel);
        let current = match self.store.get(collection, registry::COMMON_DOC_KEY).await? {
            Some(fields) => Some(decode_document::<ControlDocument>(
                collection,
                registry::COMMON_DOC_KEY,
                fields,
            )?),
            None => None,
        };
        let active = current.as_ref().map(|doc| doc.control).unwrap_or(false);

        if active {
            let doc = ControlDocument {
                control: false,
                last_updated: Utc::now(),
                title: current.and_then(|doc| doc.title),
            };
            self.store
                .upsert(collection, registry::COMMON_DOC_KEY, fields_of(&doc))
                .await?;
        } else {
            let now = Utc::now();
            let doc = ControlDocument {
                control: true,
                last_updated: now,
                title: Some(title.to_string()),
            };
            self.store
                .upsert(collection, registry::COMMON_DOC_KEY, fields_of(&doc))
                .await?;

            // The other channel receives the title but keeps its own flag.
            let other_collection = control_collection(channel.other());
            let other_current = match self
                .store
                .get(other_collection, registry::COMMON_DOC_KEY)
                .await?
            {
                Some(fields) => Some(decode_document::<ControlDocument>(
                    other_collection,
                    registry::COMMON_DOC_KEY,
                    fields,
                )?),
                None => None,
            };
            let other_doc = ControlDocument {
                control: other_current.map(|doc| doc.control).unwrap_or(false),
                last_updated: now,
                title: Some(title.to_string()),
            };
            self.store
                .upsert(other_collection, registry::COMMON_DOC_KEY, fields_of(&other_doc))
                .await?;
        }

        for channel in Channel::ALL {
            if let Err(err) = self.refresh_channel(channel).await {
                warn!(%channel, %err, "post-title channel refresh failed");
            }
        }
        Ok(!active)
    }

    /// Re-reads every registered cue's control document for one channel.
    /// Pure read, idempotent; the returned mapping is a snapshot, not a
    /// live view. Documents that no longer decode are skipped.
    pub async fn refresh_channel(
        &self,
        channel: Channel,
    ) -> Result<ChannelSnapshot, ComposerError> {
        let collection = control_collection(channel);
        let mut docs = ChannelSnapshot::new();
        for cue in registry::cues() {
            let Some(fields) = self.store.get(collection, cue.doc_key).await? else {
                continue;
            };
            match decode_document::<ControlDocument>(collection, cue.doc_key, fields) {
                Ok(doc) => {
                    docs.insert(cue.doc_key.to_string(), doc);
                }
                Err(err) => {
                    warn!(%channel, doc_key = cue.doc_key, %err, "skipping malformed control document");
                }
            }
        }

        {
            let mut state = self.inner.lock().await;
            state.channel_docs.insert(channel, docs.clone());
        }
        let _ = self.events.send(EngineEvent::ChannelStateRefreshed {
            channel,
            docs: docs.clone(),
        });
        Ok(docs)
    }

    /// Last refreshed snapshot for a channel; empty when never refreshed.
    pub async fn channel_state(&self, channel: Channel) -> ChannelSnapshot {
        self.inner
            .lock()
            .await
            .channel_docs
            .get(&channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Re-reads the history view for the selected match and notifies
    /// subscribers. Returns an empty view when no match is selected.
    pub async fn refresh_history(&self) -> Result<Vec<HistoryEntry>, ComposerError> {
        let Some(match_id) = self.selected_match().await else {
            return Ok(Vec::new());
        };
        let entries = self.history.query(&match_id).await?;
        let _ = self.events.send(EngineEvent::HistoryRefreshed {
            entries: entries.clone(),
        });
        Ok(entries)
    }

    /// Current ticker record for the selected match, if it exists.
    pub async fn ticker_record(&self) -> Result<Option<MatchTickerRecord>, ComposerError> {
        let match_id = self
            .selected_match()
            .await
            .ok_or(ComposerError::NoMatchSelected)?;
        match self.store.get(MATCHES_COLLECTION, match_id.as_str()).await? {
            Some(fields) => Ok(Some(decode_document(
                MATCHES_COLLECTION,
                match_id.as_str(),
                fields,
            )?)),
            None => Ok(None),
        }
    }

    /// Match catalog listing, pure read. Malformed entries are skipped.
    pub async fn list_matches(&self) -> Result<Vec<MatchSummary>, ComposerError> {
        let rows = self.store.list(MATCHES_COLLECTION).await?;
        let mut matches = Vec::with_capacity(rows.len());
        for (key, fields) in rows {
            match serde_json::from_value::<MatchSummary>(serde_json::Value::Object(fields)) {
                Ok(mut summary) => {
                    summary.id = MatchId(key);
                    matches.push(summary);
                }
                Err(err) => warn!(key = %key, %err, "skipping malformed match record"),
            }
        }
        Ok(matches)
    }

    // The post-toggle refreshes run off the caller's critical path; their
    // results arrive as engine events once each completes.
    fn spawn_refreshes(self: &Arc<Self>, channel: Channel, match_id: MatchId) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.refresh_channel(channel).await {
                warn!(%channel, %err, "post-toggle channel refresh failed");
            }
            if let Err(err) = engine.refresh_history().await {
                warn!(%match_id, %err, "post-toggle history refresh failed");
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
