use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use shared::{
    domain::{ActionValue, MatchId},
    records::Alert,
};
use storage::{DocumentChange, DocumentStore};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{registry, MATCHES_COLLECTION};

/// Capacity of the operator alert queue; inserting past it evicts the
/// oldest entries.
pub const ALERT_QUEUE_CAPACITY: usize = 5;

const ALERT_EVENT_BUFFER: usize = 256;

/// The fixed set of externally sourced action identifiers eligible to
/// trigger operator alerts. Process-wide, loaded once, immutable thereafter.
#[derive(Debug, Clone)]
pub struct AlertAllowList {
    actions: HashSet<ActionValue>,
}

impl AlertAllowList {
    pub fn new(actions: impl IntoIterator<Item = ActionValue>) -> Self {
        Self {
            actions: actions.into_iter().collect(),
        }
    }

    pub fn contains(&self, action: &ActionValue) -> bool {
        self.actions.contains(action)
    }

    /// An accepted action is non-empty and allow-listed.
    pub fn accepts(&self, action: &ActionValue) -> bool {
        !action.is_empty() && self.contains(action)
    }
}

impl Default for AlertAllowList {
    fn default() -> Self {
        Self::new(default_allowed_actions())
    }
}

/// The upstream feed's action vocabulary eligible for alerts.
pub fn default_allowed_actions() -> Vec<ActionValue> {
    vec![
        ActionValue::Runs(4),
        ActionValue::Runs(6),
        ActionValue::event("WINNER"),
        ActionValue::event("WICKET"),
        ActionValue::event("RETIREMENT"),
        ActionValue::event("NEXT_PLAYER"),
        ActionValue::event("HALF_TIME"),
        ActionValue::event("BATTING_INTRO"),
        ActionValue::event("SCORE_TABLE"),
        ActionValue::event("INNING_TABLE"),
        ActionValue::event("TOSS"),
        ActionValue::event("PLAYER_SUMMARY"),
    ]
}

#[derive(Debug, Clone)]
pub enum AlertEvent {
    /// An allow-listed `last_action` was observed on the attached match.
    /// Repeats of the same value are delivered again; deduplication is a
    /// consumer concern.
    Action {
        match_id: MatchId,
        action: ActionValue,
    },
    /// The underlying change stream ended. The engine is detached and does
    /// not reconnect on its own.
    SubscriptionClosed { match_id: MatchId },
}

struct ActiveSubscription {
    match_id: MatchId,
    listener: JoinHandle<()>,
}

/// Watches one match record for externally triggered actions and forwards
/// the allow-listed ones to subscribers. At most one live subscription at
/// any time; attaching again cancels the previous listener first.
pub struct AlertSubscriptionEngine {
    store: Arc<dyn DocumentStore>,
    allow_list: AlertAllowList,
    events: broadcast::Sender<AlertEvent>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl AlertSubscriptionEngine {
    pub fn new(store: Arc<dyn DocumentStore>, allow_list: AlertAllowList) -> Arc<Self> {
        let (events, _) = broadcast::channel(ALERT_EVENT_BUFFER);
        Arc::new(Self {
            store,
            allow_list,
            events,
            active: Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    pub async fn attached_match(&self) -> Option<MatchId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|active| active.match_id.clone())
    }

    pub async fn attach(self: &Arc<Self>, match_id: MatchId) {
        self.detach().await;

        let mut changes = self
            .store
            .subscribe(MATCHES_COLLECTION, match_id.as_str())
            .await;

        let engine = Arc::clone(self);
        let listener_match = match_id.clone();
        let listener = tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(DocumentChange::Updated { fields }) => {
                        engine.handle_snapshot(&listener_match, &fields);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(match_id = %listener_match, skipped, "alert stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        engine.mark_detached(&listener_match).await;
                        let _ = engine.events.send(AlertEvent::SubscriptionClosed {
                            match_id: listener_match.clone(),
                        });
                        break;
                    }
                }
            }
        });

        let mut active = self.active.lock().await;
        *active = Some(ActiveSubscription {
            match_id: match_id.clone(),
            listener,
        });
        info!(%match_id, "alert subscription attached");
    }

    /// Cancels the active listener, if any. Safe to call when detached.
    pub async fn detach(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            previous.listener.abort();
            info!(match_id = %previous.match_id, "alert subscription detached");
        }
    }

    async fn mark_detached(&self, match_id: &MatchId) {
        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .is_some_and(|current| &current.match_id == match_id)
        {
            active.take();
        }
    }

    fn handle_snapshot(&self, match_id: &MatchId, fields: &storage::Fields) {
        let Some(value) = fields.get("last_action") else {
            return;
        };
        let action: ActionValue = match serde_json::from_value(value.clone()) {
            Ok(action) => action,
            Err(err) => {
                warn!(%match_id, %err, "ignoring undecodable last_action");
                return;
            }
        };
        if !self.allow_list.accepts(&action) {
            return;
        }
        let _ = self.events.send(AlertEvent::Action {
            match_id: match_id.clone(),
            action,
        });
    }
}

/// Human-readable alert line for an accepted action.
pub fn alert_message(action: &ActionValue) -> String {
    match registry::resolve(action) {
        Some(cue) => format!("{}! Feed action {action}", cue.short_label.to_uppercase()),
        None => format!("Feed action {action}"),
    }
}

/// Bounded, newest-first queue of operator alerts. Inserting past capacity
/// evicts the oldest (tail) entries. Never persisted; dropped on restart.
#[derive(Debug, Default)]
pub struct AlertQueue {
    alerts: Vec<Alert>,
}

impl AlertQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: impl Into<String>) -> Uuid {
        let alert = Alert {
            id: Uuid::new_v4(),
            message: message.into(),
            timestamp: Utc::now(),
        };
        let id = alert.id;
        self.alerts.insert(0, alert);
        self.alerts.truncate(ALERT_QUEUE_CAPACITY);
        id
    }

    /// Completing and dismissing behave the same: the alert is removed.
    pub fn dismiss(&mut self, id: Uuid) -> bool {
        let before = self.alerts.len();
        self.alerts.retain(|alert| alert.id != id);
        self.alerts.len() != before
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}
