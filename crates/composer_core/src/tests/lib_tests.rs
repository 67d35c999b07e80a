use super::*;

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use storage::{DocumentChange, Storage};
use tokio::time::timeout;

fn fields(value: serde_json::Value) -> Fields {
    value.as_object().expect("object literal").clone()
}

async fn seeded_engine(match_ids: &[&str]) -> (Arc<ComposerEngine>, Arc<dyn DocumentStore>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let store: Arc<dyn DocumentStore> = Arc::new(storage);
    for match_id in match_ids {
        store
            .upsert(
                MATCHES_COLLECTION,
                match_id,
                fields(json!({"matchTitle": format!("match {match_id}")})),
            )
            .await
            .expect("seed match");
    }
    let engine = ComposerEngine::new(Arc::clone(&store), AlertAllowList::default());
    (engine, store)
}

async fn next_event(alerts: &mut broadcast::Receiver<AlertEvent>) -> AlertEvent {
    timeout(Duration::from_secs(1), alerts.recv())
        .await
        .expect("alert event in time")
        .expect("alert event")
}

/// In-memory double with injectable write failures and a change stream that
/// closes immediately (the sender is dropped on subscribe).
#[derive(Default)]
struct TestDocumentStore {
    docs: Mutex<std::collections::HashMap<(String, String), Fields>>,
    fail_writes: Option<String>,
}

impl TestDocumentStore {
    fn failing_writes(message: impl Into<String>) -> Self {
        Self {
            fail_writes: Some(message.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl DocumentStore for TestDocumentStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Fields>, StoreError> {
        Ok(self
            .docs
            .lock()
            .await
            .get(&(collection.to_string(), key.to_string()))
            .cloned())
    }

    async fn upsert(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError> {
        if let Some(message) = &self.fail_writes {
            return Err(StoreError::Write {
                collection: collection.to_string(),
                key: key.to_string(),
                source: anyhow!(message.clone()),
            });
        }
        self.docs
            .lock()
            .await
            .insert((collection.to_string(), key.to_string()), fields);
        Ok(())
    }

    async fn update(&self, collection: &str, key: &str, fields: Fields) -> Result<(), StoreError> {
        if let Some(message) = &self.fail_writes {
            return Err(StoreError::Write {
                collection: collection.to_string(),
                key: key.to_string(),
                source: anyhow!(message.clone()),
            });
        }
        let mut docs = self.docs.lock().await;
        let Some(existing) = docs.get_mut(&(collection.to_string(), key.to_string())) else {
            return Err(StoreError::NotFound {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        };
        for (name, value) in fields {
            if value.is_null() {
                existing.remove(&name);
            } else {
                existing.insert(name, value);
            }
        }
        Ok(())
    }

    async fn append(&self, _collection: &str, _fields: Fields) -> Result<(), StoreError> {
        Ok(())
    }

    async fn query_recent(
        &self,
        _collection: &str,
        _match_id: &MatchId,
        _limit: u32,
    ) -> Result<Vec<Fields>, StoreError> {
        Ok(Vec::new())
    }

    async fn list(&self, _collection: &str) -> Result<Vec<(String, Fields)>, StoreError> {
        Ok(Vec::new())
    }

    async fn subscribe(&self, _collection: &str, _key: &str) -> broadcast::Receiver<DocumentChange> {
        broadcast::channel(8).1
    }
}

#[tokio::test]
async fn toggle_activates_all_four_records() {
    let (engine, store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");

    let now_on = engine
        .toggle(&ActionValue::Runs(4), Channel::Preview)
        .await
        .expect("toggle");
    assert!(now_on);

    let control = store
        .get("preview", "four")
        .await
        .expect("get control")
        .expect("control doc");
    assert_eq!(control.get("control"), Some(&json!(true)));

    let ticker = store
        .get("matches", "m1")
        .await
        .expect("get match")
        .expect("match doc");
    assert_eq!(ticker.get("ticker_preview"), Some(&json!(4)));

    let sticker = store
        .get("sticker_preview", "m1")
        .await
        .expect("get sticker")
        .expect("sticker doc");
    assert_eq!(sticker.get("type"), Some(&json!(4)));
    assert_eq!(sticker.get("active"), Some(&json!(true)));

    let entries = engine
        .history()
        .query(&"m1".into())
        .await
        .expect("history");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, ActionValue::Runs(4));
    assert_eq!(entries[0].mode, Channel::Preview);
    assert_eq!(entries[0].match_id, "m1".into());
}

#[tokio::test]
async fn toggle_twice_returns_to_inactive() {
    let (engine, store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");

    assert!(engine
        .toggle(&ActionValue::Runs(4), Channel::Preview)
        .await
        .expect("first toggle"));
    assert!(!engine
        .toggle(&ActionValue::Runs(4), Channel::Preview)
        .await
        .expect("second toggle"));

    let control = store
        .get("preview", "four")
        .await
        .expect("get control")
        .expect("control doc");
    assert_eq!(control.get("control"), Some(&json!(false)));

    let ticker = store
        .get("matches", "m1")
        .await
        .expect("get match")
        .expect("match doc");
    assert!(ticker.get("ticker_preview").is_none(), "ticker must clear");

    let sticker = store
        .get("sticker_preview", "m1")
        .await
        .expect("get sticker")
        .expect("sticker doc");
    assert_eq!(sticker.get("active"), Some(&json!(false)));

    let entries = engine
        .history()
        .query(&"m1".into())
        .await
        .expect("history");
    assert_eq!(entries.len(), 2);
}

#[tokio::test]
async fn toggle_symbolic_cue_writes_symbolic_ticker() {
    let (engine, store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");

    engine
        .toggle(&ActionValue::event("WICKET"), Channel::Live)
        .await
        .expect("toggle");

    let ticker = store
        .get("matches", "m1")
        .await
        .expect("get match")
        .expect("match doc");
    assert_eq!(ticker.get("ticker_live"), Some(&json!("WICKET")));
    assert!(ticker.get("ticker_preview").is_none());
}

#[tokio::test]
async fn unknown_cue_aborts_before_any_write() {
    let (engine, store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");

    let err = engine
        .toggle(&ActionValue::event("NOBALL"), Channel::Preview)
        .await
        .expect_err("toggle must fail");
    assert!(matches!(err, ComposerError::UnknownCue { .. }), "got {err:?}");

    let snapshot = engine.refresh_channel(Channel::Preview).await.expect("refresh");
    assert!(snapshot.is_empty());
    let ticker = store
        .get("matches", "m1")
        .await
        .expect("get match")
        .expect("match doc");
    assert!(ticker.get("ticker_preview").is_none());
}

#[tokio::test]
async fn toggle_without_selected_match_is_rejected() {
    let (engine, store) = seeded_engine(&["m1"]).await;

    let err = engine
        .toggle(&ActionValue::Runs(6), Channel::Live)
        .await
        .expect_err("toggle must fail");
    assert!(matches!(err, ComposerError::NoMatchSelected), "got {err:?}");
    assert!(store.get("live", "six").await.expect("get").is_none());
}

#[tokio::test]
async fn missing_match_record_leaves_control_flag_committed() {
    let (engine, store) = seeded_engine(&[]).await;
    engine.select_match("ghost".into()).await.expect("select");

    let err = engine
        .toggle(&ActionValue::Runs(6), Channel::Live)
        .await
        .expect_err("toggle must fail");
    assert!(matches!(err, ComposerError::MatchNotFound { .. }), "got {err:?}");

    // The control write committed before the failure and is not rolled back.
    let control = store
        .get("live", "six")
        .await
        .expect("get control")
        .expect("control doc");
    assert_eq!(control.get("control"), Some(&json!(true)));

    assert!(store
        .get("sticker_live", "ghost")
        .await
        .expect("get sticker")
        .is_none());
    assert!(engine
        .history()
        .query(&"ghost".into())
        .await
        .expect("history")
        .is_empty());
}

#[tokio::test]
async fn history_is_bounded_and_newest_first() {
    let (engine, _store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");

    let base = Utc::now();
    for n in 0..25u32 {
        let entry = HistoryEntry {
            action: ActionValue::Runs(n),
            mode: Channel::Preview,
            timestamp: base + chrono::Duration::seconds(i64::from(n)),
            match_id: "m1".into(),
        };
        engine.history().record(&entry).await.expect("record");
    }

    let entries = engine
        .history()
        .query(&"m1".into())
        .await
        .expect("query");
    assert_eq!(entries.len(), 20);
    assert_eq!(entries[0].action, ActionValue::Runs(24));
    assert!(entries
        .windows(2)
        .all(|pair| pair[0].timestamp >= pair[1].timestamp));
}

#[tokio::test]
async fn channel_cache_snapshot_omits_missing_documents() {
    let (engine, _store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");

    engine
        .toggle(&ActionValue::Runs(4), Channel::Preview)
        .await
        .expect("toggle");

    let snapshot = engine
        .refresh_channel(Channel::Preview)
        .await
        .expect("refresh");
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot.get("four").expect("four cached").control);

    let cached = engine.channel_state(Channel::Preview).await;
    assert_eq!(cached.len(), 1);
    assert!(engine.channel_state(Channel::Live).await.is_empty());
}

#[tokio::test]
async fn common_title_propagates_to_both_channels() {
    let (engine, store) = seeded_engine(&["m1"]).await;

    let now_on = engine
        .set_common_title(Channel::Preview, "Innings Break")
        .await
        .expect("set title");
    assert!(now_on);

    let preview = store
        .get("preview", "common")
        .await
        .expect("get preview")
        .expect("preview common");
    assert_eq!(preview.get("control"), Some(&json!(true)));
    assert_eq!(preview.get("title"), Some(&json!("Innings Break")));

    let live = store
        .get("live", "common")
        .await
        .expect("get live")
        .expect("live common");
    assert_eq!(live.get("control"), Some(&json!(false)));
    assert_eq!(live.get("title"), Some(&json!("Innings Break")));

    // A second invocation only clears the invoked channel's flag.
    let now_on = engine
        .set_common_title(Channel::Preview, "ignored")
        .await
        .expect("clear title");
    assert!(!now_on);

    let preview = store
        .get("preview", "common")
        .await
        .expect("get preview")
        .expect("preview common");
    assert_eq!(preview.get("control"), Some(&json!(false)));
    assert_eq!(preview.get("title"), Some(&json!("Innings Break")));
}

#[tokio::test]
async fn allowlisted_actions_are_delivered_and_others_filtered() {
    let (engine, store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");
    let mut alerts = engine.alerts().subscribe_events();

    for action in [json!("WICKET"), json!("NOBALL"), json!("TOSS")] {
        store
            .update(MATCHES_COLLECTION, "m1", fields(json!({"last_action": action})))
            .await
            .expect("feed write");
    }

    match next_event(&mut alerts).await {
        AlertEvent::Action { action, .. } => assert_eq!(action, ActionValue::event("WICKET")),
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut alerts).await {
        AlertEvent::Action { action, .. } => assert_eq!(action, ActionValue::event("TOSS")),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn duplicate_actions_are_redelivered() {
    let (engine, store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");
    let mut alerts = engine.alerts().subscribe_events();

    for _ in 0..2 {
        store
            .update(MATCHES_COLLECTION, "m1", fields(json!({"last_action": "WICKET"})))
            .await
            .expect("feed write");
    }

    for _ in 0..2 {
        match next_event(&mut alerts).await {
            AlertEvent::Action { action, .. } => {
                assert_eq!(action, ActionValue::event("WICKET"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn numeric_actions_respect_allow_list() {
    let (engine, store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");
    let mut alerts = engine.alerts().subscribe_events();

    for runs in [4, 5, 6] {
        store
            .update(MATCHES_COLLECTION, "m1", fields(json!({"last_action": runs})))
            .await
            .expect("feed write");
    }

    match next_event(&mut alerts).await {
        AlertEvent::Action { action, .. } => assert_eq!(action, ActionValue::Runs(4)),
        other => panic!("unexpected event {other:?}"),
    }
    match next_event(&mut alerts).await {
        AlertEvent::Action { action, .. } => assert_eq!(action, ActionValue::Runs(6)),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn empty_symbolic_action_is_discarded() {
    let (engine, store) = seeded_engine(&["m1"]).await;
    engine.select_match("m1".into()).await.expect("select");
    let mut alerts = engine.alerts().subscribe_events();

    store
        .update(MATCHES_COLLECTION, "m1", fields(json!({"last_action": ""})))
        .await
        .expect("feed write");
    store
        .update(MATCHES_COLLECTION, "m1", fields(json!({"last_action": "TOSS"})))
        .await
        .expect("feed write");

    match next_event(&mut alerts).await {
        AlertEvent::Action { action, .. } => assert_eq!(action, ActionValue::event("TOSS")),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn reattach_binds_to_the_new_match_only() {
    let (engine, store) = seeded_engine(&["m1", "m2"]).await;
    engine.select_match("m1".into()).await.expect("select m1");
    engine.select_match("m2".into()).await.expect("select m2");
    assert_eq!(engine.alerts().attached_match().await, Some("m2".into()));

    let mut alerts = engine.alerts().subscribe_events();
    store
        .update(MATCHES_COLLECTION, "m1", fields(json!({"last_action": "WICKET"})))
        .await
        .expect("stale feed write");
    store
        .update(MATCHES_COLLECTION, "m2", fields(json!({"last_action": "TOSS"})))
        .await
        .expect("feed write");

    match next_event(&mut alerts).await {
        AlertEvent::Action { match_id, action } => {
            assert_eq!(match_id, "m2".into());
            assert_eq!(action, ActionValue::event("TOSS"));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn detach_is_idempotent() {
    let (engine, _store) = seeded_engine(&["m1"]).await;
    engine.alerts().detach().await;

    engine.select_match("m1".into()).await.expect("select");
    assert_eq!(engine.alerts().attached_match().await, Some("m1".into()));

    engine.alerts().detach().await;
    engine.alerts().detach().await;
    assert!(engine.alerts().attached_match().await.is_none());
}

#[tokio::test]
async fn closed_stream_surfaces_terminal_event_and_detaches() {
    let store: Arc<dyn DocumentStore> = Arc::new(TestDocumentStore::default());
    let engine = ComposerEngine::new(Arc::clone(&store), AlertAllowList::default());
    let mut alerts = engine.alerts().subscribe_events();

    engine.select_match("m1".into()).await.expect("select");

    match next_event(&mut alerts).await {
        AlertEvent::SubscriptionClosed { match_id } => assert_eq!(match_id, "m1".into()),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(engine.alerts().attached_match().await.is_none());
}

#[tokio::test]
async fn write_failure_propagates_from_toggle() {
    let store: Arc<dyn DocumentStore> = Arc::new(TestDocumentStore::failing_writes("disk offline"));
    let engine = ComposerEngine::new(Arc::clone(&store), AlertAllowList::default());
    engine.select_match("m1".into()).await.expect("select");

    let err = engine
        .toggle(&ActionValue::Runs(4), Channel::Preview)
        .await
        .expect_err("toggle must fail");
    assert!(
        matches!(err, ComposerError::Store(StoreError::Write { .. })),
        "got {err:?}"
    );
}

#[test]
fn alert_queue_evicts_oldest_beyond_capacity() {
    let mut queue = AlertQueue::new();
    for n in 1..=6 {
        queue.push(format!("alert {n}"));
    }
    assert_eq!(queue.len(), ALERT_QUEUE_CAPACITY);
    assert_eq!(queue.alerts()[0].message, "alert 6");
    assert_eq!(queue.alerts()[4].message, "alert 2");
}

#[test]
fn alert_queue_dismiss_removes_by_id() {
    let mut queue = AlertQueue::new();
    let first = queue.push("one");
    queue.push("two");

    assert!(queue.dismiss(first));
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.alerts()[0].message, "two");
    assert!(!queue.dismiss(first));
}

#[test]
fn registry_resolves_known_actions_only() {
    let cue = registry::resolve(&ActionValue::Runs(4)).expect("four");
    assert_eq!(cue.doc_key, "four");
    assert_eq!(
        registry::resolve(&ActionValue::event("SCORE_TABLE")).expect("score").doc_key,
        "scoreTicker"
    );
    assert!(registry::resolve(&ActionValue::event("NOBALL")).is_none());
}

#[test]
fn alert_message_uses_cue_label_when_registered() {
    assert!(alert_message(&ActionValue::Runs(4)).starts_with("FOUR!"));
    assert_eq!(
        alert_message(&ActionValue::event("WINNER")),
        "Feed action WINNER"
    );
}
