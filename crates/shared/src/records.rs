use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ActionValue, Channel, MatchId};

/// Per-(channel, cue) control flag. Absence of the document is equivalent to
/// `control = false`; documents are created lazily on first toggle and never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlDocument {
    pub control: bool,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Per-match record shared with the upstream scoring feed: the composer
/// writes the `ticker_*` fields, the feed writes `last_action`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchTickerRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker_preview: Option<ActionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker_live: Option<ActionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action: Option<ActionValue>,
    #[serde(
        default,
        rename = "lastUpdated",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_updated: Option<DateTime<Utc>>,
}

impl MatchTickerRecord {
    pub fn ticker(&self, channel: Channel) -> Option<&ActionValue> {
        match channel {
            Channel::Preview => self.ticker_preview.as_ref(),
            Channel::Live => self.ticker_live.as_ref(),
        }
    }
}

/// Display-layer overlay state for one (channel, match): always the most
/// recently toggled cue, not a per-cue history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickerRecord {
    #[serde(rename = "type")]
    pub action: ActionValue,
    pub active: bool,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

/// Append-only record of one operator action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: ActionValue,
    pub mode: Channel,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "matchId")]
    pub match_id: MatchId,
}

/// Transient operator alert. In-memory only; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub id: Uuid,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Match catalog entry, as listed by the match picker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSummary {
    #[serde(skip)]
    pub id: MatchId,
    #[serde(default, rename = "matchTitle")]
    pub match_title: String,
    #[serde(default)]
    pub location: String,
    #[serde(default, rename = "matchTime", skip_serializing_if = "Option::is_none")]
    pub match_time: Option<String>,
}
