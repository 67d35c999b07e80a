use std::sync::OnceLock;

use shared::domain::ActionValue;

/// One controllable overlay graphic: the externally defined action
/// identifier, the stable document key its control flag lives under, and a
/// short operator-facing label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cue {
    pub action: ActionValue,
    pub doc_key: &'static str,
    pub short_label: &'static str,
}

pub const COMMON_DOC_KEY: &str = "common";

static CUES: OnceLock<Vec<Cue>> = OnceLock::new();

/// The fixed, process-wide cue set. Loaded once, immutable thereafter.
pub fn cues() -> &'static [Cue] {
    CUES.get_or_init(|| {
        vec![
            Cue {
                action: ActionValue::Runs(4),
                doc_key: "four",
                short_label: "Four",
            },
            Cue {
                action: ActionValue::Runs(6),
                doc_key: "six",
                short_label: "Six",
            },
            Cue {
                action: ActionValue::event("WICKET"),
                doc_key: "wicket",
                short_label: "Wicket",
            },
            Cue {
                action: ActionValue::event("WIDE_DELIVERY"),
                doc_key: "wideDelivery",
                short_label: "Wide",
            },
            Cue {
                action: ActionValue::event("FREE_HIT"),
                doc_key: "freeHit",
                short_label: "Free Hit",
            },
            Cue {
                action: ActionValue::event("SCORE_TABLE"),
                doc_key: "scoreTicker",
                short_label: "Score",
            },
            Cue {
                action: ActionValue::event("COMMON"),
                doc_key: COMMON_DOC_KEY,
                short_label: "Common",
            },
        ]
    })
}

/// Pure lookup from an action identifier to its cue, no side effects.
pub fn resolve(action: &ActionValue) -> Option<&'static Cue> {
    cues().iter().find(|cue| &cue.action == action)
}

pub fn by_doc_key(doc_key: &str) -> Option<&'static Cue> {
    cues().iter().find(|cue| cue.doc_key == doc_key)
}
