use shared::domain::{ActionValue, Channel, MatchId};
use storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComposerError {
    /// The action identifier is not registered. Nothing was written;
    /// unregistered identifiers appear through upstream configuration drift
    /// and are reported, not fatal.
    #[error("unknown cue action '{action}'")]
    UnknownCue { action: ActionValue },

    /// The active match's ticker record is missing. The control document
    /// write has already committed when this fires, so the ticker, sticker
    /// and history records stay out of sync until the next successful
    /// toggle of the same cue.
    #[error("match record '{match_id}' not found while toggling {channel}")]
    MatchNotFound { match_id: MatchId, channel: Channel },

    /// An operation that needs an active match ran before any match was
    /// selected. Nothing was written.
    #[error("no match selected")]
    NoMatchSelected,

    #[error(transparent)]
    Store(#[from] StoreError),
}
