//! Error taxonomy for the playback session.

use thiserror::Error;

/// Category of a playback failure reported by the media player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlaybackErrorKind {
    #[error("the player rejected the request parameters")]
    InvalidParameters,
    #[error("this track's format is not supported by the player")]
    FormatUnsupported,
    #[error("this track was not found or has been removed")]
    NotFound,
    #[error("the owner of this track does not allow embedded playback")]
    EmbeddingDisallowed,
    #[error("unknown playback error (code {0})")]
    Unknown(i32),
}

impl PlaybackErrorKind {
    /// Maps a raw player error code to its category.
    pub fn from_code(code: i32) -> Self {
        match code {
            2 => Self::InvalidParameters,
            5 => Self::FormatUnsupported,
            100 => Self::NotFound,
            101 | 150 => Self::EmbeddingDisallowed,
            other => Self::Unknown(other),
        }
    }
}

/// Session-level failures. Only the ones left without a fallback end up in
/// `PlaySessionState::last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("could not load details for track {track_id}: {reason}")]
    ResolutionFailure { track_id: String, reason: String },
    #[error("the media player failed to start: {0}")]
    AdapterInitFailure(String),
    #[error("{0}")]
    Playback(PlaybackErrorKind),
    #[error("{}", continuation_exhausted_message(*prevent_repeat))]
    ContinuationExhausted { prevent_repeat: bool },
}

fn continuation_exhausted_message(prevent_repeat: bool) -> &'static str {
    if prevent_repeat {
        "No more songs to play. Try turning off prevent-repeat to allow songs you've already heard."
    } else {
        "No more songs to play. Pick something new to keep listening."
    }
}
