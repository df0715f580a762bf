//! Event-bus protocol shared by the session and its observers.
//!
//! This module defines all message payloads exchanged between the session
//! manager, the media player adapter, background metadata workers and
//! whatever front end renders the session.

use crate::backends::{CandidateResult, MetadataError};
use crate::error::SessionError;
use crate::history::{HistoryItem, RecentSearch};
use crate::player::PlayerEvent;
use crate::track::Track;

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Session(SessionMessage),
    Player(PlayerMessage),
    Metadata(MetadataMessage),
}

/// Session-level playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerState {
    /// Nothing playing; initial state and the state after a session runs dry.
    #[default]
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Buffering,
    Ended,
    Error,
}

/// User toggles persisted together as one blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub shuffle_enabled: bool,
    #[serde(default)]
    pub prevent_repeat_enabled: bool,
}

/// Playback state owned by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaySessionState {
    pub current_track: Option<Track>,
    pub player_state: PlayerState,
    pub volume: u8,
    pub position_seconds: u32,
    pub duration_seconds: u32,
    pub queue: Vec<Track>,
    /// Set only when no fallback was left; cleared by the next track.
    pub last_error: Option<SessionError>,
}

impl PlaySessionState {
    pub fn new(volume: u8) -> Self {
        Self {
            current_track: None,
            player_state: PlayerState::Idle,
            volume,
            position_seconds: 0,
            duration_seconds: 0,
            queue: Vec::new(),
            last_error: None,
        }
    }

    pub fn current_track_id(&self) -> Option<&str> {
        self.current_track.as_ref().map(|track| track.id.as_str())
    }

    pub fn is_playing(&self) -> bool {
        matches!(
            self.player_state,
            PlayerState::Playing | PlayerState::Buffering
        )
    }
}

/// Everything a front end renders, published after every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: PlaySessionState,
    pub settings: Settings,
    pub history: Vec<HistoryItem>,
    pub liked_tracks: Vec<Track>,
    pub recent_searches: Vec<RecentSearch>,
    pub continuation_pending: bool,
    /// Whether the media player has reported it is ready for commands.
    pub player_ready: bool,
}

impl SessionSnapshot {
    pub fn new(volume: u8) -> Self {
        Self {
            state: PlaySessionState::new(volume),
            settings: Settings::default(),
            history: Vec::new(),
            liked_tracks: Vec::new(),
            recent_searches: Vec::new(),
            continuation_pending: false,
            player_ready: false,
        }
    }

    pub fn is_liked(&self, track_id: &str) -> bool {
        self.liked_tracks.iter().any(|track| track.id == track_id)
    }
}

/// Session commands and notifications.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    PlayTrack(Track),
    TogglePlay,
    SeekTo(u32),
    /// Any integer; clamped to 0..=100.
    SetVolume(i32),
    ToggleMute,
    NextTrack,
    PrevTrack,
    ToggleShuffleMode,
    TogglePreventRepeat,
    ToggleLike(Track),
    AddToQueue(Track),
    ClearQueue,
    PlayCollection {
        tracks: Vec<Track>,
        start_index: usize,
    },
    ShuffleCollection(Vec<Track>),
    Search {
        query: String,
        max_results: usize,
    },
    ClearSearchHistory,
    Shutdown,
    /// Position-poll tick for the playback generation that started it.
    PollPosition {
        generation: u64,
    },
    SnapshotUpdated(Box<SessionSnapshot>),
    SearchResults {
        query: String,
        results: Vec<CandidateResult>,
    },
    SearchFailed {
        query: String,
        error: MetadataError,
    },
}

/// Media player adapter events.
#[derive(Debug, Clone)]
pub enum PlayerMessage {
    Event(PlayerEvent),
}

/// Completions posted by background metadata workers.
#[derive(Debug, Clone)]
pub enum MetadataMessage {
    TrackResolved {
        generation: u64,
        track_id: String,
        result: Result<Track, MetadataError>,
    },
    ContinuationFound {
        request_id: u64,
        generation: u64,
        tracks: Vec<Track>,
    },
    SearchCompleted {
        request_id: u64,
        query: String,
        result: Result<Vec<CandidateResult>, MetadataError>,
    },
}
