//! Contract for the embedded media player the session drives.
//!
//! Commands are fire-and-forget. The session learns what actually happened
//! only from [`PlayerEvent`]s, which the adapter pushes into the
//! [`PlayerEventSink`] it was handed at subscription time. Events may arrive
//! in any order relative to the commands that caused them.

use tokio::sync::broadcast::Sender;

use crate::protocol::{Message, PlayerMessage};

/// Raw state reported by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unstarted,
    Ended,
    Playing,
    Paused,
    Buffering,
    Cued,
}

impl AdapterState {
    /// Maps the embedded player's numeric state codes.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Unstarted),
            0 => Some(Self::Ended),
            1 => Some(Self::Playing),
            2 => Some(Self::Paused),
            3 => Some(Self::Buffering),
            5 => Some(Self::Cued),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    /// The player finished initializing and accepts commands.
    Ready,
    /// The player could not be initialized at all.
    InitFailed(String),
    /// `track_id` is the track the player had loaded when the change
    /// happened, if the player knows it. Players that cannot tag events must
    /// report `Unstarted` or `Cued` for every newly loaded track; untagged
    /// events before that are treated as leftovers of the previous track.
    StateChanged {
        state: AdapterState,
        track_id: Option<String>,
    },
    Error {
        code: i32,
        track_id: Option<String>,
    },
}

/// Delivers player events onto the session bus.
#[derive(Debug, Clone)]
pub struct PlayerEventSink {
    bus_producer: Sender<Message>,
}

impl PlayerEventSink {
    pub fn new(bus_producer: Sender<Message>) -> Self {
        Self { bus_producer }
    }

    pub fn emit(&self, event: PlayerEvent) {
        let _ = self
            .bus_producer
            .send(Message::Player(PlayerMessage::Event(event)));
    }
}

/// A single embedded player instance. Loading a new track into a ready
/// instance must not re-initialize it.
pub trait MediaPlayerAdapter: Send + Sync {
    /// Registers where events go. Called once by the session before any command.
    fn subscribe(&self, sink: PlayerEventSink);
    fn load(&self, track_id: &str);
    fn play(&self);
    fn pause(&self);
    fn seek(&self, seconds: u32);
    fn set_volume(&self, volume: u8);
    /// Current playback position, `None` if the player cannot report it.
    fn position_seconds(&self) -> Option<u32>;
    /// Hint that `track_id` is likely to play next, so the player can start
    /// fetching it. Best effort; players that cannot prebuffer ignore it.
    fn prebuffer(&self, _track_id: &str) {}
}
