//! Music playback session orchestration.
//!
//! A session owns what is playing, what plays next and how the listener has
//! configured playback. It drives an external media player through
//! [`player::MediaPlayerAdapter`], looks tracks up through
//! [`backends::MetadataService`], and keeps going after the queue runs dry by
//! picking similar tracks. All state changes flow through one manager thread
//! listening on a broadcast bus.

pub mod backends;
pub mod config;
pub mod db_manager;
pub mod error;
pub mod genre;
pub mod history;
pub mod logging;
pub mod play_queue;
pub mod player;
pub mod position_poller;
pub mod protocol;
pub mod runtime;
pub mod session_manager;
pub mod session_store;
pub mod similar_tracks;
pub mod store;
pub mod track;

pub use config::SessionConfig;
pub use error::{PlaybackErrorKind, SessionError};
pub use genre::Genre;
pub use logging::{init_logging, init_logging_from_config};
pub use player::{AdapterState, MediaPlayerAdapter, PlayerEvent, PlayerEventSink};
pub use protocol::{Message, PlayerState, SessionMessage, SessionSnapshot};
pub use runtime::{open_default_store, SessionRuntime};
pub use session_manager::{SessionManager, SessionServices};
pub use track::Track;
