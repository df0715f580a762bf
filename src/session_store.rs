//! Typed, versioned access to persisted session state.
//!
//! Each key holds an independent `{version, data}` blob. Reads that fail or
//! find an unexpected version fall back to defaults; writes that fail are
//! logged. Neither ever surfaces to callers, so in-memory state stays
//! authoritative when storage misbehaves.

use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::history::{HistoryItem, PlayHistory, RecentSearch, RecentSearches};
use crate::protocol::Settings;
use crate::store::PersistentStore;
use crate::track::{LikedTracks, Track};

pub const SETTINGS_KEY: &str = "session-settings";
pub const HISTORY_KEY: &str = "play-history";
pub const LIKED_TRACKS_KEY: &str = "liked-tracks";
pub const SEARCH_HISTORY_KEY: &str = "search-history";
pub const VOLUME_KEY: &str = "volume";

const SETTINGS_VERSION: u32 = 1;
const HISTORY_VERSION: u32 = 1;
const LIKED_TRACKS_VERSION: u32 = 1;
const SEARCH_HISTORY_VERSION: u32 = 1;
const VOLUME_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Versioned<T> {
    version: u32,
    data: T,
}

/// Current volume plus the level to restore when unmuting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeState {
    pub volume: u8,
    #[serde(default)]
    pub previous_volume: Option<u8>,
}

pub struct SessionStore {
    store: Box<dyn PersistentStore>,
}

impl SessionStore {
    pub fn new(store: Box<dyn PersistentStore>) -> Self {
        Self { store }
    }

    fn load<T: DeserializeOwned>(&self, key: &str, version: u32) -> Option<T> {
        let raw = match self.store.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                error!("SessionStore: failed to read {}: {}", key, e);
                return None;
            }
        };
        match serde_json::from_value::<Versioned<T>>(raw) {
            Ok(blob) if blob.version == version => Some(blob.data),
            Ok(blob) => {
                warn!(
                    "SessionStore: discarding {} with unsupported version {} (expected {})",
                    key, blob.version, version
                );
                None
            }
            Err(e) => {
                warn!("SessionStore: discarding unreadable {}: {}", key, e);
                None
            }
        }
    }

    fn save<T: Serialize>(&mut self, key: &str, version: u32, data: &T) {
        let value = match serde_json::to_value(Versioned { version, data }) {
            Ok(value) => value,
            Err(e) => {
                error!("SessionStore: failed to encode {}: {}", key, e);
                return;
            }
        };
        match self.store.set(key, value) {
            Ok(()) => debug!("SessionStore: saved {}", key),
            Err(e) => error!("SessionStore: failed to save {}: {}", key, e),
        }
    }

    pub fn load_settings(&self) -> Settings {
        self.load(SETTINGS_KEY, SETTINGS_VERSION).unwrap_or_default()
    }

    /// Writes both flags as a single value.
    pub fn save_settings(&mut self, settings: &Settings) {
        self.save(SETTINGS_KEY, SETTINGS_VERSION, settings);
    }

    pub fn load_history(&self, capacity: usize) -> PlayHistory {
        let items: Vec<HistoryItem> = self.load(HISTORY_KEY, HISTORY_VERSION).unwrap_or_default();
        PlayHistory::from_items(items, capacity)
    }

    pub fn save_history(&mut self, history: &PlayHistory) {
        self.save(HISTORY_KEY, HISTORY_VERSION, &history.items());
    }

    pub fn load_liked_tracks(&self) -> LikedTracks {
        let tracks: Vec<Track> = self
            .load(LIKED_TRACKS_KEY, LIKED_TRACKS_VERSION)
            .unwrap_or_default();
        LikedTracks::from_tracks(tracks)
    }

    pub fn save_liked_tracks(&mut self, liked: &LikedTracks) {
        self.save(LIKED_TRACKS_KEY, LIKED_TRACKS_VERSION, &liked.tracks());
    }

    pub fn load_recent_searches(&self, capacity: usize) -> RecentSearches {
        let entries: Vec<RecentSearch> = self
            .load(SEARCH_HISTORY_KEY, SEARCH_HISTORY_VERSION)
            .unwrap_or_default();
        RecentSearches::from_entries(entries, capacity)
    }

    pub fn save_recent_searches(&mut self, searches: &RecentSearches) {
        self.save(SEARCH_HISTORY_KEY, SEARCH_HISTORY_VERSION, &searches.entries());
    }

    pub fn load_volume(&self) -> Option<VolumeState> {
        self.load::<VolumeState>(VOLUME_KEY, VOLUME_VERSION)
            .map(|state| VolumeState {
                volume: state.volume.min(100),
                previous_volume: state.previous_volume.map(|volume| volume.min(100)),
            })
    }

    pub fn save_volume(&mut self, state: &VolumeState) {
        self.save(VOLUME_KEY, VOLUME_VERSION, state);
    }
}
