//! Listening history and recent search queries.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::track::Track;

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;
pub const DEFAULT_RECENT_SEARCH_CAPACITY: usize = 10;

/// Milliseconds since the Unix epoch, 0 if the clock is before it.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub played_at_epoch_ms: u64,
}

/// Plays, newest first, at most one entry per track id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayHistory {
    items: Vec<HistoryItem>,
    capacity: usize,
}

impl PlayHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    /// Rebuilds a history from persisted items, reapplying dedupe and the cap.
    pub fn from_items(items: Vec<HistoryItem>, capacity: usize) -> Self {
        let mut history = Self::new(capacity);
        for item in items {
            if history.items.iter().any(|seen| seen.track_id == item.track_id) {
                continue;
            }
            history.items.push(item);
        }
        history.items.truncate(history.capacity);
        history
    }

    /// Records a play of `track`, moving any earlier entry for the same id to
    /// the front and evicting the oldest entries beyond capacity.
    pub fn record(&mut self, track: &Track, played_at_epoch_ms: u64) {
        self.items.retain(|item| item.track_id != track.id);
        self.items.insert(
            0,
            HistoryItem {
                track_id: track.id.clone(),
                title: track.title.clone(),
                artist: track.artist.clone(),
                played_at_epoch_ms,
            },
        );
        self.items.truncate(self.capacity);
    }

    pub fn items(&self) -> &[HistoryItem] {
        &self.items
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.items.iter().any(|item| item.track_id == track_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Default for PlayHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentSearch {
    pub query: String,
    pub searched_at_epoch_ms: u64,
}

/// Recent free-text searches, newest first, deduplicated ignoring case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentSearches {
    entries: Vec<RecentSearch>,
    capacity: usize,
}

impl RecentSearches {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn from_entries(entries: Vec<RecentSearch>, capacity: usize) -> Self {
        let mut searches = Self::new(capacity);
        for entry in entries.into_iter().rev() {
            searches.record(&entry.query, entry.searched_at_epoch_ms);
        }
        searches
    }

    /// Records `query`; blank queries are ignored.
    pub fn record(&mut self, query: &str, searched_at_epoch_ms: u64) {
        let query = query.trim();
        if query.is_empty() {
            return;
        }
        let lowered = query.to_lowercase();
        self.entries
            .retain(|entry| entry.query.to_lowercase() != lowered);
        self.entries.insert(
            0,
            RecentSearch {
                query: query.to_string(),
                searched_at_epoch_ms,
            },
        );
        self.entries.truncate(self.capacity);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[RecentSearch] {
        &self.entries
    }
}

impl Default for RecentSearches {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_SEARCH_CAPACITY)
    }
}
