//! Track model and the liked-tracks collection.

use serde::{Deserialize, Serialize};

use crate::genre::{self, Genre};

/// A playable item. Identity is `id`; `duration_seconds == 0` means the
/// duration has not been resolved yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub cover_url: String,
    #[serde(default)]
    pub duration_seconds: u32,
    #[serde(default)]
    pub genre: Option<Genre>,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            cover_url: String::new(),
            duration_seconds: 0,
            genre: None,
        }
    }

    pub fn with_duration(mut self, duration_seconds: u32) -> Self {
        self.duration_seconds = duration_seconds;
        self
    }

    pub fn with_cover_url(mut self, cover_url: impl Into<String>) -> Self {
        self.cover_url = cover_url.into();
        self
    }

    pub fn has_known_duration(&self) -> bool {
        self.duration_seconds > 0
    }

    /// Returns the stored genre, classifying from title and artist when absent.
    pub fn genre_or_classify(&self) -> Genre {
        self.genre
            .unwrap_or_else(|| genre::classify(&self.title, &self.artist))
    }

    /// Fills in fields that a metadata lookup knows and this track does not.
    /// Identity never changes.
    pub fn complete_from(&mut self, resolved: &Track) {
        if resolved.duration_seconds > 0 {
            self.duration_seconds = resolved.duration_seconds;
        }
        if self.title.is_empty() {
            self.title = resolved.title.clone();
        }
        if self.artist.is_empty() {
            self.artist = resolved.artist.clone();
        }
        if self.cover_url.is_empty() {
            self.cover_url = resolved.cover_url.clone();
        }
        if self.genre.is_none() {
            self.genre = resolved.genre;
        }
    }
}

/// Liked tracks keyed by id, kept in the order they were liked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LikedTracks {
    tracks: Vec<Track>,
}

impl LikedTracks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tracks(tracks: Vec<Track>) -> Self {
        let mut liked = Self::new();
        for track in tracks {
            if !liked.contains(&track.id) {
                liked.tracks.push(track);
            }
        }
        liked
    }

    /// Flips membership of `track`. Returns `true` if it is now liked.
    pub fn toggle(&mut self, track: &Track) -> bool {
        if let Some(index) = self.tracks.iter().position(|liked| liked.id == track.id) {
            self.tracks.remove(index);
            false
        } else {
            self.tracks.push(track.clone());
            true
        }
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|track| track.id == track_id)
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
