//! Metadata service abstractions and concrete implementations.

pub mod youtube;

use thiserror::Error;

use crate::track::Track;

/// What a search candidate points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Track,
    Playlist,
    Channel,
}

/// Thumbnail URLs by size, any of which may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Thumbnails {
    pub default: Option<String>,
    pub medium: Option<String>,
    pub high: Option<String>,
    pub standard: Option<String>,
    pub maxres: Option<String>,
}

impl Thumbnails {
    /// Largest available thumbnail, or an empty string.
    pub fn best(&self) -> String {
        [
            &self.maxres,
            &self.standard,
            &self.high,
            &self.medium,
            &self.default,
        ]
        .into_iter()
        .flatten()
        .next()
        .cloned()
        .unwrap_or_default()
    }
}

/// One ranked search hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateResult {
    pub kind: CandidateKind,
    pub id: String,
    pub title: String,
    pub author: String,
    pub thumbnails: Thumbnails,
}

impl CandidateResult {
    /// Converts a track candidate into a partially-known track.
    pub fn to_track(&self) -> Option<Track> {
        if self.kind != CandidateKind::Track {
            return None;
        }
        Some(
            Track::new(self.id.clone(), self.title.clone(), self.author.clone())
                .with_cover_url(self.thumbnails.best()),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("no track found for id {0}")]
    NotFound(String),
    #[error("metadata request failed: {0}")]
    Request(String),
    #[error("metadata response could not be parsed: {0}")]
    Parse(String),
    #[error("metadata service has no API key configured")]
    MissingApiKey,
}

/// Remote lookup service for track details and free-text search.
pub trait MetadataService: Send + Sync {
    /// Fetches complete details for `track_id`.
    fn resolve(&self, track_id: &str) -> Result<Track, MetadataError>;
    /// Returns up to `max_results` candidates in provider ranking order.
    fn search(&self, query: &str, max_results: usize)
        -> Result<Vec<CandidateResult>, MetadataError>;
}
