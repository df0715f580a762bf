//! Picks continuation tracks for autoplay ("radio") once the queue runs dry.
//!
//! Two searches run side by side: one seeded by the track that just played
//! (title, artist, genre and a mood word), one by the listener's most played
//! artist. Hits are merged primary first, filtered and resolved to complete
//! tracks. If prevent-repeat filters everything away the search is retried
//! once without it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

use log::{debug, info, warn};

use crate::backends::{CandidateResult, MetadataService};
use crate::config::ContinuationConfig;
use crate::genre::Genre;
use crate::history::HistoryItem;
use crate::track::Track;

/// Mood words by title keyword, in priority order.
const MOOD_KEYWORDS: &[(&str, &[&str])] = &[
    ("romantic", &["love", "pyaar", "pyar", "ishq", "dil", "prem", "mohabbat"]),
    ("dance", &["dance", "party", "nach", "naach", "disco", "club"]),
    ("emotional", &["sad", "dard", "tanha", "broken", "alone", "judaai", "bewafa"]),
];

#[derive(Debug, Clone)]
pub struct ContinuationRequest {
    pub seed: Track,
    /// Newest first.
    pub history: Vec<HistoryItem>,
    pub prevent_repeat: bool,
    pub limit: usize,
}

pub struct SimilarTrackFinder {
    metadata: Arc<dyn MetadataService>,
    top_artist_count: usize,
    prevent_repeat_headroom: usize,
    query_suffix: String,
}

impl SimilarTrackFinder {
    pub fn new(metadata: Arc<dyn MetadataService>, config: &ContinuationConfig) -> Self {
        Self {
            metadata,
            top_artist_count: config.top_artist_count.max(1),
            prevent_repeat_headroom: config.prevent_repeat_headroom.max(1),
            query_suffix: config.query_suffix.trim().to_string(),
        }
    }

    /// Returns up to `request.limit` complete tracks; the first is meant to
    /// play now and the rest to become the queue.
    pub fn find(&self, request: &ContinuationRequest) -> Vec<Track> {
        let tracks = self.find_once(request, request.prevent_repeat);
        if tracks.is_empty() && request.prevent_repeat && !request.history.is_empty() {
            info!(
                "SimilarTrackFinder: every candidate for {} was already played, retrying without prevent-repeat",
                request.seed.id
            );
            return self.find_once(request, false);
        }
        tracks
    }

    fn find_once(&self, request: &ContinuationRequest, prevent_repeat: bool) -> Vec<Track> {
        if request.limit == 0 {
            return Vec::new();
        }
        let genre = request.seed.genre_or_classify();
        let primary_query = self.primary_query(&request.seed, genre);
        let top_artists = top_artists(&request.history, self.top_artist_count);
        let anchor_artist = top_artists
            .first()
            .map(String::as_str)
            .unwrap_or(request.seed.artist.as_str());
        let secondary_query = secondary_query(anchor_artist, genre);
        let fetch_count = if prevent_repeat {
            request.limit.saturating_mul(self.prevent_repeat_headroom)
        } else {
            request.limit
        };
        debug!(
            "SimilarTrackFinder: queries primary={:?} secondary={:?} fetch={}",
            primary_query, secondary_query, fetch_count
        );

        let (primary, secondary) = thread::scope(|scope| {
            let primary = scope.spawn(|| self.search(&primary_query, fetch_count));
            let secondary = scope.spawn(|| self.search(&secondary_query, fetch_count));
            (
                primary.join().unwrap_or_default(),
                secondary.join().unwrap_or_default(),
            )
        });

        let mut excluded: HashSet<&str> = HashSet::new();
        excluded.insert(request.seed.id.as_str());
        if prevent_repeat {
            excluded.extend(request.history.iter().map(|item| item.track_id.as_str()));
        }
        let mut batches = vec![primary, secondary];
        let mut picked = merge_candidates(&batches, &excluded, request.limit);
        // Less favored artists only fill up a short list.
        for artist in top_artists.iter().skip(1) {
            if picked.len() >= request.limit {
                break;
            }
            let fallback_query = self::secondary_query(artist, genre);
            debug!("SimilarTrackFinder: topping up with {:?}", fallback_query);
            batches.push(self.search(&fallback_query, fetch_count));
            picked = merge_candidates(&batches, &excluded, request.limit);
        }
        self.resolve_all(picked)
    }

    fn primary_query(&self, seed: &Track, genre: Genre) -> String {
        let mut parts: Vec<&str> = vec![seed.title.trim(), seed.artist.trim()];
        parts.extend(genre.as_query_term());
        parts.extend(mood_term(&seed.title));
        if !self.query_suffix.is_empty() {
            parts.push(&self.query_suffix);
        }
        join_terms(&parts)
    }

    fn search(&self, query: &str, max_results: usize) -> Vec<CandidateResult> {
        match self.metadata.search(query, max_results) {
            Ok(results) => results,
            Err(e) => {
                warn!("SimilarTrackFinder: search {:?} failed: {}", query, e);
                Vec::new()
            }
        }
    }

    /// Fetches complete details for every pick concurrently. A failed lookup
    /// keeps the partial track with zero duration.
    fn resolve_all(&self, tracks: Vec<Track>) -> Vec<Track> {
        thread::scope(|scope| {
            let handles: Vec<_> = tracks
                .iter()
                .map(|track| scope.spawn(move || self.metadata.resolve(&track.id)))
                .collect();
            tracks
                .iter()
                .zip(handles)
                .map(|(track, handle)| {
                    let mut track = track.clone();
                    match handle.join() {
                        Ok(Ok(resolved)) => track.complete_from(&resolved),
                        Ok(Err(e)) => {
                            warn!("SimilarTrackFinder: keeping placeholder for {}: {}", track.id, e)
                        }
                        Err(_) => warn!("SimilarTrackFinder: resolve worker for {} panicked", track.id),
                    }
                    if track.genre.is_none() {
                        track.genre = Some(track.genre_or_classify());
                    }
                    track
                })
                .collect()
        })
    }
}

fn join_terms(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn secondary_query(artist: &str, genre: Genre) -> String {
    let mut parts = vec![artist];
    parts.extend(genre.as_query_term());
    join_terms(&parts)
}

/// Mood word for a title, if any of its words carries one.
pub fn mood_term(title: &str) -> Option<&'static str> {
    let lowered = title.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    MOOD_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| words.contains(keyword)))
        .map(|(mood, _)| *mood)
}

/// The `count` most frequent artists in `history`, ties broken by which
/// artist appears first.
pub fn top_artists(history: &[HistoryItem], count: usize) -> Vec<String> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, item) in history.iter().enumerate() {
        let artist = item.artist.trim();
        if artist.is_empty() {
            continue;
        }
        counts.entry(artist).or_insert((0, position)).0 += 1;
    }
    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(artist, (plays, first_seen))| (artist, plays, first_seen))
        .collect();
    ranked.sort_by(|left, right| right.1.cmp(&left.1).then(left.2.cmp(&right.2)));
    ranked
        .into_iter()
        .take(count)
        .map(|(artist, _, _)| artist.to_string())
        .collect()
}

/// Hits in batch order (primary, secondary, then top-up searches); tracks
/// only, excluded ids and duplicates dropped, at most `limit`.
fn merge_candidates(
    batches: &[Vec<CandidateResult>],
    excluded: &HashSet<&str>,
    limit: usize,
) -> Vec<Track> {
    let mut seen: HashSet<String> = HashSet::new();
    batches
        .iter()
        .flatten()
        .filter_map(CandidateResult::to_track)
        .filter(|track| !excluded.contains(track.id.as_str()))
        .filter(|track| seen.insert(track.id.clone()))
        .take(limit)
        .collect()
}
