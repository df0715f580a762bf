//! Up-next queue consumed front first.

use std::collections::VecDeque;

use rand::seq::SliceRandom;

use crate::track::Track;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayQueue {
    tracks: VecDeque<Track>,
}

impl PlayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&mut self, track: Track) {
        self.tracks.push_back(track);
    }

    pub fn pop_front(&mut self) -> Option<Track> {
        self.tracks.pop_front()
    }

    pub fn front(&self) -> Option<&Track> {
        self.tracks.front()
    }

    pub fn replace(&mut self, tracks: Vec<Track>) {
        self.tracks = tracks.into();
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Track> {
        self.tracks.iter().cloned().collect()
    }
}

/// Splits a collection into the track to play now and the wrapped remainder,
/// keeping the remainder in its original relative order. An out-of-range
/// start falls back to the first track.
pub fn rotate_collection(tracks: Vec<Track>, start_index: usize) -> Option<(Track, Vec<Track>)> {
    if tracks.is_empty() {
        return None;
    }
    let start = if start_index < tracks.len() {
        start_index
    } else {
        0
    };
    let mut rotated = tracks;
    rotated.rotate_left(start);
    let mut rotated = rotated.into_iter();
    let first = rotated.next()?;
    Some((first, rotated.collect()))
}

/// Returns the collection in a random order.
pub fn shuffled(mut tracks: Vec<Track>) -> Vec<Track> {
    tracks.shuffle(&mut rand::rng());
    tracks
}
