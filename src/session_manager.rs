//! Playback session orchestration.
//!
//! `SessionManager` is the single owner of session state. Everything that can
//! change it arrives as a bus message: user commands, media player events,
//! position-poll ticks and completions from background metadata workers. The
//! manager is the only caller of the media player, the similar-track finder
//! and the persistent store.
//!
//! Asynchronous work is tagged when it starts. Track resolutions and
//! continuations carry the playback generation (bumped by every `play_track`);
//! continuations and searches also carry a request id. A completion whose tag
//! no longer matches is dropped, so a slow answer for an earlier track can
//! never overwrite the current one.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::backends::{CandidateResult, MetadataError, MetadataService};
use crate::config::SessionConfig;
use crate::error::{PlaybackErrorKind, SessionError};
use crate::history::{now_epoch_ms, PlayHistory, RecentSearches};
use crate::play_queue::{self, PlayQueue};
use crate::player::{AdapterState, MediaPlayerAdapter, PlayerEvent, PlayerEventSink};
use crate::position_poller::PositionPoller;
use crate::protocol::{
    Message, MetadataMessage, PlaySessionState, PlayerMessage, PlayerState, SessionMessage,
    SessionSnapshot, Settings,
};
use crate::session_store::{SessionStore, VolumeState};
use crate::similar_tracks::{ContinuationRequest, SimilarTrackFinder};
use crate::store::PersistentStore;
use crate::track::{LikedTracks, Track};

/// Latest published snapshot, readable from any thread.
pub type SnapshotHandle = Arc<Mutex<SessionSnapshot>>;

/// Capabilities the session drives.
pub struct SessionServices {
    pub player: Arc<dyn MediaPlayerAdapter>,
    pub metadata: Arc<dyn MetadataService>,
    pub store: Box<dyn PersistentStore>,
}

pub struct SessionManager {
    bus_consumer: Receiver<Message>,
    bus_producer: Sender<Message>,
    player: Arc<dyn MediaPlayerAdapter>,
    metadata: Arc<dyn MetadataService>,
    similar_tracks: Arc<SimilarTrackFinder>,
    store: SessionStore,
    snapshot: SnapshotHandle,
    config: SessionConfig,
    current_track: Option<Track>,
    player_state: PlayerState,
    volume: u8,
    muted_from_volume: Option<u8>,
    position_seconds: u32,
    duration_seconds: u32,
    last_error: Option<SessionError>,
    queue: PlayQueue,
    settings: Settings,
    history: PlayHistory,
    liked: LikedTracks,
    recent_searches: RecentSearches,
    player_ready: bool,
    // The current track still has to be handed to the player once it is ready.
    pending_load: bool,
    // The player has reported on the track it was last told to load. Until
    // then untagged events may belong to the previous track.
    load_confirmed: bool,
    playback_generation: u64,
    continuation_request: Option<u64>,
    latest_search_request: Option<u64>,
    next_request_id: u64,
    poller: PositionPoller,
}

impl SessionManager {
    /// Builds a session, restoring persisted state and subscribing to the
    /// player's events.
    pub fn new(
        bus_consumer: Receiver<Message>,
        bus_producer: Sender<Message>,
        services: SessionServices,
        config: SessionConfig,
        snapshot: SnapshotHandle,
    ) -> Self {
        let SessionServices {
            player,
            metadata,
            store,
        } = services;
        let store = SessionStore::new(store);
        let settings = store.load_settings();
        let history = store.load_history(config.history.capacity);
        let liked = store.load_liked_tracks();
        let recent_searches = store.load_recent_searches(config.history.recent_search_capacity);
        let volume_state = store.load_volume().unwrap_or(VolumeState {
            volume: config.playback.default_volume,
            previous_volume: None,
        });
        info!(
            "SessionManager: restored {} history entries, {} liked tracks, shuffle={}, prevent_repeat={}",
            history.len(),
            liked.len(),
            settings.shuffle_enabled,
            settings.prevent_repeat_enabled
        );

        let similar_tracks = Arc::new(SimilarTrackFinder::new(
            Arc::clone(&metadata),
            &config.continuation,
        ));
        let poller = PositionPoller::new(
            Duration::from_millis(config.playback.position_poll_interval_ms),
            bus_producer.clone(),
        );
        player.subscribe(PlayerEventSink::new(bus_producer.clone()));

        Self {
            bus_consumer,
            bus_producer,
            player,
            metadata,
            similar_tracks,
            store,
            snapshot,
            config,
            current_track: None,
            player_state: PlayerState::Idle,
            volume: volume_state.volume,
            muted_from_volume: volume_state.previous_volume,
            position_seconds: 0,
            duration_seconds: 0,
            last_error: None,
            queue: PlayQueue::new(),
            settings,
            history,
            liked,
            recent_searches,
            player_ready: false,
            pending_load: false,
            load_confirmed: false,
            playback_generation: 0,
            continuation_request: None,
            latest_search_request: None,
            next_request_id: 0,
            poller,
        }
    }

    pub fn run(&mut self) {
        self.publish_snapshot();
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => {
                    if !self.handle_message(message) {
                        info!("SessionManager: shutting down");
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SessionManager: bus lagged, skipped {} messages", skipped);
                    self.recover_from_lag();
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    error!("SessionManager: bus closed");
                    break;
                }
            }
        }
        self.poller.stop();
    }

    /// Skipped messages may have included a worker completion, so nothing is
    /// left to answer the outstanding requests. A continuation the session is
    /// waiting on is started again; the old answer, if it still arrives, no
    /// longer matches and is dropped.
    fn recover_from_lag(&mut self) {
        self.latest_search_request = None;
        let Some(request_id) = self.continuation_request.take() else {
            return;
        };
        warn!(
            "SessionManager: abandoning continuation {} after bus lag",
            request_id
        );
        if matches!(self.player_state, PlayerState::Ended | PlayerState::Error) {
            self.start_continuation();
        } else {
            self.publish_snapshot();
        }
    }

    /// Applies one bus message. Returns `false` once the session should stop.
    pub fn handle_message(&mut self, message: Message) -> bool {
        match message {
            Message::Session(SessionMessage::PlayTrack(track)) => self.play_track(track),
            Message::Session(SessionMessage::TogglePlay) => self.toggle_play(),
            Message::Session(SessionMessage::SeekTo(seconds)) => self.seek_to(seconds),
            Message::Session(SessionMessage::SetVolume(volume)) => self.set_volume(volume),
            Message::Session(SessionMessage::ToggleMute) => self.toggle_mute(),
            Message::Session(SessionMessage::NextTrack) => self.next_track(),
            Message::Session(SessionMessage::PrevTrack) => self.prev_track(),
            Message::Session(SessionMessage::ToggleShuffleMode) => {
                self.settings.shuffle_enabled = !self.settings.shuffle_enabled;
                debug!(
                    "SessionManager: shuffle {}",
                    if self.settings.shuffle_enabled { "on" } else { "off" }
                );
                self.store.save_settings(&self.settings);
                self.publish_snapshot();
            }
            Message::Session(SessionMessage::TogglePreventRepeat) => {
                self.settings.prevent_repeat_enabled = !self.settings.prevent_repeat_enabled;
                self.store.save_settings(&self.settings);
                self.publish_snapshot();
            }
            Message::Session(SessionMessage::ToggleLike(track)) => {
                let liked = self.liked.toggle(&track);
                debug!("SessionManager: {} liked={}", track.id, liked);
                self.store.save_liked_tracks(&self.liked);
                self.publish_snapshot();
            }
            Message::Session(SessionMessage::AddToQueue(track)) => {
                let was_empty = self.queue.is_empty();
                self.queue.push_back(track);
                if was_empty {
                    self.prebuffer_next();
                }
                self.publish_snapshot();
            }
            Message::Session(SessionMessage::ClearQueue) => {
                self.queue.clear();
                self.publish_snapshot();
            }
            Message::Session(SessionMessage::PlayCollection {
                tracks,
                start_index,
            }) => self.play_collection(tracks, start_index),
            Message::Session(SessionMessage::ShuffleCollection(tracks)) => {
                self.play_collection(play_queue::shuffled(tracks), 0)
            }
            Message::Session(SessionMessage::Search { query, max_results }) => {
                self.search(query, max_results)
            }
            Message::Session(SessionMessage::ClearSearchHistory) => {
                self.recent_searches.clear();
                self.store.save_recent_searches(&self.recent_searches);
                self.publish_snapshot();
            }
            Message::Session(SessionMessage::PollPosition { generation }) => {
                self.poll_position(generation)
            }
            Message::Session(SessionMessage::Shutdown) => {
                self.poller.stop();
                return false;
            }
            Message::Player(PlayerMessage::Event(event)) => self.handle_player_event(event),
            Message::Metadata(MetadataMessage::TrackResolved {
                generation,
                track_id,
                result,
            }) => self.apply_resolution(generation, &track_id, result),
            Message::Metadata(MetadataMessage::ContinuationFound {
                request_id,
                generation,
                tracks,
            }) => self.apply_continuation(request_id, generation, tracks),
            Message::Metadata(MetadataMessage::SearchCompleted {
                request_id,
                query,
                result,
            }) => self.apply_search(request_id, query, result),
            _ => trace!("SessionManager: ignoring unsupported message"),
        }
        true
    }

    fn play_track(&mut self, mut track: Track) {
        self.playback_generation += 1;
        let generation = self.playback_generation;
        // A continuation for the previous track is no longer wanted.
        self.continuation_request = None;
        self.poller.stop();

        if track.genre.is_none() {
            track.genre = Some(track.genre_or_classify());
        }
        self.history.record(&track, now_epoch_ms());
        self.store.save_history(&self.history);

        info!("SessionManager: playing {} ({})", track.id, track.title);
        self.player_state = PlayerState::Loading;
        self.position_seconds = 0;
        self.duration_seconds = track.duration_seconds;
        self.last_error = None;
        if !track.has_known_duration() {
            self.spawn_resolution(generation, track.id.clone());
        }
        self.current_track = Some(track);
        self.pending_load = true;
        self.load_current_track();
        self.publish_snapshot();
    }

    /// Hands the current track to the player, or leaves it pending until the
    /// player reports ready.
    fn load_current_track(&mut self) {
        if !self.pending_load {
            return;
        }
        let Some(track_id) = self.current_track_id().map(str::to_string) else {
            self.pending_load = false;
            return;
        };
        if !self.player_ready {
            debug!("SessionManager: player not ready, deferring load of {}", track_id);
            return;
        }
        self.pending_load = false;
        self.load_confirmed = false;
        self.player.set_volume(self.volume);
        self.player.load(&track_id);
        self.player.play();
        self.prebuffer_next();
    }

    /// Lets the player warm up whatever is at the front of the queue.
    fn prebuffer_next(&self) {
        if !self.player_ready {
            return;
        }
        if let Some(next) = self.queue.front() {
            trace!("SessionManager: prebuffering {}", next.id);
            self.player.prebuffer(&next.id);
        }
    }

    fn spawn_resolution(&self, generation: u64, track_id: String) {
        let metadata = Arc::clone(&self.metadata);
        let bus_producer = self.bus_producer.clone();
        thread::spawn(move || {
            let result = metadata.resolve(&track_id);
            let _ = bus_producer.send(Message::Metadata(MetadataMessage::TrackResolved {
                generation,
                track_id,
                result,
            }));
        });
    }

    fn apply_resolution(
        &mut self,
        generation: u64,
        track_id: &str,
        result: Result<Track, MetadataError>,
    ) {
        if generation != self.playback_generation || self.current_track_id() != Some(track_id) {
            debug!(
                "SessionManager: discarding stale resolution for {} (generation {})",
                track_id, generation
            );
            return;
        }
        match result {
            Ok(resolved) => {
                if let Some(track) = self.current_track.as_mut() {
                    track.complete_from(&resolved);
                    self.duration_seconds = track.duration_seconds;
                }
                self.publish_snapshot();
            }
            Err(e) => {
                // Playback continues with the zero-duration placeholder.
                let failure = SessionError::ResolutionFailure {
                    track_id: track_id.to_string(),
                    reason: e.to_string(),
                };
                warn!("SessionManager: {}", failure);
            }
        }
    }

    fn toggle_play(&mut self) {
        if self.current_track.is_none() || self.player_state == PlayerState::Idle {
            return;
        }
        if self.continuation_request.is_some() {
            debug!("SessionManager: ignoring toggle while finding the next track");
            return;
        }
        if !self.player_ready || self.pending_load {
            debug!("SessionManager: ignoring toggle, nothing loaded in the player");
            return;
        }
        // The state only flips when the player confirms it.
        if matches!(
            self.player_state,
            PlayerState::Playing | PlayerState::Buffering
        ) {
            self.player.pause();
        } else {
            self.player.play();
        }
    }

    fn track_is_loaded(&self) -> bool {
        self.current_track.is_some() && self.player_ready && !self.pending_load
    }

    fn seek_to(&mut self, seconds: u32) {
        if !self.track_is_loaded() {
            debug!("SessionManager: ignoring seek, nothing loaded in the player");
            return;
        }
        let target = if self.duration_seconds > 0 {
            seconds.min(self.duration_seconds)
        } else {
            seconds
        };
        self.player.seek(target);
        self.position_seconds = target;
        self.publish_snapshot();
    }

    fn set_volume(&mut self, volume: i32) {
        self.apply_volume(volume.clamp(0, 100) as u8);
    }

    fn toggle_mute(&mut self) {
        if self.volume == 0 {
            let restored = self
                .muted_from_volume
                .take()
                .filter(|volume| *volume > 0)
                .unwrap_or(self.config.playback.default_volume);
            self.apply_volume(restored);
        } else {
            self.muted_from_volume = Some(self.volume);
            self.apply_volume(0);
        }
    }

    /// Stores the volume; the player only hears about it when a track is
    /// loaded, otherwise it is applied on the next load.
    fn apply_volume(&mut self, volume: u8) {
        self.volume = volume;
        if self.track_is_loaded() {
            self.player.set_volume(volume);
        }
        self.store.save_volume(&VolumeState {
            volume,
            previous_volume: self.muted_from_volume,
        });
        self.publish_snapshot();
    }

    fn next_track(&mut self) {
        if self.continuation_request.is_some() {
            debug!("SessionManager: ignoring next, a continuation is already in flight");
            return;
        }
        if let Some(next) = self.queue.pop_front() {
            self.play_track(next);
        } else if self.settings.shuffle_enabled && self.current_track.is_some() {
            self.start_continuation();
        } else {
            debug!("SessionManager: nothing queued to skip to");
        }
    }

    /// Restarts the current track. There is no backwards navigation through
    /// history.
    fn prev_track(&mut self) {
        if !self.track_is_loaded() {
            return;
        }
        self.player.seek(0);
        self.position_seconds = 0;
        self.publish_snapshot();
    }

    fn play_collection(&mut self, tracks: Vec<Track>, start_index: usize) {
        let Some((first, rest)) = play_queue::rotate_collection(tracks, start_index) else {
            warn!("SessionManager: ignoring empty collection");
            return;
        };
        self.queue.replace(rest);
        self.play_track(first);
    }

    fn handle_player_event(&mut self, event: PlayerEvent) {
        match event {
            PlayerEvent::Ready => {
                info!("SessionManager: player ready");
                self.player_ready = true;
                if self.pending_load {
                    if self.player_state == PlayerState::Loading {
                        self.player_state = PlayerState::Ready;
                    }
                    self.load_current_track();
                }
                self.publish_snapshot();
            }
            PlayerEvent::InitFailed(reason) => {
                error!("SessionManager: player failed to initialize: {}", reason);
                self.player_ready = false;
                self.pending_load = false;
                self.poller.stop();
                self.player_state = PlayerState::Error;
                self.last_error = Some(SessionError::AdapterInitFailure(reason));
                self.publish_snapshot();
            }
            PlayerEvent::StateChanged { state, track_id } => {
                if self.is_stale_event(track_id.as_deref()) {
                    return;
                }
                self.apply_adapter_state(state, track_id.is_some());
            }
            PlayerEvent::Error { code, track_id } => {
                if self.is_stale_event(track_id.as_deref()) {
                    return;
                }
                let kind = PlaybackErrorKind::from_code(code);
                warn!("SessionManager: playback error {}: {}", code, kind);
                if self.current_track.is_none() {
                    self.player_state = PlayerState::Error;
                    self.last_error = Some(SessionError::Playback(kind));
                    self.publish_snapshot();
                    return;
                }
                self.handle_track_end(Some(kind));
            }
        }
    }

    fn is_stale_event(&self, track_id: Option<&str>) -> bool {
        match track_id {
            Some(id) if self.current_track_id() != Some(id) => {
                debug!("SessionManager: discarding player event for stale track {}", id);
                true
            }
            _ => false,
        }
    }

    /// `tagged` is whether the event named the track it is about.
    fn apply_adapter_state(&mut self, state: AdapterState, tagged: bool) {
        if self.current_track.is_none() || self.pending_load {
            trace!("SessionManager: ignoring player state {:?} with nothing loaded", state);
            return;
        }
        // Unstarted and cued are only reported for a freshly loaded track.
        if tagged || matches!(state, AdapterState::Unstarted | AdapterState::Cued) {
            self.load_confirmed = true;
        } else if !self.load_confirmed {
            debug!(
                "SessionManager: ignoring untagged {:?} until the player confirms the load",
                state
            );
            return;
        }
        match state {
            AdapterState::Playing => {
                if matches!(self.player_state, PlayerState::Idle | PlayerState::Ended) {
                    return;
                }
                self.player_state = PlayerState::Playing;
                self.poller.start(self.playback_generation);
                self.publish_snapshot();
            }
            AdapterState::Paused => {
                if matches!(
                    self.player_state,
                    PlayerState::Idle | PlayerState::Ended | PlayerState::Error
                ) {
                    return;
                }
                self.player_state = PlayerState::Paused;
                self.poller.stop();
                self.publish_snapshot();
            }
            AdapterState::Buffering => {
                if !matches!(
                    self.player_state,
                    PlayerState::Loading | PlayerState::Ready | PlayerState::Playing
                ) {
                    return;
                }
                self.player_state = PlayerState::Buffering;
                self.poller.stop();
                self.publish_snapshot();
            }
            AdapterState::Ended => {
                if !matches!(
                    self.player_state,
                    PlayerState::Playing | PlayerState::Paused
                ) {
                    debug!(
                        "SessionManager: ignoring end of a track that never started ({:?})",
                        self.player_state
                    );
                    return;
                }
                self.handle_track_end(None);
            }
            AdapterState::Cued => {
                self.prebuffer_next();
                if self.player_state == PlayerState::Loading {
                    self.player_state = PlayerState::Ready;
                    self.publish_snapshot();
                }
            }
            AdapterState::Unstarted => trace!("SessionManager: player unstarted"),
        }
    }

    /// Shared by natural ends and playback errors: queue first, then
    /// continuation, then give up to `Idle`.
    fn handle_track_end(&mut self, error: Option<PlaybackErrorKind>) {
        self.poller.stop();
        if let Some(next) = self.queue.pop_front() {
            if let Some(kind) = error {
                info!("SessionManager: skipping to queued track after error: {}", kind);
            }
            self.play_track(next);
            return;
        }

        if self.settings.shuffle_enabled {
            self.player_state = if error.is_some() {
                PlayerState::Error
            } else {
                PlayerState::Ended
            };
            self.start_continuation();
            return;
        }

        self.player_state = PlayerState::Idle;
        self.position_seconds = 0;
        self.last_error = error.map(SessionError::Playback);
        self.publish_snapshot();
    }

    fn start_continuation(&mut self) {
        if self.continuation_request.is_some() {
            debug!("SessionManager: continuation already in flight");
            return;
        }
        let Some(seed) = self.current_track.clone() else {
            return;
        };
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let generation = self.playback_generation;
        self.continuation_request = Some(request_id);

        let request = ContinuationRequest {
            seed,
            history: self.history.items().to_vec(),
            prevent_repeat: self.settings.prevent_repeat_enabled,
            limit: self.config.continuation.limit,
        };
        info!(
            "SessionManager: finding continuation after {} (prevent_repeat={})",
            request.seed.id, request.prevent_repeat
        );
        let finder = Arc::clone(&self.similar_tracks);
        let bus_producer = self.bus_producer.clone();
        thread::spawn(move || {
            let tracks = finder.find(&request);
            let _ = bus_producer.send(Message::Metadata(MetadataMessage::ContinuationFound {
                request_id,
                generation,
                tracks,
            }));
        });
        self.publish_snapshot();
    }

    fn apply_continuation(&mut self, request_id: u64, generation: u64, tracks: Vec<Track>) {
        if self.continuation_request != Some(request_id) {
            debug!("SessionManager: discarding superseded continuation {}", request_id);
            return;
        }
        self.continuation_request = None;
        if generation != self.playback_generation {
            debug!("SessionManager: discarding continuation for an earlier track");
            self.publish_snapshot();
            return;
        }

        let mut tracks = tracks.into_iter();
        match tracks.next() {
            Some(first) => {
                self.queue.replace(tracks.collect());
                self.play_track(first);
            }
            None => {
                let prevent_repeat = self.settings.prevent_repeat_enabled;
                warn!(
                    "SessionManager: no continuation found (prevent_repeat={})",
                    prevent_repeat
                );
                self.player_state = PlayerState::Idle;
                self.position_seconds = 0;
                self.last_error = Some(SessionError::ContinuationExhausted { prevent_repeat });
                self.publish_snapshot();
            }
        }
    }

    fn poll_position(&mut self, generation: u64) {
        if generation != self.playback_generation || self.player_state != PlayerState::Playing {
            trace!("SessionManager: ignoring stale position poll");
            return;
        }
        let Some(position) = self.player.position_seconds() else {
            return;
        };
        if position != self.position_seconds {
            self.position_seconds = position;
            self.publish_snapshot();
        }
    }

    fn search(&mut self, query: String, max_results: usize) {
        let query = query.trim().to_string();
        if query.is_empty() {
            return;
        }
        self.recent_searches.record(&query, now_epoch_ms());
        self.store.save_recent_searches(&self.recent_searches);

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.latest_search_request = Some(request_id);
        let metadata = Arc::clone(&self.metadata);
        let bus_producer = self.bus_producer.clone();
        thread::spawn(move || {
            let result = metadata.search(&query, max_results);
            let _ = bus_producer.send(Message::Metadata(MetadataMessage::SearchCompleted {
                request_id,
                query,
                result,
            }));
        });
        self.publish_snapshot();
    }

    fn apply_search(
        &mut self,
        request_id: u64,
        query: String,
        result: Result<Vec<CandidateResult>, MetadataError>,
    ) {
        if self.latest_search_request != Some(request_id) {
            debug!("SessionManager: dropping results of superseded search {:?}", query);
            return;
        }
        self.latest_search_request = None;
        let message = match result {
            Ok(results) => SessionMessage::SearchResults { query, results },
            Err(error) => {
                warn!("SessionManager: search {:?} failed: {}", query, error);
                SessionMessage::SearchFailed { query, error }
            }
        };
        let _ = self.bus_producer.send(Message::Session(message));
    }

    fn current_track_id(&self) -> Option<&str> {
        self.current_track.as_ref().map(|track| track.id.as_str())
    }

    fn build_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: PlaySessionState {
                current_track: self.current_track.clone(),
                player_state: self.player_state,
                volume: self.volume,
                position_seconds: self.position_seconds,
                duration_seconds: self.duration_seconds,
                queue: self.queue.to_vec(),
                last_error: self.last_error.clone(),
            },
            settings: self.settings,
            history: self.history.items().to_vec(),
            liked_tracks: self.liked.tracks().to_vec(),
            recent_searches: self.recent_searches.entries().to_vec(),
            continuation_pending: self.continuation_request.is_some(),
            player_ready: self.player_ready,
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = self.build_snapshot();
        match self.snapshot.lock() {
            Ok(mut shared) => *shared = snapshot.clone(),
            Err(e) => error!("SessionManager: snapshot lock poisoned: {}", e),
        }
        let _ = self
            .bus_producer
            .send(Message::Session(SessionMessage::SnapshotUpdated(Box::new(
                snapshot,
            ))));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{CandidateKind, Thumbnails};
    use crate::session_store::{LIKED_TRACKS_KEY, SETTINGS_KEY};
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Instant;
    use tokio::sync::broadcast::{self, error::TryRecvError};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum PlayerCall {
        Load(String),
        Play,
        Pause,
        Seek(u32),
        SetVolume(u8),
        Prebuffer(String),
    }

    #[derive(Default)]
    struct FakePlayer {
        calls: Mutex<Vec<PlayerCall>>,
        sink: Mutex<Option<PlayerEventSink>>,
        position: Mutex<Option<u32>>,
    }

    impl FakePlayer {
        fn record(&self, call: PlayerCall) {
            self.calls.lock().expect("calls lock").push(call);
        }

        fn calls(&self) -> Vec<PlayerCall> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn clear_calls(&self) {
            self.calls.lock().expect("calls lock").clear();
        }

        fn set_position(&self, seconds: u32) {
            *self.position.lock().expect("position lock") = Some(seconds);
        }

        fn emit(&self, event: PlayerEvent) {
            self.sink
                .lock()
                .expect("sink lock")
                .as_ref()
                .expect("session subscribed to player events")
                .emit(event);
        }
    }

    impl MediaPlayerAdapter for FakePlayer {
        fn subscribe(&self, sink: PlayerEventSink) {
            *self.sink.lock().expect("sink lock") = Some(sink);
        }

        fn load(&self, track_id: &str) {
            self.record(PlayerCall::Load(track_id.to_string()));
        }

        fn play(&self) {
            self.record(PlayerCall::Play);
        }

        fn pause(&self) {
            self.record(PlayerCall::Pause);
        }

        fn seek(&self, seconds: u32) {
            self.record(PlayerCall::Seek(seconds));
        }

        fn set_volume(&self, volume: u8) {
            self.record(PlayerCall::SetVolume(volume));
        }

        fn position_seconds(&self) -> Option<u32> {
            *self.position.lock().expect("position lock")
        }

        fn prebuffer(&self, track_id: &str) {
            self.record(PlayerCall::Prebuffer(track_id.to_string()));
        }
    }

    #[derive(Default)]
    struct FakeMetadata {
        // id -> (details, resolve delay)
        details: HashMap<String, (Track, Duration)>,
        search_results: Vec<String>,
        search_delay: Duration,
        searches: Mutex<Vec<String>>,
    }

    impl FakeMetadata {
        fn with_track(mut self, id: &str, duration_seconds: u32, delay_ms: u64) -> Self {
            self.details.insert(
                id.to_string(),
                (
                    Track::new(id, format!("Resolved {id}"), "Resolver")
                        .with_duration(duration_seconds),
                    Duration::from_millis(delay_ms),
                ),
            );
            self
        }

        fn with_search_results(mut self, ids: &[&str]) -> Self {
            self.search_results = ids.iter().map(|id| id.to_string()).collect();
            self
        }

        fn searches(&self) -> Vec<String> {
            self.searches.lock().expect("searches lock").clone()
        }
    }

    impl MetadataService for FakeMetadata {
        fn resolve(&self, track_id: &str) -> Result<Track, MetadataError> {
            match self.details.get(track_id) {
                Some((track, delay)) => {
                    thread::sleep(*delay);
                    Ok(track.clone())
                }
                None => Err(MetadataError::NotFound(track_id.to_string())),
            }
        }

        fn search(
            &self,
            query: &str,
            max_results: usize,
        ) -> Result<Vec<CandidateResult>, MetadataError> {
            self.searches
                .lock()
                .expect("searches lock")
                .push(query.to_string());
            thread::sleep(self.search_delay);
            Ok(self
                .search_results
                .iter()
                .take(max_results)
                .map(|id| CandidateResult {
                    kind: CandidateKind::Track,
                    id: id.clone(),
                    title: format!("Song {id}"),
                    author: "Radio Artist".to_string(),
                    thumbnails: Thumbnails::default(),
                })
                .collect())
        }
    }

    struct SessionHarness {
        bus_sender: Sender<Message>,
        receiver: Receiver<Message>,
        player: Arc<FakePlayer>,
        metadata: Arc<FakeMetadata>,
        store: MemoryStore,
        snapshot: SnapshotHandle,
    }

    impl SessionHarness {
        fn new() -> Self {
            Self::with(FakeMetadata::default(), MemoryStore::new(), test_config())
        }

        fn with(metadata: FakeMetadata, store: MemoryStore, config: SessionConfig) -> Self {
            let (bus_sender, _) = broadcast::channel(4096);
            let manager_bus_sender = bus_sender.clone();
            let manager_receiver = bus_sender.subscribe();
            let mut receiver = bus_sender.subscribe();
            let player = Arc::new(FakePlayer::default());
            let metadata = Arc::new(metadata);
            let snapshot: SnapshotHandle = Arc::new(Mutex::new(SessionSnapshot::new(
                config.playback.default_volume,
            )));

            let services = SessionServices {
                player: player.clone(),
                metadata: metadata.clone(),
                store: Box::new(store.clone()),
            };
            let manager_snapshot = Arc::clone(&snapshot);
            thread::spawn(move || {
                let mut manager = SessionManager::new(
                    manager_receiver,
                    manager_bus_sender,
                    services,
                    config,
                    manager_snapshot,
                );
                manager.run();
            });

            let _ = wait_for_snapshot(&mut receiver, |_| true);
            Self {
                bus_sender,
                receiver,
                player,
                metadata,
                store,
                snapshot,
            }
        }

        /// A session whose player has already reported ready.
        fn ready() -> Self {
            let mut harness = Self::new();
            harness.make_ready();
            harness
        }

        fn make_ready(&mut self) {
            self.player.emit(PlayerEvent::Ready);
            let _ = wait_for_snapshot(&mut self.receiver, |snapshot| snapshot.player_ready);
        }

        fn send(&self, message: SessionMessage) {
            self.bus_sender
                .send(Message::Session(message))
                .expect("failed to send message to bus");
        }

        fn player_state(&self, state: AdapterState, track_id: &str) {
            self.player.emit(PlayerEvent::StateChanged {
                state,
                track_id: Some(track_id.to_string()),
            });
        }

        fn untagged_player_state(&self, state: AdapterState) {
            self.player
                .emit(PlayerEvent::StateChanged { state, track_id: None });
        }

        fn wait_for<F>(&mut self, predicate: F) -> SessionSnapshot
        where
            F: FnMut(&SessionSnapshot) -> bool,
        {
            wait_for_snapshot(&mut self.receiver, predicate)
        }

        /// Plays `track` and waits until the player reports it playing.
        fn start_playing(&mut self, track: Track) {
            let id = track.id.clone();
            self.send(SessionMessage::PlayTrack(track));
            let _ = self.wait_for(|snapshot| {
                snapshot.state.current_track_id() == Some(id.as_str())
                    && snapshot.state.player_state == PlayerState::Loading
            });
            self.player_state(AdapterState::Playing, &id);
            let _ = self.wait_for(|snapshot| {
                snapshot.state.current_track_id() == Some(id.as_str())
                    && snapshot.state.player_state == PlayerState::Playing
            });
        }

        fn drain_messages(&mut self) {
            loop {
                match self.receiver.try_recv() {
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Closed) => break,
                }
            }
        }
    }

    impl Drop for SessionHarness {
        fn drop(&mut self) {
            let _ = self
                .bus_sender
                .send(Message::Session(SessionMessage::Shutdown));
        }
    }

    fn test_config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.playback.position_poll_interval_ms = 20;
        config
    }

    fn track(id: &str) -> Track {
        Track::new(id, format!("Song {id}"), format!("Artist {id}"))
    }

    fn ids(tracks: &[Track]) -> Vec<&str> {
        tracks.iter().map(|track| track.id.as_str()).collect()
    }

    fn wait_for_message<F>(
        receiver: &mut Receiver<Message>,
        timeout: Duration,
        mut predicate: F,
    ) -> Message
    where
        F: FnMut(&Message) -> bool,
    {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                panic!("timed out waiting for expected message");
            }
            match receiver.try_recv() {
                Ok(message) => {
                    if predicate(&message) {
                        return message;
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => panic!("bus closed while waiting for message"),
            }
        }
    }

    fn assert_no_message<F>(receiver: &mut Receiver<Message>, timeout: Duration, mut predicate: F)
    where
        F: FnMut(&Message) -> bool,
    {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                return;
            }
            match receiver.try_recv() {
                Ok(message) => {
                    if predicate(&message) {
                        panic!("received unexpected message: {:?}", message);
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Closed) => return,
            }
        }
    }

    fn wait_for_snapshot<F>(receiver: &mut Receiver<Message>, mut predicate: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let message = wait_for_message(receiver, Duration::from_secs(2), |message| match message {
            Message::Session(SessionMessage::SnapshotUpdated(snapshot)) => predicate(snapshot),
            _ => false,
        });
        match message {
            Message::Session(SessionMessage::SnapshotUpdated(snapshot)) => *snapshot,
            _ => panic!("expected SnapshotUpdated message"),
        }
    }

    fn is_snapshot_where<F>(message: &Message, mut predicate: F) -> bool
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        matches!(message, Message::Session(SessionMessage::SnapshotUpdated(snapshot)) if predicate(snapshot))
    }

    #[test]
    fn test_play_track_resolves_unknown_duration() {
        let mut harness =
            SessionHarness::with(FakeMetadata::default().with_track("A", 240, 0), MemoryStore::new(), test_config());
        harness.make_ready();

        harness.send(SessionMessage::PlayTrack(track("A")));

        let snapshot = harness.wait_for(|snapshot| snapshot.state.duration_seconds == 240);
        let current = snapshot.state.current_track.expect("current track");
        assert_eq!(current.id, "A");
        assert_eq!(current.duration_seconds, 240);
        assert_eq!(current.title, "Song A");
        assert_eq!(snapshot.state.player_state, PlayerState::Loading);
        assert!(harness
            .player
            .calls()
            .ends_with(&[PlayerCall::SetVolume(70), PlayerCall::Load("A".into()), PlayerCall::Play]));

        harness.player_state(AdapterState::Playing, "A");
        let _ = harness.wait_for(|snapshot| snapshot.state.player_state == PlayerState::Playing);
    }

    #[test]
    fn test_superseded_resolution_is_never_applied() {
        let metadata = FakeMetadata::default()
            .with_track("A", 111, 300)
            .with_track("B", 222, 0);
        let mut harness = SessionHarness::with(metadata, MemoryStore::new(), test_config());
        harness.make_ready();

        harness.send(SessionMessage::PlayTrack(track("A")));
        harness.send(SessionMessage::PlayTrack(track("B")));

        let _ = harness.wait_for(|snapshot| {
            snapshot.state.current_track_id() == Some("B") && snapshot.state.duration_seconds == 222
        });
        assert_no_message(&mut harness.receiver, Duration::from_millis(500), |message| {
            is_snapshot_where(message, |snapshot| {
                snapshot.state.current_track_id() == Some("A")
                    || snapshot.state.duration_seconds == 111
            })
        });
        let shared = harness.snapshot.lock().expect("snapshot lock").clone();
        assert_eq!(shared.state.current_track_id(), Some("B"));
        assert_eq!(shared.state.duration_seconds, 222);
    }

    #[test]
    fn test_failed_resolution_keeps_zero_duration_placeholder() {
        let mut harness = SessionHarness::ready();

        harness.send(SessionMessage::PlayTrack(track("missing")));

        let snapshot =
            harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("missing"));
        assert_eq!(snapshot.state.duration_seconds, 0);
        assert_eq!(snapshot.state.last_error, None);
        assert!(harness.player.calls().contains(&PlayerCall::Load("missing".into())));
    }

    #[test]
    fn test_replaying_a_track_keeps_one_history_entry_at_front() {
        let mut harness = SessionHarness::ready();

        for id in ["A", "B", "A"] {
            harness.send(SessionMessage::PlayTrack(track(id).with_duration(100)));
        }

        let snapshot = harness.wait_for(|snapshot| {
            snapshot.state.current_track_id() == Some("A") && snapshot.history.len() == 2
        });
        let history: Vec<_> = snapshot.history.iter().map(|item| item.track_id.as_str()).collect();
        assert_eq!(history, vec!["A", "B"]);
        assert!(snapshot.history[0].played_at_epoch_ms >= snapshot.history[1].played_at_epoch_ms);
    }

    #[test]
    fn test_set_volume_clamps_to_range() {
        let mut harness = SessionHarness::ready();

        harness.send(SessionMessage::SetVolume(150));
        let snapshot = harness.wait_for(|snapshot| snapshot.state.volume == 100);
        assert_eq!(snapshot.state.volume, 100);

        harness.send(SessionMessage::SetVolume(-5));
        let _ = harness.wait_for(|snapshot| snapshot.state.volume == 0);

        let stored = harness.store.get("volume").expect("get").expect("volume saved");
        assert_eq!(stored["data"]["volume"], 0);
    }

    #[test]
    fn test_volume_reaches_player_only_with_a_loaded_track() {
        let mut harness = SessionHarness::new();

        harness.send(SessionMessage::SetVolume(30));
        let _ = harness.wait_for(|snapshot| snapshot.state.volume == 30);
        assert!(harness.player.calls().is_empty());

        harness.make_ready();
        harness.player.clear_calls();
        harness.send(SessionMessage::PlayTrack(track("A").with_duration(100)));
        let _ = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("A"));
        assert_eq!(
            harness.player.calls(),
            vec![
                PlayerCall::SetVolume(30),
                PlayerCall::Load("A".into()),
                PlayerCall::Play
            ]
        );

        harness.send(SessionMessage::SetVolume(45));
        let _ = harness.wait_for(|snapshot| snapshot.state.volume == 45);
        assert_eq!(harness.player.calls().last(), Some(&PlayerCall::SetVolume(45)));
    }

    #[test]
    fn test_track_chosen_before_player_ready_loads_once_ready() {
        let mut harness = SessionHarness::new();

        harness.send(SessionMessage::PlayTrack(track("A").with_duration(100)));
        let _ = harness.wait_for(|snapshot| snapshot.state.player_state == PlayerState::Loading);
        harness.send(SessionMessage::TogglePlay);
        harness.send(SessionMessage::SeekTo(30));
        thread::sleep(Duration::from_millis(50));
        assert!(harness.player.calls().is_empty());

        harness.player.emit(PlayerEvent::Ready);
        let snapshot = harness.wait_for(|snapshot| snapshot.player_ready);
        assert_eq!(snapshot.state.player_state, PlayerState::Ready);
        assert_eq!(
            harness.player.calls(),
            vec![
                PlayerCall::SetVolume(70),
                PlayerCall::Load("A".into()),
                PlayerCall::Play
            ]
        );
    }

    #[test]
    fn test_adapter_init_failure_halts_playback() {
        let mut harness = SessionHarness::new();
        harness.send(SessionMessage::PlayTrack(track("A").with_duration(100)));
        let _ = harness.wait_for(|snapshot| snapshot.state.player_state == PlayerState::Loading);

        harness
            .player
            .emit(PlayerEvent::InitFailed("iframe blocked".to_string()));

        let snapshot = harness.wait_for(|snapshot| snapshot.state.player_state == PlayerState::Error);
        assert_eq!(
            snapshot.state.last_error,
            Some(SessionError::AdapterInitFailure("iframe blocked".to_string()))
        );
        assert!(harness.player.calls().is_empty());
    }

    #[test]
    fn test_embedding_error_without_fallback_goes_idle() {
        let mut harness = SessionHarness::ready();
        harness.start_playing(track("A").with_duration(100));

        harness.player.emit(PlayerEvent::Error {
            code: 101,
            track_id: Some("A".to_string()),
        });

        let snapshot = harness.wait_for(|snapshot| snapshot.state.player_state == PlayerState::Idle);
        assert_eq!(
            snapshot.state.last_error,
            Some(SessionError::Playback(PlaybackErrorKind::EmbeddingDisallowed))
        );
        assert_eq!(snapshot.state.position_seconds, 0);
        assert!(!snapshot.continuation_pending);
        thread::sleep(Duration::from_millis(50));
        assert!(harness.metadata.searches().is_empty());
    }

    #[test]
    fn test_end_of_track_plays_next_queued_track() {
        let mut harness = SessionHarness::ready();
        harness.send(SessionMessage::AddToQueue(track("B").with_duration(100)));
        harness.send(SessionMessage::AddToQueue(track("C").with_duration(100)));
        harness.start_playing(track("A").with_duration(100));

        harness.player_state(AdapterState::Ended, "A");

        let snapshot = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("B"));
        assert_eq!(ids(&snapshot.state.queue), vec!["C"]);
        assert_eq!(snapshot.state.player_state, PlayerState::Loading);
    }

    #[test]
    fn test_playback_error_recovers_with_queued_track() {
        let mut harness = SessionHarness::ready();
        harness.send(SessionMessage::AddToQueue(track("B").with_duration(100)));
        harness.start_playing(track("A").with_duration(100));

        harness.player.emit(PlayerEvent::Error {
            code: 150,
            track_id: Some("A".to_string()),
        });

        let snapshot = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("B"));
        assert_eq!(snapshot.state.last_error, None);
        assert!(snapshot.state.queue.is_empty());
    }

    #[test]
    fn test_end_of_track_with_shuffle_plays_continuation() {
        let metadata = FakeMetadata::default()
            .with_search_results(&["N1", "N2", "N3"])
            .with_track("N1", 180, 0);
        let mut harness = SessionHarness::with(metadata, MemoryStore::new(), test_config());
        harness.make_ready();
        harness.send(SessionMessage::ToggleShuffleMode);
        harness.start_playing(track("A").with_duration(100));

        harness.player_state(AdapterState::Ended, "A");

        let snapshot = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("N1"));
        assert_eq!(ids(&snapshot.state.queue), vec!["N2", "N3"]);
        assert_eq!(snapshot.state.duration_seconds, 180);
        assert!(!snapshot.continuation_pending);
        assert_eq!(harness.metadata.searches().len(), 2);
    }

    #[test]
    fn test_continuation_is_single_flight() {
        let mut metadata = FakeMetadata::default().with_search_results(&["N1", "N2"]);
        metadata.search_delay = Duration::from_millis(200);
        let mut harness = SessionHarness::with(metadata, MemoryStore::new(), test_config());
        harness.make_ready();
        harness.send(SessionMessage::ToggleShuffleMode);
        harness.start_playing(track("A").with_duration(100));

        harness.player_state(AdapterState::Ended, "A");
        let _ = harness.wait_for(|snapshot| snapshot.continuation_pending);
        harness.send(SessionMessage::NextTrack);
        harness.player.emit(PlayerEvent::Error {
            code: 5,
            track_id: Some("A".to_string()),
        });

        let snapshot = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("N1"));
        assert_eq!(ids(&snapshot.state.queue), vec!["N2"]);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(harness.metadata.searches().len(), 2);
    }

    #[test]
    fn test_exhausted_continuation_suggests_disabling_prevent_repeat() {
        let mut harness = SessionHarness::ready();
        harness.send(SessionMessage::ToggleShuffleMode);
        harness.send(SessionMessage::TogglePreventRepeat);
        harness.start_playing(track("A").with_duration(100));

        harness.player_state(AdapterState::Ended, "A");

        let snapshot = harness.wait_for(|snapshot| {
            snapshot.state.player_state == PlayerState::Idle && snapshot.state.last_error.is_some()
        });
        assert_eq!(
            snapshot.state.last_error,
            Some(SessionError::ContinuationExhausted {
                prevent_repeat: true
            })
        );
        assert_eq!(snapshot.state.current_track_id(), Some("A"));
    }

    #[test]
    fn test_continuation_result_for_replaced_track_is_dropped() {
        let mut metadata = FakeMetadata::default().with_search_results(&["N1"]);
        metadata.search_delay = Duration::from_millis(150);
        let mut harness = SessionHarness::with(metadata, MemoryStore::new(), test_config());
        harness.make_ready();
        harness.send(SessionMessage::ToggleShuffleMode);
        harness.start_playing(track("A").with_duration(100));

        harness.player_state(AdapterState::Ended, "A");
        let _ = harness.wait_for(|snapshot| snapshot.continuation_pending);
        harness.send(SessionMessage::PlayTrack(track("Z").with_duration(100)));
        let _ = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("Z"));

        assert_no_message(&mut harness.receiver, Duration::from_millis(400), |message| {
            is_snapshot_where(message, |snapshot| snapshot.state.current_track_id() == Some("N1"))
        });
    }

    #[test]
    fn test_next_with_empty_queue_and_shuffle_off_does_nothing() {
        let mut harness = SessionHarness::ready();
        harness.start_playing(track("A").with_duration(100));
        harness.drain_messages();

        harness.send(SessionMessage::NextTrack);

        assert_no_message(&mut harness.receiver, Duration::from_millis(100), |message| {
            matches!(message, Message::Session(SessionMessage::SnapshotUpdated(_)))
        });
        assert!(harness.metadata.searches().is_empty());
    }

    #[test]
    fn test_next_plays_front_of_queue() {
        let mut harness = SessionHarness::ready();
        harness.start_playing(track("A").with_duration(100));
        harness.send(SessionMessage::AddToQueue(track("B").with_duration(100)));

        harness.send(SessionMessage::NextTrack);

        let snapshot = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("B"));
        assert!(snapshot.state.queue.is_empty());
    }

    #[test]
    fn test_play_collection_rotates_to_start_index() {
        let mut harness = SessionHarness::ready();

        harness.send(SessionMessage::PlayCollection {
            tracks: vec![track("S1"), track("S2"), track("S3")],
            start_index: 1,
        });

        let snapshot = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("S2"));
        assert_eq!(ids(&snapshot.state.queue), vec!["S3", "S1"]);
    }

    #[test]
    fn test_shuffle_collection_plays_every_track_once() {
        let mut harness = SessionHarness::ready();

        harness.send(SessionMessage::ShuffleCollection(vec![
            track("S1"),
            track("S2"),
            track("S3"),
        ]));

        let snapshot = harness.wait_for(|snapshot| snapshot.state.current_track.is_some());
        let mut all = ids(&snapshot.state.queue);
        all.extend(snapshot.state.current_track_id());
        all.sort();
        assert_eq!(all, vec!["S1", "S2", "S3"]);
    }

    #[test]
    fn test_toggle_play_is_noop_when_idle_and_waits_for_player_confirmation() {
        let mut harness = SessionHarness::ready();
        harness.send(SessionMessage::TogglePlay);
        thread::sleep(Duration::from_millis(50));
        assert!(harness.player.calls().is_empty());

        harness.start_playing(track("A").with_duration(100));
        harness.player.clear_calls();
        harness.drain_messages();

        harness.send(SessionMessage::TogglePlay);
        assert_no_message(&mut harness.receiver, Duration::from_millis(100), |message| {
            is_snapshot_where(message, |snapshot| {
                snapshot.state.player_state == PlayerState::Paused
            })
        });
        assert_eq!(harness.player.calls(), vec![PlayerCall::Pause]);

        harness.player_state(AdapterState::Paused, "A");
        let _ = harness.wait_for(|snapshot| snapshot.state.player_state == PlayerState::Paused);

        harness.send(SessionMessage::TogglePlay);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            harness.player.calls(),
            vec![PlayerCall::Pause, PlayerCall::Play]
        );
    }

    #[test]
    fn test_events_for_previous_track_are_discarded() {
        let mut harness = SessionHarness::ready();
        harness.start_playing(track("A").with_duration(100));
        harness.send(SessionMessage::PlayTrack(track("B").with_duration(100)));
        let _ = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("B"));

        harness.player_state(AdapterState::Ended, "A");
        harness.player.emit(PlayerEvent::Error {
            code: 100,
            track_id: Some("A".to_string()),
        });

        assert_no_message(&mut harness.receiver, Duration::from_millis(150), |message| {
            matches!(message, Message::Session(SessionMessage::SnapshotUpdated(_)))
        });
        let shared = harness.snapshot.lock().expect("snapshot lock").clone();
        assert_eq!(shared.state.current_track_id(), Some("B"));
        assert_eq!(shared.state.player_state, PlayerState::Loading);
    }

    #[test]
    fn test_position_is_polled_only_while_playing() {
        let mut harness = SessionHarness::ready();
        harness.player.set_position(42);
        harness.start_playing(track("A").with_duration(100));

        let _ = harness.wait_for(|snapshot| snapshot.state.position_seconds == 42);

        harness.player_state(AdapterState::Buffering, "A");
        let _ = harness.wait_for(|snapshot| snapshot.state.player_state == PlayerState::Buffering);
        harness.player.set_position(99);
        assert_no_message(&mut harness.receiver, Duration::from_millis(150), |message| {
            is_snapshot_where(message, |snapshot| snapshot.state.position_seconds == 99)
        });

        harness.player_state(AdapterState::Playing, "A");
        let _ = harness.wait_for(|snapshot| snapshot.state.position_seconds == 99);
    }

    #[test]
    fn test_prev_restarts_current_track() {
        let mut harness = SessionHarness::ready();
        harness.start_playing(track("A").with_duration(100));
        harness.send(SessionMessage::SeekTo(250));
        let _ = harness.wait_for(|snapshot| snapshot.state.position_seconds == 100);

        harness.send(SessionMessage::PrevTrack);

        let snapshot = harness.wait_for(|snapshot| snapshot.state.position_seconds == 0);
        assert_eq!(snapshot.state.current_track_id(), Some("A"));
        assert!(harness.player.calls().ends_with(&[PlayerCall::Seek(100), PlayerCall::Seek(0)]));
    }

    #[test]
    fn test_toggle_like_twice_restores_membership_and_persists() {
        let mut harness = SessionHarness::ready();
        let liked = track("L");

        harness.send(SessionMessage::ToggleLike(liked.clone()));
        let snapshot = harness.wait_for(|snapshot| snapshot.is_liked("L"));
        assert_eq!(snapshot.liked_tracks.len(), 1);

        harness.send(SessionMessage::ToggleLike(liked));
        let _ = harness.wait_for(|snapshot| !snapshot.is_liked("L"));

        let stored = harness
            .store
            .get(LIKED_TRACKS_KEY)
            .expect("get")
            .expect("likes saved");
        assert_eq!(stored, json!({"version": 1, "data": []}));
    }

    #[test]
    fn test_settings_persist_across_sessions() {
        let store = MemoryStore::new();
        {
            let mut harness =
                SessionHarness::with(FakeMetadata::default(), store.clone(), test_config());
            harness.send(SessionMessage::ToggleShuffleMode);
            harness.send(SessionMessage::TogglePreventRepeat);
            let _ = harness.wait_for(|snapshot| {
                snapshot.settings.shuffle_enabled && snapshot.settings.prevent_repeat_enabled
            });
        }
        let stored = store.get(SETTINGS_KEY).expect("get").expect("settings saved");
        assert_eq!(
            stored["data"],
            json!({"shuffleEnabled": true, "preventRepeatEnabled": true})
        );

        let harness = SessionHarness::with(FakeMetadata::default(), store, test_config());
        let restored = harness.snapshot.lock().expect("snapshot lock").clone();
        assert!(restored.settings.shuffle_enabled);
        assert!(restored.settings.prevent_repeat_enabled);
    }

    #[test]
    fn test_mute_toggle_restores_previous_volume() {
        let mut harness = SessionHarness::ready();
        harness.send(SessionMessage::SetVolume(40));
        let _ = harness.wait_for(|snapshot| snapshot.state.volume == 40);

        harness.send(SessionMessage::ToggleMute);
        let _ = harness.wait_for(|snapshot| snapshot.state.volume == 0);
        harness.send(SessionMessage::ToggleMute);
        let _ = harness.wait_for(|snapshot| snapshot.state.volume == 40);

        harness.send(SessionMessage::SetVolume(0));
        let _ = harness.wait_for(|snapshot| snapshot.state.volume == 0);
        harness.send(SessionMessage::ToggleMute);
        let _ = harness.wait_for(|snapshot| snapshot.state.volume == 70);
    }

    #[test]
    fn test_search_records_query_and_publishes_results() {
        let metadata = FakeMetadata::default().with_search_results(&["R1", "R2"]);
        let mut harness = SessionHarness::with(metadata, MemoryStore::new(), test_config());

        harness.send(SessionMessage::Search {
            query: " kesariya ".to_string(),
            max_results: 10,
        });

        let message = wait_for_message(&mut harness.receiver, Duration::from_secs(2), |message| {
            matches!(message, Message::Session(SessionMessage::SearchResults { .. }))
        });
        match message {
            Message::Session(SessionMessage::SearchResults { query, results }) => {
                assert_eq!(query, "kesariya");
                assert_eq!(results.len(), 2);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        let shared = harness.snapshot.lock().expect("snapshot lock").clone();
        assert_eq!(shared.recent_searches[0].query, "kesariya");

        harness.send(SessionMessage::ClearSearchHistory);
        let _ = harness.wait_for(|snapshot| snapshot.recent_searches.is_empty());
    }

    fn prebuffered(calls: &[PlayerCall]) -> Vec<&str> {
        calls
            .iter()
            .filter_map(|call| match call {
                PlayerCall::Prebuffer(id) => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_late_untagged_end_does_not_skip_track_still_loading() {
        let mut harness = SessionHarness::ready();
        harness.send(SessionMessage::AddToQueue(track("C").with_duration(100)));
        harness.start_playing(track("A").with_duration(100));
        harness.send(SessionMessage::PlayTrack(track("B").with_duration(100)));
        let _ = harness.wait_for(|snapshot| {
            snapshot.state.current_track_id() == Some("B")
                && snapshot.state.player_state == PlayerState::Loading
        });

        harness.untagged_player_state(AdapterState::Ended);
        harness.untagged_player_state(AdapterState::Playing);

        assert_no_message(&mut harness.receiver, Duration::from_millis(150), |message| {
            matches!(message, Message::Session(SessionMessage::SnapshotUpdated(_)))
        });
        let shared = harness.snapshot.lock().expect("snapshot lock").clone();
        assert_eq!(shared.state.current_track_id(), Some("B"));
        assert_eq!(shared.state.player_state, PlayerState::Loading);
        assert_eq!(ids(&shared.state.queue), vec!["C"]);
    }

    #[test]
    fn test_untagged_events_apply_once_player_reports_new_track() {
        let mut harness = SessionHarness::ready();
        harness.send(SessionMessage::AddToQueue(track("C").with_duration(100)));
        harness.send(SessionMessage::PlayTrack(track("B").with_duration(100)));
        let _ = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("B"));

        harness.untagged_player_state(AdapterState::Unstarted);
        harness.untagged_player_state(AdapterState::Playing);
        let _ = harness.wait_for(|snapshot| snapshot.state.player_state == PlayerState::Playing);

        harness.untagged_player_state(AdapterState::Ended);
        let snapshot = harness.wait_for(|snapshot| snapshot.state.current_track_id() == Some("C"));
        assert!(snapshot.state.queue.is_empty());
    }

    #[test]
    fn test_end_while_buffering_before_first_play_is_ignored() {
        let mut harness = SessionHarness::ready();
        harness.send(SessionMessage::AddToQueue(track("C").with_duration(100)));
        harness.send(SessionMessage::PlayTrack(track("B").with_duration(100)));
        harness.player_state(AdapterState::Buffering, "B");
        let _ = harness.wait_for(|snapshot| snapshot.state.player_state == PlayerState::Buffering);

        harness.player_state(AdapterState::Ended, "B");

        assert_no_message(&mut harness.receiver, Duration::from_millis(150), |message| {
            is_snapshot_where(message, |snapshot| {
                snapshot.state.current_track_id() == Some("C")
            })
        });
    }

    #[test]
    fn test_front_of_queue_is_prebuffered() {
        let mut harness = SessionHarness::ready();

        harness.send(SessionMessage::AddToQueue(track("B").with_duration(100)));
        harness.send(SessionMessage::AddToQueue(track("C").with_duration(100)));
        let _ = harness.wait_for(|snapshot| snapshot.state.queue.len() == 2);
        assert_eq!(prebuffered(&harness.player.calls()), vec!["B"]);

        harness.start_playing(track("A").with_duration(100));
        assert_eq!(prebuffered(&harness.player.calls()), vec!["B", "B"]);
        assert!(harness.player.calls().ends_with(&[
            PlayerCall::Load("A".into()),
            PlayerCall::Play,
            PlayerCall::Prebuffer("B".into()),
        ]));

        harness.player_state(AdapterState::Cued, "A");
        harness.send(SessionMessage::ClearQueue);
        let _ = harness.wait_for(|snapshot| snapshot.state.queue.is_empty());
        assert_eq!(prebuffered(&harness.player.calls()), vec!["B", "B", "B"]);
    }

    #[test]
    fn test_nothing_is_prebuffered_before_player_ready() {
        let mut harness = SessionHarness::new();

        harness.send(SessionMessage::AddToQueue(track("B").with_duration(100)));
        let _ = harness.wait_for(|snapshot| snapshot.state.queue.len() == 1);

        assert!(prebuffered(&harness.player.calls()).is_empty());
    }

    #[test]
    fn test_bus_lag_restarts_lost_continuation() {
        let mut metadata = FakeMetadata::default().with_search_results(&["N1"]);
        metadata.search_delay = Duration::from_millis(20);
        let (bus_sender, _) = broadcast::channel(256);
        let player = Arc::new(FakePlayer::default());
        let services = SessionServices {
            player: player.clone(),
            metadata: Arc::new(metadata),
            store: Box::new(MemoryStore::new()),
        };
        let mut manager = SessionManager::new(
            bus_sender.subscribe(),
            bus_sender.clone(),
            services,
            test_config(),
            Arc::new(Mutex::new(SessionSnapshot::new(70))),
        );
        let player_event = |event| Message::Player(PlayerMessage::Event(event));

        manager.handle_message(player_event(PlayerEvent::Ready));
        manager.handle_message(Message::Session(SessionMessage::ToggleShuffleMode));
        manager.handle_message(Message::Session(SessionMessage::PlayTrack(
            track("A").with_duration(100),
        )));
        for state in [AdapterState::Playing, AdapterState::Ended] {
            manager.handle_message(player_event(PlayerEvent::StateChanged {
                state,
                track_id: Some("A".to_string()),
            }));
        }
        let lost = manager.continuation_request.expect("continuation in flight");

        manager.recover_from_lag();

        let retried = manager.continuation_request.expect("continuation restarted");
        assert_ne!(lost, retried);
        let generation = manager.playback_generation;
        manager.handle_message(Message::Metadata(MetadataMessage::ContinuationFound {
            request_id: lost,
            generation,
            tracks: vec![track("Z")],
        }));
        assert_eq!(manager.current_track_id(), Some("A"));
        assert_eq!(manager.continuation_request, Some(retried));

        manager.handle_message(Message::Metadata(MetadataMessage::ContinuationFound {
            request_id: retried,
            generation,
            tracks: vec![track("N1").with_duration(100)],
        }));
        assert_eq!(manager.current_track_id(), Some("N1"));
        assert_eq!(manager.continuation_request, None);
    }

    #[test]
    fn test_bus_lag_unblocks_skip_while_playing() {
        let (bus_sender, _) = broadcast::channel(256);
        let mut metadata = FakeMetadata::default();
        metadata.search_delay = Duration::from_millis(20);
        let services = SessionServices {
            player: Arc::new(FakePlayer::default()),
            metadata: Arc::new(metadata),
            store: Box::new(MemoryStore::new()),
        };
        let mut manager = SessionManager::new(
            bus_sender.subscribe(),
            bus_sender.clone(),
            services,
            test_config(),
            Arc::new(Mutex::new(SessionSnapshot::new(70))),
        );
        manager.handle_message(Message::Session(SessionMessage::ToggleShuffleMode));
        manager.handle_message(Message::Session(SessionMessage::PlayTrack(
            track("A").with_duration(100),
        )));
        manager.handle_message(Message::Session(SessionMessage::NextTrack));
        let lost = manager.continuation_request.expect("continuation in flight");

        manager.recover_from_lag();
        assert_eq!(manager.continuation_request, None);

        manager.handle_message(Message::Session(SessionMessage::NextTrack));
        let next = manager.continuation_request.expect("skip accepted again");
        assert_ne!(lost, next);
    }
}
