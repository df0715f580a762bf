//! Wiring for a running session: the bus, the manager thread and a small
//! command surface for front ends.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{error, info, warn};
use tokio::sync::broadcast::{self, Receiver, Sender};

use crate::config::SessionConfig;
use crate::db_manager::DbManager;
use crate::protocol::{Message, SessionMessage, SessionSnapshot};
use crate::session_manager::{SessionManager, SessionServices, SnapshotHandle};
use crate::store::{MemoryStore, PersistentStore};
use crate::track::Track;

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "non-string panic payload".to_string()
}

/// Opens the SQLite store at the configured location. Falls back to an
/// in-memory store when no location is known or the database cannot be
/// opened, so the session still runs without persistence.
pub fn open_default_store(config: &SessionConfig) -> Box<dyn PersistentStore> {
    let Some(path) = config.database_path() else {
        warn!("No data directory available, session state will not persist");
        return Box::new(MemoryStore::new());
    };
    match DbManager::new(&path) {
        Ok(db_manager) => {
            info!("Session state stored at {}", path.display());
            Box::new(db_manager)
        }
        Err(e) => {
            error!("Failed to open {}: {}. Session state will not persist", path.display(), e);
            Box::new(MemoryStore::new())
        }
    }
}

/// A session running on its own thread.
pub struct SessionRuntime {
    bus_sender: Sender<Message>,
    snapshot: SnapshotHandle,
    manager_thread: Option<JoinHandle<()>>,
}

impl SessionRuntime {
    pub fn start(config: SessionConfig, services: SessionServices) -> Self {
        let (bus_sender, _) = broadcast::channel(config.bus.capacity.max(16));
        let snapshot: SnapshotHandle = Arc::new(Mutex::new(SessionSnapshot::new(
            config.playback.default_volume,
        )));

        let session_bus_receiver = bus_sender.subscribe();
        let session_bus_sender = bus_sender.clone();
        let session_snapshot = Arc::clone(&snapshot);
        let manager_thread = thread::spawn(move || {
            let run_result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let mut session_manager = SessionManager::new(
                    session_bus_receiver,
                    session_bus_sender,
                    services,
                    config,
                    session_snapshot,
                );
                session_manager.run();
            }));
            if let Err(payload) = run_result {
                error!(
                    "SessionManager thread terminated due to panic: {}",
                    panic_payload_to_string(payload.as_ref())
                );
            }
        });

        Self {
            bus_sender,
            snapshot,
            manager_thread: Some(manager_thread),
        }
    }

    pub fn send(&self, message: SessionMessage) {
        if self.bus_sender.send(Message::Session(message)).is_err() {
            warn!("SessionRuntime: no session listening, command dropped");
        }
    }

    /// Receives every bus message published from now on, including
    /// `SnapshotUpdated` and search notifications.
    pub fn subscribe(&self) -> Receiver<Message> {
        self.bus_sender.subscribe()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        match self.snapshot.lock() {
            Ok(snapshot) => snapshot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn play_track(&self, track: Track) {
        self.send(SessionMessage::PlayTrack(track));
    }

    pub fn toggle_play(&self) {
        self.send(SessionMessage::TogglePlay);
    }

    pub fn next_track(&self) {
        self.send(SessionMessage::NextTrack);
    }

    pub fn prev_track(&self) {
        self.send(SessionMessage::PrevTrack);
    }

    pub fn seek_to(&self, seconds: u32) {
        self.send(SessionMessage::SeekTo(seconds));
    }

    pub fn set_volume(&self, volume: i32) {
        self.send(SessionMessage::SetVolume(volume));
    }

    pub fn add_to_queue(&self, track: Track) {
        self.send(SessionMessage::AddToQueue(track));
    }

    pub fn play_collection(&self, tracks: Vec<Track>, start_index: usize) {
        self.send(SessionMessage::PlayCollection {
            tracks,
            start_index,
        });
    }

    pub fn search(&self, query: impl Into<String>, max_results: usize) {
        self.send(SessionMessage::Search {
            query: query.into(),
            max_results,
        });
    }

    /// Stops the session and waits for its thread to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.manager_thread.take() else {
            return;
        };
        let _ = self
            .bus_sender
            .send(Message::Session(SessionMessage::Shutdown));
        if handle.join().is_err() {
            error!("SessionRuntime: session thread panicked during shutdown");
        }
    }
}

impl Drop for SessionRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}
