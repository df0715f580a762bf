use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::trace;
use tokio::sync::broadcast::Sender;

use crate::protocol::{Message, SessionMessage};

/// Posts `PollPosition` ticks onto the bus while a track is playing.
///
/// Each run is tied to one playback generation and owns its own stop flag, so
/// stopping (or starting a new run) silences the old ticker even if its
/// thread has not woken up yet.
pub struct PositionPoller {
    interval: Duration,
    bus_producer: Sender<Message>,
    active: Option<(u64, Arc<AtomicBool>)>,
}

impl PositionPoller {
    pub fn new(interval: Duration, bus_producer: Sender<Message>) -> Self {
        Self {
            interval,
            bus_producer,
            active: None,
        }
    }

    /// Starts ticking for `generation`. A run for the same generation keeps going.
    pub fn start(&mut self, generation: u64) {
        if matches!(self.active, Some((running, _)) if running == generation) {
            return;
        }
        self.stop();

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let interval = self.interval;
        let bus_producer = self.bus_producer.clone();
        thread::spawn(move || loop {
            thread::sleep(interval);
            if !thread_running.load(Ordering::Acquire) {
                trace!("PositionPoller: generation {} stopped", generation);
                break;
            }
            let tick = Message::Session(SessionMessage::PollPosition { generation });
            if bus_producer.send(tick).is_err() {
                break;
            }
        });
        self.active = Some((generation, running));
    }

    pub fn stop(&mut self) {
        if let Some((_, running)) = self.active.take() {
            running.store(false, Ordering::Release);
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for PositionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
