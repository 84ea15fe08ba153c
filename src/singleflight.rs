use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tokio::sync::watch;

type InflightMap<T> = Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>;

/// Deduplicates concurrent operations on the same key: the first caller
/// becomes the leader and performs the work; everyone else follows and
/// receives the leader's published outcome. Keys are released as soon as the
/// leader completes (or is dropped), so failures are never cached: the next
/// caller starts a fresh flight.
#[derive(Debug)]
pub struct SingleFlight<T: Clone> {
    inflight: InflightMap<T>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[derive(Debug)]
pub enum Flight<T: Clone> {
    Leader(FlightLeader<T>),
    Follower(watch::Receiver<Option<T>>),
}

#[derive(Debug)]
pub struct FlightLeader<T: Clone> {
    key: String,
    tx: watch::Sender<Option<T>>,
    inflight: InflightMap<T>,
    done: bool,
}

/// The leader was dropped (cancelled) before publishing an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderAborted;

impl<T: Clone> SingleFlight<T> {
    pub fn join(&self, key: &str) -> Flight<T> {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(rx) = inflight.get(key) {
            return Flight::Follower(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        inflight.insert(key.to_owned(), rx);
        Flight::Leader(FlightLeader {
            key: key.to_owned(),
            tx,
            inflight: Arc::clone(&self.inflight),
            done: false,
        })
    }
}

impl<T: Clone> FlightLeader<T> {
    /// Publishes the outcome to all followers and releases the key.
    pub fn complete(mut self, outcome: T) {
        let _ = self.tx.send(Some(outcome));
        self.release();
        self.done = true;
    }

    fn release(&self) {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

impl<T: Clone> Drop for FlightLeader<T> {
    fn drop(&mut self) {
        if !self.done {
            // Dropping `tx` closes the channel; followers observe the abort.
            self.release();
        }
    }
}

/// Waits for the leader's outcome. Returns `LeaderAborted` if the leader was
/// dropped without publishing.
pub async fn await_outcome<T: Clone>(
    mut rx: watch::Receiver<Option<T>>,
) -> Result<T, LeaderAborted> {
    loop {
        if let Some(outcome) = rx.borrow().clone() {
            return Ok(outcome);
        }
        rx.changed().await.map_err(|_| LeaderAborted)?;
    }
}
