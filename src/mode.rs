use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use serde::Serialize;

use crate::config::ProxyMode;

/// Process-wide mode plus hit/miss/recorded/error counters. The mode is read
/// once per request, so in-flight requests finish under their starting mode
/// while the next request observes a runtime switch.
#[derive(Debug)]
pub struct ModeEngine {
    mode: AtomicU8,
    hits: AtomicU64,
    misses: AtomicU64,
    recorded: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub recorded: u64,
    pub errors: u64,
}

const MODE_RECORD: u8 = 0;
const MODE_REPLAY: u8 = 1;
const MODE_SPY: u8 = 2;

fn encode_mode(mode: ProxyMode) -> u8 {
    match mode {
        ProxyMode::Record => MODE_RECORD,
        ProxyMode::Replay => MODE_REPLAY,
        ProxyMode::Spy => MODE_SPY,
    }
}

fn decode_mode(value: u8) -> ProxyMode {
    match value {
        MODE_RECORD => ProxyMode::Record,
        MODE_REPLAY => ProxyMode::Replay,
        _ => ProxyMode::Spy,
    }
}

impl ModeEngine {
    pub fn new(mode: ProxyMode) -> Self {
        Self {
            mode: AtomicU8::new(encode_mode(mode)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            recorded: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> ProxyMode {
        decode_mode(self.mode.load(Ordering::SeqCst))
    }

    pub fn set_mode(&self, mode: ProxyMode) {
        self.mode.store(encode_mode(mode), Ordering::SeqCst);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recorded(&self) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}
