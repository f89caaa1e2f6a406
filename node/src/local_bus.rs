//! Process-local broadcast fallback channel.
//!
//! The native analog of a same-origin browser broadcast channel: every node
//! in this process that opens a bus with the same name shares one topic.
//! Used by the transport when the relay socket is unavailable.

use shared::Envelope;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};
use tokio::sync::broadcast;

const BUS_CAPACITY: usize = 64;

static REGISTRY: OnceLock<Mutex<HashMap<String, broadcast::Sender<Envelope>>>> = OnceLock::new();

/// Handle to a named in-process broadcast topic.
#[derive(Debug, Clone)]
pub struct LocalBus {
    name: String,
    tx: broadcast::Sender<Envelope>,
}

impl LocalBus {
    /// Opens (or joins) the named topic.
    pub fn open(name: &str) -> Self {
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        let mut map = registry.lock().unwrap_or_else(|e| e.into_inner());
        let tx = map
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .clone();
        Self {
            name: name.to_string(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publishes to every subscriber, including the sender's own receiver.
    /// Callers filter self-echoes by device id. Returns false when nobody
    /// is listening.
    pub fn publish(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }
}
