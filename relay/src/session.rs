//! Per-connection session bookkeeping.
//!
//! Each accepted socket gets one [`Session`] carrying its outbound queue.
//! The [`SessionRegistry`] is the only shared structure in the relay and is
//! locked just long enough to fan a frame out.

use log::debug;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug)]
pub struct Session {
    id: u64,
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Session {
    pub fn new(id: u64, addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, addr, outbound }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queues a frame for this session. Returns false once the writer has
    /// gone away.
    pub fn forward(&self, message: Message) -> bool {
        self.outbound.send(message).is_ok()
    }
}

/// All live sessions, shared between connection tasks.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<u64, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Session) {
        let mut sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        debug!("Session {} from {} registered", session.id(), session.addr());
        sessions.insert(session.id(), session);
    }

    pub fn remove(&self, id: u64) {
        let mut sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if sessions.remove(&id).is_some() {
            debug!("Session {} removed", id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fans a frame out to every session except the sender. Returns how
    /// many sessions it reached.
    pub fn broadcast_from(&self, sender_id: u64, message: &Message) -> usize {
        let sessions = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut reached = 0;
        for session in sessions.values() {
            if session.id() == sender_id {
                continue;
            }
            if session.forward(message.clone()) {
                reached += 1;
            }
        }
        reached
    }
}
