//! The stateless WebSocket relay.
//!
//! The relay never parses quiz traffic. Every text or binary frame a
//! session sends is rebroadcast verbatim to all other sessions; ordering,
//! staleness and game rules are entirely the nodes' problem. The only frame
//! the relay authors itself is the greeting sent on accept.

use crate::session::{Session, SessionRegistry};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{Envelope, Payload, RELAY_DEVICE_ID};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant as TokioInstant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::accept_async;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const MAX_MISSED_PONGS: u32 = 3;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub ping_interval: Duration,
    pub max_missed_pongs: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            max_missed_pongs: MAX_MISSED_PONGS,
        }
    }
}

pub struct Relay {
    listener: TcpListener,
    registry: SessionRegistry,
    config: RelayConfig,
    next_id: AtomicU64,
}

impl Relay {
    pub async fn bind(addr: &str) -> std::io::Result<Self> {
        Self::bind_with_config(addr, RelayConfig::default()).await
    }

    pub async fn bind_with_config(addr: &str, config: RelayConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry: SessionRegistry::new(),
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// Actual bound address, useful when binding port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Accepts connections until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let registry = self.registry.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                handle_connection(stream, addr, id, registry, config).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: u64,
    registry: SessionRegistry,
    config: RelayConfig,
) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };
    info!("Session {} connected from {}", id, addr);

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    registry.insert(Session::new(id, addr, outbound_tx.clone()));

    let greeting = Envelope::new(
        Payload::ServerReady {
            message: "Connected to relay".to_string(),
        },
        RELAY_DEVICE_ID,
    );
    match serde_json::to_string(&greeting) {
        Ok(raw) => {
            let _ = outbound_tx.send(Message::Text(raw));
        }
        Err(e) => warn!("Failed to encode greeting: {}", e),
    }

    // First ping only after a full interval; the greeting already proves
    // the connection works
    let mut ping = interval_at(
        TokioInstant::now() + config.ping_interval,
        config.ping_interval,
    );
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(message @ Message::Text(_))) | Some(Ok(message @ Message::Binary(_))) => {
                    let reached = registry.broadcast_from(id, &message);
                    debug!("Session {} frame relayed to {} sessions", id, reached);
                }
                Some(Ok(Message::Pong(_))) => {
                    missed_pongs = 0;
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = outbound_tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Session {} closed", id);
                    break;
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    warn!("Session {} read error: {}", id, e);
                    break;
                }
            },

            _ = ping.tick() => {
                if missed_pongs >= config.max_missed_pongs {
                    warn!("Session {} unresponsive, evicting", id);
                    break;
                }
                if outbound_tx.send(Message::Ping(Vec::new())).is_err() {
                    break;
                }
                missed_pongs += 1;
            },
        }
    }

    registry.remove(id);
    drop(outbound_tx);
    let _ = writer.await;
    info!("Session {} cleaned up", id);
}
