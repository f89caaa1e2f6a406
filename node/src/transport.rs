//! Per-node transport: relay socket with reconnection, local bus fallback,
//! critical-message buffering and self-echo filtering.
//!
//! The transport is split into a clone-able [`TransportHandle`] (the send
//! half, injected into the replicator) and a manager task that owns the
//! actual channels. Incoming envelopes and channel transitions flow back to
//! the node event loop as [`TransportEvent`]s over one channel, so all state
//! mutation stays on a single logical thread.

use crate::local_bus::LocalBus;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use shared::{Envelope, Payload};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(5000);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const SYNC_SETTLE_DELAY: Duration = Duration::from_millis(300);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
pub const CRITICAL_BUFFER_CAP: usize = 8;

const QUALITY_GOOD_UNDER: Duration = Duration::from_secs(5);
const QUALITY_UNSTABLE_UNDER: Duration = Duration::from_secs(15);

/// Advisory transport quality, derived purely from how recently anything
/// was received. Never gates protocol correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Good,
    Unstable,
    Poor,
}

impl Quality {
    pub fn from_silence(elapsed: Duration) -> Self {
        if elapsed < QUALITY_GOOD_UNDER {
            Quality::Good
        } else if elapsed < QUALITY_UNSTABLE_UNDER {
            Quality::Unstable
        } else {
            Quality::Poor
        }
    }
}

/// Per-node transport health, derived on demand and never persisted.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub quality: Quality,
    pub reconnect_attempts: u32,
    pub buffered_messages: usize,
    pub is_reconnecting: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Socket,
    LocalBus,
}

/// Events from the manager task to the node event loop.
#[derive(Debug)]
pub enum TransportEvent {
    ChannelUp(ChannelKind),
    ChannelDown,
    Envelope(Envelope),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub relay_url: String,
    pub bus_name: String,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub max_reconnect_attempts: u32,
    pub settle_delay: Duration,
    pub buffer_cap: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            relay_url: format!("ws://127.0.0.1:{}", shared::DEFAULT_RELAY_PORT),
            bus_name: "quiz-game".to_string(),
            reconnect_base: RECONNECT_BASE_DELAY,
            reconnect_max: RECONNECT_MAX_DELAY,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            settle_delay: SYNC_SETTLE_DELAY,
            buffer_cap: CRITICAL_BUFFER_CAP,
        }
    }
}

/// Nominal reconnect delay for the given attempt: base * 1.5^attempt,
/// capped at `max`. Jitter is applied separately.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1.5_f64.powi(attempt.min(64) as i32);
    base.mul_f64(factor).min(max)
}

/// ±20% uniform jitter, still capped, so simultaneous reconnect storms
/// spread out.
fn jittered(delay: Duration, max: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    delay.mul_f64(factor).min(max)
}

/// Bounded FIFO holding only critical envelopes while no channel is up.
/// Overflow silently drops the oldest entry.
#[derive(Debug)]
pub struct CriticalBuffer {
    cap: usize,
    items: VecDeque<Envelope>,
}

impl CriticalBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            items: VecDeque::new(),
        }
    }

    /// Returns true if the envelope was retained.
    pub fn push(&mut self, envelope: Envelope) -> bool {
        if !envelope.payload.is_critical() {
            return false;
        }
        if self.items.len() >= self.cap {
            self.items.pop_front();
        }
        self.items.push_back(envelope);
        true
    }

    /// Removes and returns everything, oldest first.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug)]
struct StatusInner {
    connected: bool,
    reconnecting: bool,
    attempts: u32,
    buffered: usize,
    last_received: Option<Instant>,
}

impl StatusInner {
    fn new() -> Self {
        Self {
            connected: false,
            reconnecting: false,
            attempts: 0,
            buffered: 0,
            last_received: None,
        }
    }
}

type SharedStatus = Arc<Mutex<StatusInner>>;

fn with_status(status: &SharedStatus, f: impl FnOnce(&mut StatusInner)) {
    let mut inner = status.lock().unwrap_or_else(|e| e.into_inner());
    f(&mut inner);
}

/// The seam the replicator is constructed with: anything that can put a
/// payload on the wire.
pub trait EnvelopeTransport {
    /// Returns false when the payload could only be buffered or dropped
    /// rather than put on a live channel.
    fn send(&mut self, payload: Payload) -> bool;
}

/// Clone-able send half of the transport.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    device_id: String,
    cmd_tx: mpsc::UnboundedSender<Payload>,
    status: SharedStatus,
}

impl TransportHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn status(&self) -> ConnectionStatus {
        let inner = self.status.lock().unwrap_or_else(|e| e.into_inner());
        let quality = match inner.last_received {
            Some(at) => Quality::from_silence(at.elapsed()),
            None => Quality::Poor,
        };
        ConnectionStatus {
            is_connected: inner.connected,
            quality,
            reconnect_attempts: inner.attempts,
            buffered_messages: inner.buffered,
            is_reconnecting: inner.reconnecting,
        }
    }
}

impl EnvelopeTransport for TransportHandle {
    fn send(&mut self, payload: Payload) -> bool {
        let live = {
            let inner = self.status.lock().unwrap_or_else(|e| e.into_inner());
            inner.connected
        };
        let queued = self.cmd_tx.send(payload).is_ok();
        live && queued
    }
}

pub struct Transport;

impl Transport {
    /// Spawns the manager task and returns the send handle plus the event
    /// stream for the node loop.
    pub fn connect(
        config: TransportConfig,
        device_id: impl Into<String>,
    ) -> (TransportHandle, mpsc::UnboundedReceiver<TransportEvent>) {
        let device_id = device_id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let status: SharedStatus = Arc::new(Mutex::new(StatusInner::new()));

        let handle = TransportHandle {
            device_id: device_id.clone(),
            cmd_tx,
            status: Arc::clone(&status),
        };

        tokio::spawn(manager_task(config, device_id, cmd_rx, event_tx, status));

        (handle, event_rx)
    }
}

/// Generates a short random device id, persisted by the caller.
pub fn random_device_id() -> String {
    let mut rng = rand::thread_rng();
    (0..9)
        .map(|_| {
            let c = rng.gen_range(0..36u8);
            (if c < 10 { b'0' + c } else { b'a' + c - 10 }) as char
        })
        .collect()
}

async fn manager_task(
    config: TransportConfig,
    device_id: String,
    mut cmd_rx: mpsc::UnboundedReceiver<Payload>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    status: SharedStatus,
) {
    let mut buffer = CriticalBuffer::new(config.buffer_cap);

    if !probe_relay(&config.relay_url).await {
        warn!(
            "Relay probe to {} failed, using local broadcast fallback",
            config.relay_url
        );
        run_local_bus(&config, &device_id, &mut cmd_rx, &event_tx, &status, &mut buffer).await;
        return;
    }

    let mut attempts: u32 = 0;
    loop {
        match connect_async(&config.relay_url).await {
            Ok((socket, _)) => {
                info!("Connected to relay at {}", config.relay_url);
                attempts = 0;
                with_status(&status, |s| {
                    s.connected = true;
                    s.reconnecting = false;
                    s.attempts = 0;
                });
                let _ = event_tx.send(TransportEvent::ChannelUp(ChannelKind::Socket));

                let end = run_socket(
                    socket,
                    &config,
                    &device_id,
                    &mut cmd_rx,
                    &event_tx,
                    &status,
                    &mut buffer,
                )
                .await;

                with_status(&status, |s| s.connected = false);
                let _ = event_tx.send(TransportEvent::ChannelDown);

                if end == SocketEnd::ConsumerGone {
                    return;
                }
                info!("Relay connection lost");
            }
            Err(e) => {
                warn!("WebSocket connect failed: {}", e);
            }
        }

        attempts += 1;
        with_status(&status, |s| {
            s.attempts = attempts;
            s.reconnecting = true;
        });

        if attempts >= config.max_reconnect_attempts {
            warn!(
                "Giving up on relay after {} attempts, switching to local bus",
                attempts
            );
            break;
        }

        let delay = jittered(
            backoff_delay(attempts - 1, config.reconnect_base, config.reconnect_max),
            config.reconnect_max,
        );
        info!("Reconnecting in {:?} (attempt {})", delay, attempts);

        // Keep draining sends into the critical buffer during the backoff
        let wait = sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(payload) => {
                        stash(&mut buffer, Envelope::new(payload, device_id.clone()), &status);
                    }
                    None => return,
                },
            }
        }
    }

    with_status(&status, |s| s.reconnecting = false);
    run_local_bus(&config, &device_id, &mut cmd_rx, &event_tx, &status, &mut buffer).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketEnd {
    Dropped,
    ConsumerGone,
}

async fn run_socket(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: &TransportConfig,
    device_id: &str,
    cmd_rx: &mut mpsc::UnboundedReceiver<Payload>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    status: &SharedStatus,
    buffer: &mut CriticalBuffer,
) -> SocketEnd {
    let (mut sink, mut stream) = socket.split();

    // Flush anything buffered during the outage, oldest first
    let mut pending = buffer.drain().into_iter();
    while let Some(envelope) = pending.next() {
        if !send_over_socket(&mut sink, &envelope).await {
            buffer.push(envelope);
            for rest in pending {
                buffer.push(rest);
            }
            with_status(status, |s| s.buffered = buffer.len());
            return SocketEnd::Dropped;
        }
    }
    with_status(status, |s| s.buffered = buffer.len());

    // Ask for a fresh snapshot once the connection has settled
    let settle = sleep(config.settle_delay);
    tokio::pin!(settle);
    let mut sync_requested = false;

    loop {
        tokio::select! {
            _ = &mut settle, if !sync_requested => {
                sync_requested = true;
                let envelope = Envelope::new(Payload::SyncRequest {}, device_id);
                debug!("Requesting state sync");
                if !send_over_socket(&mut sink, &envelope).await {
                    return SocketEnd::Dropped;
                }
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(payload) => {
                    let envelope = Envelope::new(payload, device_id);
                    if !send_over_socket(&mut sink, &envelope).await {
                        stash(buffer, envelope, status);
                        return SocketEnd::Dropped;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SocketEnd::ConsumerGone;
                }
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_incoming(&text, device_id, event_tx, status);
                }
                Some(Ok(Message::Binary(bytes))) => {
                    match String::from_utf8(bytes) {
                        Ok(text) => handle_incoming(&text, device_id, event_tx, status),
                        Err(_) => warn!("Dropping non-UTF8 binary frame"),
                    }
                }
                Some(Ok(_)) => {} // ping/pong handled by the library
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    return SocketEnd::Dropped;
                }
                None => return SocketEnd::Dropped,
            },
        }
    }
}

async fn send_over_socket<S>(sink: &mut S, envelope: &Envelope) -> bool
where
    S: futures_util::Sink<Message> + Unpin,
{
    match serde_json::to_string(envelope) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode envelope: {}", e);
            true
        }
    }
}

/// Terminal fallback: the process-local bus, for the rest of the session.
async fn run_local_bus(
    config: &TransportConfig,
    device_id: &str,
    cmd_rx: &mut mpsc::UnboundedReceiver<Payload>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    status: &SharedStatus,
    buffer: &mut CriticalBuffer,
) {
    let bus = LocalBus::open(&config.bus_name);
    let mut bus_rx = bus.subscribe();

    with_status(status, |s| {
        s.connected = true;
        s.reconnecting = false;
    });
    let _ = event_tx.send(TransportEvent::ChannelUp(ChannelKind::LocalBus));
    info!("Local bus '{}' active", bus.name());

    for envelope in buffer.drain() {
        bus.publish(envelope);
    }
    with_status(status, |s| s.buffered = 0);

    let settle = sleep(config.settle_delay);
    tokio::pin!(settle);
    let mut sync_requested = false;

    loop {
        tokio::select! {
            _ = &mut settle, if !sync_requested => {
                sync_requested = true;
                bus.publish(Envelope::new(Payload::SyncRequest {}, device_id));
            }

            cmd = cmd_rx.recv() => match cmd {
                Some(payload) => {
                    bus.publish(Envelope::new(payload, device_id));
                }
                None => return,
            },

            received = bus_rx.recv() => match received {
                Ok(envelope) => {
                    if envelope.device_id == device_id {
                        continue;
                    }
                    with_status(status, |s| s.last_received = Some(Instant::now()));
                    let _ = event_tx.send(TransportEvent::Envelope(envelope));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Local bus lagged, dropped {} envelopes", n);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

fn handle_incoming(
    text: &str,
    device_id: &str,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    status: &SharedStatus,
) {
    match serde_json::from_str::<Envelope>(text) {
        Ok(envelope) => {
            if envelope.device_id == device_id {
                debug!("Ignoring self-echo of {}", envelope.payload.kind());
                return;
            }
            with_status(status, |s| s.last_received = Some(Instant::now()));
            debug!(
                "Received {} from {}",
                envelope.payload.kind(),
                envelope.device_id
            );
            let _ = event_tx.send(TransportEvent::Envelope(envelope));
        }
        Err(e) => {
            warn!("Dropping malformed envelope: {}", e);
        }
    }
}

fn stash(buffer: &mut CriticalBuffer, envelope: Envelope, status: &SharedStatus) {
    let kind = envelope.payload.kind();
    if buffer.push(envelope) {
        debug!("Buffered {} while offline", kind);
    } else {
        debug!("Dropping non-critical {} while offline", kind);
    }
    with_status(status, |s| s.buffered = buffer.len());
}

/// TCP pre-check against the relay address, so a host without a relay on
/// the network falls back immediately instead of burning the full backoff
/// schedule.
async fn probe_relay(url: &str) -> bool {
    let Some(addr) = host_port(url) else {
        return false;
    };
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect(addr.as_str())).await,
        Ok(Ok(_))
    )
}

fn host_port(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))?;
    let authority = rest.split('/').next()?;
    if authority.is_empty() {
        return None;
    }
    if authority.contains(':') {
        Some(authority.to_string())
    } else {
        Some(format!("{}:80", authority))
    }
}
