//! Role-aware replication: which node may mutate canonical state, how
//! mutations become snapshot broadcasts, and how incoming snapshots are
//! filtered for staleness.
//!
//! The replicator is constructed once with its role and an injected
//! transport; it never discovers either from anywhere else. On the
//! authoritative node the canonical state lives in the embedded
//! [`QuizGame`]; peers hold nothing but the last accepted snapshot.

use crate::game::{QuizGame, ResetMode};
use crate::monitor::{ConnectionMonitor, PLAYER_TIMEOUT};
use crate::transport::EnvelopeTransport;
use log::{debug, info, warn};
use shared::{Envelope, GamePhase, Payload, QuizSnapshot};

/// Default guard margin for snapshot acceptance, in milliseconds.
///
/// Large enough to swallow same-instant echoes bounced back through the
/// relay or the local bus, small enough that human-speed follow-up updates
/// are never suppressed.
pub const SYNC_MARGIN_MS: i64 = 5;

/// Which side of the replication protocol this node runs. Assigned at
/// construction, never negotiated or inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Authoritative,
    Peer,
}

/// A user intention raised by the UI collaborator on any node.
#[derive(Debug, Clone, PartialEq)]
pub enum UserIntent {
    Join { id: String, name: String },
    Buzz { player_id: String },
    Answer { player_id: String, answer_index: usize },
    Leave { player_id: String },
    Start,
    Advance,
    Reset,
}

pub struct Replicator<T: EnvelopeTransport> {
    role: Role,
    transport: T,
    game: QuizGame,
    replica: QuizSnapshot,
    last_accepted: i64,
    sync_margin_ms: i64,
    monitor: ConnectionMonitor,
    reset_mode: ResetMode,
}

impl<T: EnvelopeTransport> Replicator<T> {
    pub fn new(role: Role, transport: T, room_code: &str) -> Self {
        Self::with_options(role, transport, room_code, SYNC_MARGIN_MS, ResetMode::KeepRoster)
    }

    pub fn with_options(
        role: Role,
        transport: T,
        room_code: &str,
        sync_margin_ms: i64,
        reset_mode: ResetMode,
    ) -> Self {
        let game = QuizGame::new(room_code);
        let replica = game.snapshot();
        Self {
            role,
            transport,
            game,
            replica,
            last_accepted: 0,
            sync_margin_ms,
            monitor: ConnectionMonitor::new(PLAYER_TIMEOUT),
            reset_mode,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The snapshot this node currently holds. On the authoritative node
    /// this mirrors the canonical state; on a peer it is the replica.
    pub fn snapshot(&self) -> &QuizSnapshot {
        &self.replica
    }

    pub fn phase(&self) -> GamePhase {
        self.replica.game_state
    }

    /// Seeds state from a locally persisted snapshot at startup. The backup
    /// is best effort: on a peer any newer network snapshot replaces it, and
    /// the monitor starts empty so stale `isConnected` flags expire.
    pub fn restore(&mut self, snapshot: &QuizSnapshot) {
        match self.role {
            Role::Authoritative => {
                self.game.restore(snapshot);
                self.replica = self.game.snapshot();
            }
            Role::Peer => {
                self.replica = snapshot.clone();
                self.last_accepted = snapshot.timestamp;
            }
        }
    }

    /// Applies one incoming envelope. Returns true when the locally held
    /// snapshot changed.
    pub fn handle_envelope(&mut self, envelope: Envelope) -> bool {
        let kind = envelope.payload.kind();
        let from = envelope.device_id.clone();

        let changed = match (self.role, envelope.payload) {
            // --- authoritative message handling ---
            (Role::Authoritative, Payload::PlayerJoined { id, name }) => {
                self.record_alive(&id);
                if self.game.join(&id, &name) {
                    self.broadcast_snapshot()
                } else {
                    // Known and already connected: re-broadcast anyway so
                    // the rejoining device gets a fresh snapshot.
                    self.broadcast_fresh();
                    false
                }
            }
            (Role::Authoritative, Payload::PlayerBuzz { player_id }) => {
                self.record_alive(&player_id);
                self.game.buzz(&player_id) && self.broadcast_snapshot()
            }
            (Role::Authoritative, Payload::PlayerAnswer { player_id, answer_index }) => {
                self.record_alive(&player_id);
                self.game.answer(&player_id, answer_index) && self.broadcast_snapshot()
            }
            (Role::Authoritative, Payload::SyncRequest {}) => {
                debug!("Sync requested by {}", from);
                self.broadcast_fresh();
                false
            }
            (Role::Authoritative, Payload::Heartbeat { player_id, .. }) => {
                self.monitor.record(&player_id);
                // A heartbeat from a player we marked dead revives them
                self.game.mark_connected(&player_id) && self.broadcast_snapshot()
            }
            (Role::Authoritative, Payload::PlayerDisconnect { player_id }) => {
                self.monitor.forget(&player_id);
                self.game.mark_disconnected(&player_id) && self.broadcast_snapshot()
            }
            (Role::Authoritative, Payload::GameReset {}) => {
                info!("Reset requested by {}", from);
                self.apply_reset()
            }
            (Role::Authoritative, Payload::StateSync(_)) => {
                // The authoritative node never applies foreign snapshots
                debug!("Ignoring STATE_SYNC from {} (authoritative)", from);
                false
            }

            // --- peer message handling ---
            (Role::Peer, Payload::StateSync(snapshot)) => self.apply_snapshot(snapshot),
            (Role::Peer, payload) if is_intent(&payload) => {
                // Another peer's intent on its way to the authority
                debug!("Ignoring {} on peer", payload.kind());
                false
            }

            (_, Payload::ServerReady { message }) => {
                debug!("Relay ready: {}", message);
                false
            }
            (_, payload) => {
                debug!("Ignoring {} in role {:?}", payload.kind(), self.role);
                false
            }
        };

        if changed {
            debug!("{} from {} applied", kind, from);
        }
        changed
    }

    /// Applies a local user intent. On the authoritative node intents mutate
    /// canonical state directly; on a peer the mutating ones are forwarded
    /// as envelopes. Returns true when the local snapshot changed.
    pub fn handle_intent(&mut self, intent: UserIntent) -> bool {
        match self.role {
            Role::Authoritative => self.apply_intent(intent),
            Role::Peer => {
                self.forward_intent(intent);
                false
            }
        }
    }

    fn apply_intent(&mut self, intent: UserIntent) -> bool {
        let changed = match intent {
            UserIntent::Join { id, name } => {
                self.record_alive(&id);
                self.game.join(&id, &name)
            }
            UserIntent::Buzz { player_id } => self.game.buzz(&player_id),
            UserIntent::Answer {
                player_id,
                answer_index,
            } => self.game.answer(&player_id, answer_index),
            UserIntent::Leave { player_id } => {
                self.monitor.forget(&player_id);
                self.game.mark_disconnected(&player_id)
            }
            UserIntent::Start => self.game.start(),
            UserIntent::Advance => self.game.advance(),
            UserIntent::Reset => return self.apply_reset(),
        };
        changed && self.broadcast_snapshot()
    }

    fn forward_intent(&mut self, intent: UserIntent) {
        let payload = match intent {
            UserIntent::Join { id, name } => Payload::PlayerJoined { id, name },
            UserIntent::Buzz { player_id } => Payload::PlayerBuzz { player_id },
            UserIntent::Answer {
                player_id,
                answer_index,
            } => Payload::PlayerAnswer {
                player_id,
                answer_index,
            },
            UserIntent::Leave { player_id } => Payload::PlayerDisconnect { player_id },
            UserIntent::Reset => Payload::GameReset {},
            UserIntent::Start | UserIntent::Advance => {
                warn!("Host-only intent raised on a peer, ignoring");
                return;
            }
        };
        if !self.transport.send(payload) {
            debug!("Intent buffered or dropped, no live channel");
        }
    }

    fn apply_reset(&mut self) -> bool {
        if self.reset_mode == ResetMode::ClearRoster {
            self.monitor.clear();
        }
        self.game.reset(self.reset_mode) && self.broadcast_snapshot()
    }

    /// Peer-side snapshot application with the staleness guard: accept only
    /// if the incoming logical timestamp is meaningfully newer than the last
    /// accepted one, treating small deltas as echo or reordering noise.
    fn apply_snapshot(&mut self, snapshot: QuizSnapshot) -> bool {
        if snapshot.timestamp <= self.last_accepted + self.sync_margin_ms {
            debug!(
                "Discarding snapshot t={} (held t={}, margin {}ms)",
                snapshot.timestamp, self.last_accepted, self.sync_margin_ms
            );
            return false;
        }
        self.last_accepted = snapshot.timestamp;
        self.replica = snapshot;
        true
    }

    /// Marks a player disconnected for every expired heartbeat and
    /// broadcasts one snapshot iff anything changed.
    pub fn sweep_connections(&mut self) -> bool {
        if self.role != Role::Authoritative {
            return false;
        }
        let mut changed = false;
        for player_id in self.monitor.sweep() {
            if self.game.mark_disconnected(&player_id) {
                info!("Player {} timed out", player_id);
                changed = true;
            }
        }
        changed && self.broadcast_snapshot()
    }

    /// Emits a heartbeat for the local player (peer side).
    pub fn emit_heartbeat(&mut self, player_id: &str) {
        self.transport.send(Payload::Heartbeat {
            player_id: player_id.to_string(),
            timestamp: shared::now_millis(),
        });
    }

    fn record_alive(&mut self, player_id: &str) {
        if self.role == Role::Authoritative {
            self.monitor.record(player_id);
        }
    }

    /// Mirrors canonical state into the local replica and broadcasts it.
    /// Always returns true so callers can chain on "state changed".
    fn broadcast_snapshot(&mut self) -> bool {
        self.replica = self.game.snapshot();
        let sent = self.transport.send(Payload::StateSync(self.replica.clone()));
        if !sent {
            debug!("Snapshot broadcast buffered or dropped");
        }
        true
    }

    /// Broadcasts a snapshot stamped with the current time, for sync
    /// requests and rejoins. Does not count as a local state change.
    fn broadcast_fresh(&mut self) {
        self.replica = self.game.snapshot_now();
        self.transport.send(Payload::StateSync(self.replica.clone()));
    }
}

fn is_intent(payload: &Payload) -> bool {
    matches!(
        payload,
        Payload::PlayerJoined { .. }
            | Payload::PlayerBuzz { .. }
            | Payload::PlayerAnswer { .. }
            | Payload::SyncRequest {}
            | Payload::Heartbeat { .. }
            | Payload::PlayerDisconnect { .. }
            | Payload::GameReset {}
    )
}
