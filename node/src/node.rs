//! The per-device runtime: one event loop tying the transport, replicator,
//! connection monitor and local backup together.
//!
//! All canonical-state mutation happens inside [`QuizNode::run`], in response
//! to discrete events on a single logical thread: transport events, user
//! intents from the UI collaborator, the heartbeat and sweep timers, and the
//! auto-advance deadline. Handlers run to completion before the next event.

use crate::backup::{IdentityStore, PlayerIdentity, SnapshotStore};
use crate::game::ResetMode;
use crate::monitor::{HEARTBEAT_INTERVAL, SWEEP_INTERVAL};
use crate::replicator::{Replicator, Role, UserIntent, SYNC_MARGIN_MS};
use crate::transport::{
    ConnectionStatus, Transport, TransportConfig, TransportEvent, TransportHandle,
};
use log::{debug, info, warn};
use shared::{GamePhase, QuizSnapshot, DEFAULT_ROOM_CODE};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant};

pub const AUTO_ADVANCE_AFTER: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub role: Role,
    pub room_code: String,
    /// Where backup and identity files live; None disables persistence.
    pub data_dir: Option<PathBuf>,
    pub reset_mode: ResetMode,
    pub sync_margin_ms: i64,
    pub heartbeat_interval: Duration,
    pub sweep_interval: Duration,
    pub auto_advance_after: Duration,
    pub transport: TransportConfig,
}

impl NodeConfig {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            room_code: DEFAULT_ROOM_CODE.to_string(),
            data_dir: None,
            reset_mode: ResetMode::KeepRoster,
            sync_margin_ms: SYNC_MARGIN_MS,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            sweep_interval: SWEEP_INTERVAL,
            auto_advance_after: AUTO_ADVANCE_AFTER,
            transport: TransportConfig::default(),
        }
    }
}

/// Cheap handle given to the UI collaborator: raise intents, watch
/// snapshots, read transport health.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    intents: mpsc::UnboundedSender<UserIntent>,
    snapshots: watch::Receiver<QuizSnapshot>,
    transport: TransportHandle,
}

impl NodeHandle {
    /// Raises a user intent into the core. Returns false once the node has
    /// shut down.
    pub fn raise(&self, intent: UserIntent) -> bool {
        self.intents.send(intent).is_ok()
    }

    /// Watch channel carrying the currently held snapshot.
    pub fn snapshots(&self) -> watch::Receiver<QuizSnapshot> {
        self.snapshots.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn device_id(&self) -> &str {
        self.transport.device_id()
    }
}

pub struct QuizNode {
    config: NodeConfig,
    replicator: Replicator<TransportHandle>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    intents_rx: mpsc::UnboundedReceiver<UserIntent>,
    handle: NodeHandle,
    snapshots_tx: watch::Sender<QuizSnapshot>,
    snapshot_store: Option<SnapshotStore>,
    identity_store: Option<IdentityStore>,
    identity: PlayerIdentity,
    /// Set while the countdown for the current results phase is running, so
    /// further mutations inside results never restart it.
    auto_advance_armed: bool,
    auto_advance_at: Option<Instant>,
}

impl QuizNode {
    /// Builds the node: loads identity and backup, connects the transport
    /// and seeds the replicator.
    pub fn start(config: NodeConfig) -> Self {
        let identity_store = config.data_dir.as_deref().map(IdentityStore::new);
        let identity = identity_store
            .as_ref()
            .map(|s| s.load_or_create())
            .unwrap_or_else(|| PlayerIdentity {
                device_id: crate::transport::random_device_id(),
                player_id: None,
                player_name: None,
            });

        let (transport, events) =
            Transport::connect(config.transport.clone(), identity.device_id.clone());

        let mut replicator = Replicator::with_options(
            config.role,
            transport.clone(),
            &config.room_code,
            config.sync_margin_ms,
            config.reset_mode,
        );

        let snapshot_store = config.data_dir.as_deref().map(SnapshotStore::new);
        if let Some(snapshot) = snapshot_store.as_ref().and_then(|s| s.load()) {
            info!(
                "Restored backup snapshot (phase {:?}, t={})",
                snapshot.game_state, snapshot.timestamp
            );
            replicator.restore(&snapshot);
        }

        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(replicator.snapshot().clone());

        let handle = NodeHandle {
            intents: intents_tx,
            snapshots: snapshots_rx,
            transport: transport.clone(),
        };

        let mut node = Self {
            config,
            replicator,
            events,
            intents_rx,
            handle,
            snapshots_tx,
            snapshot_store,
            identity_store,
            identity,
            auto_advance_armed: false,
            auto_advance_at: None,
        };
        // A restored backup may already be mid-results
        node.rearm_auto_advance();
        node
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle.clone()
    }

    pub fn identity(&self) -> &PlayerIdentity {
        &self.identity
    }

    /// Runs the event loop until the transport closes and all intent
    /// senders are dropped.
    pub async fn run(mut self) {
        let mut heartbeat = interval(self.config.heartbeat_interval);
        let mut sweep = interval(self.config.sweep_interval);

        info!(
            "Node running as {:?} in room {} (device {})",
            self.config.role,
            self.config.room_code,
            self.handle.device_id()
        );

        loop {
            let deadline = self.auto_advance_at;
            let auto_advance = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(TransportEvent::Envelope(envelope)) => {
                        let changed = self.replicator.handle_envelope(envelope);
                        self.after_mutation(changed);
                    }
                    Some(TransportEvent::ChannelUp(kind)) => {
                        info!("Channel up: {:?}", kind);
                    }
                    Some(TransportEvent::ChannelDown) => {
                        warn!("Channel down, reconnecting");
                    }
                    None => {
                        info!("Transport closed, node stopping");
                        break;
                    }
                },

                intent = self.intents_rx.recv() => match intent {
                    Some(intent) => {
                        self.note_identity(&intent);
                        let changed = self.replicator.handle_intent(intent);
                        self.after_mutation(changed);
                    }
                    None => break,
                },

                _ = heartbeat.tick() => {
                    if self.config.role == Role::Peer {
                        if let Some(player_id) = self.identity.player_id.clone() {
                            self.replicator.emit_heartbeat(&player_id);
                        }
                    }
                },

                _ = sweep.tick() => {
                    let changed = self.replicator.sweep_connections();
                    self.after_mutation(changed);
                },

                _ = auto_advance => {
                    debug!("Auto-advancing after results pause");
                    self.auto_advance_armed = false;
                    self.auto_advance_at = None;
                    let changed = self.replicator.handle_intent(UserIntent::Advance);
                    self.after_mutation(changed);
                },
            }
        }
    }

    fn after_mutation(&mut self, changed: bool) {
        if !changed {
            return;
        }
        let snapshot = self.replicator.snapshot().clone();
        debug!(
            "Snapshot t={} phase={:?} players={}",
            snapshot.timestamp,
            snapshot.game_state,
            snapshot.players.len()
        );
        if let Some(store) = &self.snapshot_store {
            store.save(&snapshot);
        }
        let _ = self.snapshots_tx.send(snapshot);
        self.rearm_auto_advance();
    }

    /// Arms the results auto-advance on entry into the results phase; any
    /// transition out of results (manual advance, reset) disarms it. Roster
    /// churn while results are showing must not restart the countdown.
    fn rearm_auto_advance(&mut self) {
        if self.config.role != Role::Authoritative {
            return;
        }
        if self.replicator.phase() == GamePhase::Results {
            if !self.auto_advance_armed {
                self.auto_advance_armed = true;
                self.auto_advance_at = Some(Instant::now() + self.config.auto_advance_after);
            }
        } else {
            self.auto_advance_armed = false;
            self.auto_advance_at = None;
        }
    }

    /// Remembers the local player identity raised through a join, so the
    /// peer heartbeats for it and a later restart rejoins with the same id.
    fn note_identity(&mut self, intent: &UserIntent) {
        let UserIntent::Join { id, name } = intent else {
            return;
        };
        if self.identity.player_id.as_deref() == Some(id)
            && self.identity.player_name.as_deref() == Some(name)
        {
            return;
        }
        self.identity.player_id = Some(id.clone());
        self.identity.player_name = Some(name.clone());
        if let Some(store) = &self.identity_store {
            store.save(&self.identity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config(role: Role, bus: &str) -> NodeConfig {
        let mut config = NodeConfig::new(role);
        // Unreachable relay, so the transport drops to the local bus fast
        config.transport.relay_url = "ws://127.0.0.1:1".to_string();
        config.transport.bus_name = bus.to_string();
        config.transport.settle_delay = Duration::from_millis(10);
        config.auto_advance_after = Duration::from_millis(50);
        config.heartbeat_interval = Duration::from_millis(500);
        config
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<QuizSnapshot>, mut predicate: F) -> QuizSnapshot
    where
        F: FnMut(&QuizSnapshot) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                if predicate(&rx.borrow()) {
                    return rx.borrow().clone();
                }
                rx.changed().await.expect("node stopped");
            }
        })
        .await
        .expect("timed out waiting for snapshot condition")
    }

    #[tokio::test]
    async fn test_join_intent_updates_snapshot() {
        let node = QuizNode::start(test_config(Role::Authoritative, "node-test-join"));
        let handle = node.handle();
        let mut snapshots = handle.snapshots();
        tokio::spawn(node.run());

        assert!(handle.raise(UserIntent::Join {
            id: "p1".to_string(),
            name: "Ana".to_string(),
        }));

        let snapshot = wait_for(&mut snapshots, |s| !s.players.is_empty()).await;
        assert_eq!(snapshot.players[0].name, "Ana");
        assert_eq!(snapshot.game_state, GamePhase::Waiting);
    }

    #[tokio::test]
    async fn test_results_auto_advances_to_next_question() {
        let node = QuizNode::start(test_config(Role::Authoritative, "node-test-advance"));
        let handle = node.handle();
        let mut snapshots = handle.snapshots();
        tokio::spawn(node.run());

        handle.raise(UserIntent::Join {
            id: "p1".to_string(),
            name: "Ana".to_string(),
        });
        handle.raise(UserIntent::Start);
        let playing = wait_for(&mut snapshots, |s| s.game_state == GamePhase::Playing).await;
        let correct = playing.current_question.unwrap().correct_option_index;

        handle.raise(UserIntent::Buzz {
            player_id: "p1".to_string(),
        });
        handle.raise(UserIntent::Answer {
            player_id: "p1".to_string(),
            answer_index: correct,
        });

        let results = wait_for(&mut snapshots, |s| s.game_state == GamePhase::Results).await;
        assert_eq!(results.players[0].score, 10);
        assert_eq!(results.current_question_index, 0);

        // No manual advance: the 3s (shortened here) timer fires once
        let advanced =
            wait_for(&mut snapshots, |s| s.game_state == GamePhase::Playing && s.current_question_index == 1)
                .await;
        assert!(advanced.active_player.is_none());
    }

    #[tokio::test]
    async fn test_peer_leave_marks_it_disconnected_before_any_sweep() {
        let mut tv_config = test_config(Role::Authoritative, "node-test-leave");
        // Neither the sweep nor a heartbeat may be what flips the flag here
        tv_config.sweep_interval = Duration::from_secs(3600);
        let node = QuizNode::start(tv_config);
        let tv_handle = node.handle();
        let mut tv_snapshots = tv_handle.snapshots();
        tokio::spawn(node.run());

        let mut peer_config = test_config(Role::Peer, "node-test-leave");
        peer_config.heartbeat_interval = Duration::from_secs(3600);
        let peer = QuizNode::start(peer_config);
        let peer_handle = peer.handle();
        tokio::spawn(peer.run());

        peer_handle.raise(UserIntent::Join {
            id: "p1".to_string(),
            name: "Ana".to_string(),
        });
        wait_for(&mut tv_snapshots, |s| {
            s.players.iter().any(|p| p.id == "p1" && p.is_connected)
        })
        .await;

        peer_handle.raise(UserIntent::Leave {
            player_id: "p1".to_string(),
        });

        let snapshot = wait_for(&mut tv_snapshots, |s| {
            s.players.iter().any(|p| p.id == "p1" && !p.is_connected)
        })
        .await;
        assert_eq!(snapshot.players.len(), 1);
    }

    #[tokio::test]
    async fn test_roster_churn_during_results_does_not_restart_auto_advance() {
        let mut config = test_config(Role::Authoritative, "node-test-results-churn");
        config.auto_advance_after = Duration::from_millis(100);
        let node = QuizNode::start(config);
        let handle = node.handle();
        let mut snapshots = handle.snapshots();
        tokio::spawn(node.run());

        handle.raise(UserIntent::Join {
            id: "p1".to_string(),
            name: "Ana".to_string(),
        });
        handle.raise(UserIntent::Start);
        wait_for(&mut snapshots, |s| s.game_state == GamePhase::Playing).await;
        handle.raise(UserIntent::Buzz {
            player_id: "p1".to_string(),
        });
        handle.raise(UserIntent::Answer {
            player_id: "p1".to_string(),
            answer_index: 0,
        });
        wait_for(&mut snapshots, |s| s.game_state == GamePhase::Results).await;

        // Joins keep arriving faster than the countdown for well past it
        let noisy = handle.clone();
        let noise = tokio::spawn(async move {
            for i in 0..60 {
                noisy.raise(UserIntent::Join {
                    id: format!("late-{}", i),
                    name: format!("Late {}", i),
                });
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        });

        let entered_results = Instant::now();
        wait_for(&mut snapshots, |s| {
            s.game_state == GamePhase::Playing && s.current_question_index == 1
        })
        .await;
        assert!(
            entered_results.elapsed() < Duration::from_secs(1),
            "auto-advance was postponed by roster churn"
        );
        noise.abort();
    }

    #[tokio::test]
    async fn test_reset_cancels_auto_advance() {
        let node = QuizNode::start(test_config(Role::Authoritative, "node-test-reset"));
        let handle = node.handle();
        let mut snapshots = handle.snapshots();
        tokio::spawn(node.run());

        handle.raise(UserIntent::Join {
            id: "p1".to_string(),
            name: "Ana".to_string(),
        });
        handle.raise(UserIntent::Start);
        wait_for(&mut snapshots, |s| s.game_state == GamePhase::Playing).await;
        handle.raise(UserIntent::Buzz {
            player_id: "p1".to_string(),
        });
        handle.raise(UserIntent::Answer {
            player_id: "p1".to_string(),
            answer_index: 0,
        });
        wait_for(&mut snapshots, |s| s.game_state == GamePhase::Results).await;

        handle.raise(UserIntent::Reset);
        wait_for(&mut snapshots, |s| s.game_state == GamePhase::Waiting).await;

        // Give the (canceled) timer a chance to misfire
        tokio::time::sleep(Duration::from_millis(150)).await;
        let current = handle.snapshots().borrow().clone();
        assert_eq!(current.game_state, GamePhase::Waiting);
        assert_eq!(current.current_question_index, 0);
    }
}
