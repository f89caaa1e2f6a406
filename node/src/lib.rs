//! # Quiz Node Library
//!
//! Runtime for a quiz device: either the authoritative presentation node
//! that owns the canonical game state, or a read-only peer that mirrors it.
//!
//! ## Architecture Overview
//!
//! Every node runs one event loop ([`node::QuizNode::run`]) that owns all
//! state. Inputs arrive as discrete events: envelopes and channel
//! transitions from the transport, user intents from the local UI, and the
//! heartbeat, sweep and auto-advance timers. No state is touched outside
//! that loop, so handlers never race each other.
//!
//! Replication is full-snapshot: after every mutation the authoritative
//! node broadcasts its entire state, stamped with a monotonic logical
//! clock. Peers keep whichever snapshot carries the highest timestamp and
//! forward their own button presses as intents for the authority to apply.
//!
//! ## Module Organization
//!
//! - [`game`]: quiz rules, the phase machine and scoring
//! - [`replicator`]: role-gated envelope and intent handling
//! - [`transport`]: relay WebSocket link with local broadcast fallback
//! - [`local_bus`]: in-process named broadcast channels
//! - [`monitor`]: heartbeat bookkeeping and player expiry
//! - [`backup`]: best-effort snapshot and identity persistence
//! - [`node`]: the event loop tying the pieces together

pub mod backup;
pub mod game;
pub mod local_bus;
pub mod monitor;
pub mod node;
pub mod replicator;
pub mod transport;
