//! # Quiz Relay Library
//!
//! A stateless WebSocket rebroadcaster for LAN quiz rooms. Nodes connect,
//! the relay greets each one, and from then on every frame a node sends is
//! fanned out verbatim to all other connected nodes. The relay keeps no
//! game state, so restarting it mid-game loses nothing.
//!
//! ## Module Organization
//!
//! - [`server`]: listener, per-connection tasks and liveness pings
//! - [`session`]: session objects and the shared registry

pub mod server;
pub mod session;

pub use server::{Relay, RelayConfig};
