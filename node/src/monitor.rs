//! Liveness tracking for joined players, authoritative side.
//!
//! Peers emit heartbeats on a fixed interval; the authoritative node keeps a
//! last-seen entry per player and a coarser periodic sweep reports who went
//! quiet. The sweep only reports each expiry once, so the caller broadcasts
//! a snapshot only when something actually changed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);
pub const PLAYER_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct ConnectionMonitor {
    last_seen: HashMap<String, Instant>,
    timeout: Duration,
}

impl ConnectionMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: HashMap::new(),
            timeout,
        }
    }

    /// Records a heartbeat (or any other sign of life) for the player.
    pub fn record(&mut self, player_id: &str) {
        self.last_seen.insert(player_id.to_string(), Instant::now());
    }

    /// Stops tracking a player, e.g. after an explicit disconnect.
    pub fn forget(&mut self, player_id: &str) {
        self.last_seen.remove(player_id);
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }

    pub fn is_tracked(&self, player_id: &str) -> bool {
        self.last_seen.contains_key(player_id)
    }

    /// Returns the players whose last heartbeat is older than the timeout,
    /// removing them from tracking so each expiry is reported exactly once.
    pub fn sweep(&mut self) -> Vec<String> {
        let timeout = self.timeout;
        let expired: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| seen.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.last_seen.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_heartbeat_survives_sweep() {
        let mut monitor = ConnectionMonitor::new(Duration::from_secs(15));
        monitor.record("p1");
        assert!(monitor.sweep().is_empty());
        assert!(monitor.is_tracked("p1"));
    }

    #[test]
    fn test_stale_heartbeat_expires_once() {
        let mut monitor = ConnectionMonitor::new(Duration::from_millis(0));
        monitor.record("p1");
        std::thread::sleep(Duration::from_millis(5));

        let expired = monitor.sweep();
        assert_eq!(expired, vec!["p1".to_string()]);

        // Already reported; a second sweep is quiet
        assert!(monitor.sweep().is_empty());
        assert!(!monitor.is_tracked("p1"));
    }

    #[test]
    fn test_record_revives_tracking() {
        let mut monitor = ConnectionMonitor::new(Duration::from_millis(0));
        monitor.record("p1");
        std::thread::sleep(Duration::from_millis(5));
        monitor.sweep();

        monitor.record("p1");
        assert!(monitor.is_tracked("p1"));
    }

    #[test]
    fn test_forget_removes_tracking() {
        let mut monitor = ConnectionMonitor::new(Duration::from_secs(15));
        monitor.record("p1");
        monitor.forget("p1");
        assert!(!monitor.is_tracked("p1"));
        assert!(monitor.sweep().is_empty());
    }

    #[test]
    fn test_sweep_only_expires_stale_players() {
        let mut monitor = ConnectionMonitor::new(Duration::from_millis(20));
        monitor.record("stale");
        std::thread::sleep(Duration::from_millis(30));
        monitor.record("fresh");

        let expired = monitor.sweep();
        assert_eq!(expired, vec!["stale".to_string()]);
        assert!(monitor.is_tracked("fresh"));
    }
}
