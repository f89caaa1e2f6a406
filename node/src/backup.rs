//! Best-effort local persistence: the last known snapshot (to survive a
//! restart) and the peer's player identity (so a rejoin restores the same
//! roster entry). Neither file is ever treated as authoritative; a corrupt
//! or missing file just means starting from the defaults.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use shared::QuizSnapshot;
use std::fs;
use std::path::{Path, PathBuf};

const SNAPSHOT_FILE: &str = "snapshot.json";
const IDENTITY_FILE: &str = "identity.json";

/// Stable local identity of this device and (for peers) its player.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlayerIdentity {
    pub device_id: String,
    pub player_id: Option<String>,
    pub player_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SNAPSHOT_FILE),
        }
    }

    /// Reads the persisted snapshot. Corruption is not fatal; the node
    /// starts from the default waiting state instead.
    pub fn load(&self) -> Option<QuizSnapshot> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return None,
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => {
                debug!("Restored snapshot from {}", self.path.display());
                Some(snapshot)
            }
            Err(e) => {
                warn!(
                    "Ignoring corrupt snapshot backup at {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    /// Writes the snapshot, best effort. Failures are logged, never raised.
    pub fn save(&self, snapshot: &QuizSnapshot) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string(snapshot) {
            Ok(raw) => {
                if let Err(e) = fs::write(&self.path, raw) {
                    warn!("Failed to write snapshot backup: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode snapshot backup: {}", e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(IDENTITY_FILE),
        }
    }

    pub fn load(&self) -> Option<PlayerIdentity> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!("Ignoring corrupt identity file: {}", e);
                None
            }
        }
    }

    /// Loads the stored identity or mints a fresh device id.
    pub fn load_or_create(&self) -> PlayerIdentity {
        self.load().unwrap_or_else(|| PlayerIdentity {
            device_id: crate::transport::random_device_id(),
            player_id: None,
            player_name: None,
        })
    }

    pub fn save(&self, identity: &PlayerIdentity) {
        if let Some(parent) = self.path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_string(identity) {
            Ok(raw) => {
                if let Err(e) = fs::write(&self.path, raw) {
                    warn!("Failed to write identity file: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode identity: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{GamePhase, Player};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("quiz-backup-{}-{}", tag, nanos));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = scratch_dir("roundtrip");
        let store = SnapshotStore::new(&dir);

        let mut snapshot = QuizSnapshot::waiting("ROOM", 5);
        snapshot.timestamp = 4242;
        snapshot.players.push(Player::new("p1", "Ana"));

        store.save(&snapshot);
        let loaded = store.load().expect("snapshot should load");
        assert_eq!(loaded, snapshot);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let dir = scratch_dir("missing");
        let store = SnapshotStore::new(&dir);
        assert!(store.load().is_none());
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_corrupt_snapshot_is_ignored() {
        let dir = scratch_dir("corrupt");
        fs::write(dir.join(SNAPSHOT_FILE), "{ not valid json").unwrap();

        let store = SnapshotStore::new(&dir);
        assert!(store.load().is_none());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_save_overwrites_previous_snapshot() {
        let dir = scratch_dir("overwrite");
        let store = SnapshotStore::new(&dir);

        let mut first = QuizSnapshot::waiting("ROOM", 5);
        first.timestamp = 1;
        store.save(&first);

        let mut second = QuizSnapshot::waiting("ROOM", 5);
        second.timestamp = 2;
        second.game_state = GamePhase::Playing;
        store.save(&second);

        assert_eq!(store.load().unwrap(), second);
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn test_identity_roundtrip_and_mint() {
        let dir = scratch_dir("identity");
        let store = IdentityStore::new(&dir);

        let minted = store.load_or_create();
        assert!(!minted.device_id.is_empty());
        assert!(minted.player_id.is_none());

        let identity = PlayerIdentity {
            device_id: minted.device_id.clone(),
            player_id: Some("p1".to_string()),
            player_name: Some("Ana".to_string()),
        };
        store.save(&identity);

        // A reload now restores the same identity instead of minting
        assert_eq!(store.load_or_create(), identity);

        fs::remove_dir_all(dir).ok();
    }
}
