use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const SCORE_PER_CORRECT_ANSWER: u32 = 10;
pub const DEFAULT_ROOM_CODE: &str = "QUIZ123";
pub const DEFAULT_RELAY_PORT: u16 = 8081;
pub const RELAY_DEVICE_ID: &str = "relay";

/// A quiz participant as tracked by the authoritative node.
///
/// `id` is stable across reconnects (the peer persists it locally), so a
/// rejoin with a known id restores the same entry instead of duplicating it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: String,
    pub name: String,
    pub score: u32,
    pub is_connected: bool,
}

impl Player {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            score: 0,
            is_connected: true,
        }
    }
}

/// One quiz question. Immutable once loaded from the deck.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub text: String,
    pub options: Vec<String>,
    pub correct_option_index: usize,
}

/// The finite set of game phases. Only the authoritative node transitions
/// between them.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GamePhase {
    Waiting,
    Playing,
    Buzzing,
    Answering,
    Results,
    Finished,
}

/// Full serialization of the aggregate game state.
///
/// Snapshots are broadcast wholesale, never as diffs. `timestamp` is a
/// logical clock set by the authoritative node on every mutation and is the
/// sole ordering/staleness signal on the wire.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizSnapshot {
    pub players: Vec<Player>,
    pub current_question: Option<Question>,
    pub current_question_index: usize,
    pub game_state: GamePhase,
    pub active_player: Option<String>,
    pub total_questions: usize,
    pub room_code: String,
    pub timestamp: i64,
}

impl QuizSnapshot {
    /// An empty lobby snapshot for the given room.
    pub fn waiting(room_code: impl Into<String>, total_questions: usize) -> Self {
        Self {
            players: Vec::new(),
            current_question: None,
            current_question_index: 0,
            game_state: GamePhase::Waiting,
            active_player: None,
            total_questions,
            room_code: room_code.into(),
            timestamp: 0,
        }
    }
}

/// Typed envelope payload: the `type`/`data` pair of the wire format.
///
/// Modeled as a closed sum type so adding a message type is a compile-time
/// checked change everywhere envelopes are matched.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum Payload {
    PlayerJoined { id: String, name: String },
    PlayerBuzz { player_id: String },
    PlayerAnswer { player_id: String, answer_index: usize },
    StateSync(QuizSnapshot),
    SyncRequest {},
    Heartbeat { player_id: String, timestamp: i64 },
    PlayerDisconnect { player_id: String },
    ServerReady { message: String },
    GameReset {},
}

impl Payload {
    /// Wire tag of this payload, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::PlayerJoined { .. } => "PLAYER_JOINED",
            Payload::PlayerBuzz { .. } => "PLAYER_BUZZ",
            Payload::PlayerAnswer { .. } => "PLAYER_ANSWER",
            Payload::StateSync(_) => "STATE_SYNC",
            Payload::SyncRequest {} => "SYNC_REQUEST",
            Payload::Heartbeat { .. } => "HEARTBEAT",
            Payload::PlayerDisconnect { .. } => "PLAYER_DISCONNECT",
            Payload::ServerReady { .. } => "SERVER_READY",
            Payload::GameReset {} => "GAME_RESET",
        }
    }

    /// Whether this payload is worth buffering while no channel is up.
    /// Only buzzes, answers and snapshots survive an outage.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Payload::PlayerBuzz { .. } | Payload::PlayerAnswer { .. } | Payload::StateSync(_)
        )
    }
}

/// The wire unit moved between nodes, identical over the relay socket and
/// the local bus. `device_id` identifies the sending node and is used to
/// discard self-originated echoes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: Payload,
    pub timestamp: i64,
    pub device_id: String,
}

impl Envelope {
    pub fn new(payload: Payload, device_id: impl Into<String>) -> Self {
        Self {
            payload,
            timestamp: now_millis(),
            device_id: device_id.into(),
        }
    }
}

/// Current wall-clock time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis()
        .min(i64::MAX as u128) as i64
}

/// The static ordered question sequence every node ships with.
pub fn question_deck() -> Vec<Question> {
    fn q(id: &str, text: &str, options: [&str; 4], correct: usize) -> Question {
        Question {
            id: id.to_string(),
            text: text.to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
            correct_option_index: correct,
        }
    }

    vec![
        q(
            "1",
            "Which planet is known as the Red Planet?",
            ["Venus", "Mars", "Jupiter", "Mercury"],
            1,
        ),
        q(
            "2",
            "What is the chemical symbol for gold?",
            ["Au", "Ag", "Gd", "Go"],
            0,
        ),
        q(
            "3",
            "How many strings does a standard violin have?",
            ["Three", "Five", "Four", "Six"],
            2,
        ),
        q(
            "4",
            "Which ocean is the largest by surface area?",
            ["Atlantic", "Indian", "Arctic", "Pacific"],
            3,
        ),
        q(
            "5",
            "In which year did humans first land on the Moon?",
            ["1965", "1969", "1972", "1958"],
            1,
        ),
    ]
}
