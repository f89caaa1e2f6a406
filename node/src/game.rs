//! Pure quiz state machine, independent of networking.
//!
//! All transitions run on the authoritative node only. Every mutation bumps
//! the logical clock so the snapshot timestamp strictly increases, which is
//! what peers use for staleness filtering.

use log::info;
use shared::{now_millis, GamePhase, Player, Question, QuizSnapshot, SCORE_PER_CORRECT_ANSWER};

/// What a reset does to the roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Keep the joined players, zero their scores.
    KeepRoster,
    /// Drop the roster entirely, forcing everyone to rejoin.
    ClearRoster,
}

/// Canonical game state owned by the authoritative node.
#[derive(Debug, Clone)]
pub struct QuizGame {
    phase: GamePhase,
    players: Vec<Player>,
    deck: Vec<Question>,
    current_index: usize,
    active_player: Option<String>,
    room_code: String,
    clock: i64,
}

impl QuizGame {
    pub fn new(room_code: impl Into<String>) -> Self {
        Self::with_deck(room_code, shared::question_deck())
    }

    pub fn with_deck(room_code: impl Into<String>, deck: Vec<Question>) -> Self {
        Self {
            phase: GamePhase::Waiting,
            players: Vec::new(),
            deck,
            current_index: 0,
            active_player: None,
            room_code: room_code.into(),
            clock: 0,
        }
    }

    /// Re-seeds the machine from a persisted snapshot. Used at startup after
    /// a reload; the clock resumes from the snapshot so replicas never see it
    /// go backwards.
    pub fn restore(&mut self, snapshot: &QuizSnapshot) {
        self.phase = snapshot.game_state;
        self.players = snapshot.players.clone();
        self.current_index = snapshot.current_question_index;
        self.active_player = snapshot.active_player.clone();
        self.clock = snapshot.timestamp;
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn active_player(&self) -> Option<&str> {
        self.active_player.as_deref()
    }

    fn current_question(&self) -> Option<&Question> {
        match self.phase {
            GamePhase::Playing | GamePhase::Buzzing | GamePhase::Answering | GamePhase::Results => {
                self.deck.get(self.current_index)
            }
            GamePhase::Waiting | GamePhase::Finished => None,
        }
    }

    /// Advances the logical clock past both wall time and the last value.
    fn bump_clock(&mut self) {
        self.clock = now_millis().max(self.clock + 1);
    }

    /// Adds a player, or marks an existing one connected again.
    /// Returns true if the state changed.
    pub fn join(&mut self, id: &str, name: &str) -> bool {
        if let Some(player) = self.players.iter_mut().find(|p| p.id == id) {
            if player.is_connected {
                return false;
            }
            player.is_connected = true;
            info!("Player {} ({}) reconnected", player.name, id);
        } else {
            self.players.push(Player::new(id, name));
            info!("Player {} ({}) joined", name, id);
        }
        self.bump_clock();
        true
    }

    pub fn mark_connected(&mut self, id: &str) -> bool {
        self.set_connected(id, true)
    }

    pub fn mark_disconnected(&mut self, id: &str) -> bool {
        self.set_connected(id, false)
    }

    fn set_connected(&mut self, id: &str, connected: bool) -> bool {
        match self.players.iter_mut().find(|p| p.id == id) {
            Some(player) if player.is_connected != connected => {
                player.is_connected = connected;
                self.bump_clock();
                true
            }
            _ => false,
        }
    }

    /// `waiting -> playing`, loading the first question.
    pub fn start(&mut self) -> bool {
        if self.phase != GamePhase::Waiting || self.deck.is_empty() {
            return false;
        }
        self.phase = GamePhase::Playing;
        self.current_index = 0;
        self.active_player = None;
        self.bump_clock();
        info!("Game started with {} questions", self.deck.len());
        true
    }

    /// `playing -> buzzing`, recording who buzzed first. Ignored in any
    /// other phase so later buzzes lose the race.
    pub fn buzz(&mut self, player_id: &str) -> bool {
        if self.phase != GamePhase::Playing {
            return false;
        }
        if !self.players.iter().any(|p| p.id == player_id) {
            return false;
        }
        self.phase = GamePhase::Buzzing;
        self.active_player = Some(player_id.to_string());
        self.bump_clock();
        true
    }

    /// `buzzing|answering -> results`. Scores only when the active player
    /// answered correctly; the transition happens either way.
    pub fn answer(&mut self, player_id: &str, option_index: usize) -> bool {
        if !matches!(self.phase, GamePhase::Buzzing | GamePhase::Answering) {
            return false;
        }

        let is_active = self.active_player.as_deref() == Some(player_id);
        let is_correct = self
            .deck
            .get(self.current_index)
            .map(|q| q.correct_option_index == option_index)
            .unwrap_or(false);

        if is_active && is_correct {
            if let Some(player) = self.players.iter_mut().find(|p| p.id == player_id) {
                player.score += SCORE_PER_CORRECT_ANSWER;
                info!("Player {} scored, total {}", player.name, player.score);
            }
        }

        self.phase = GamePhase::Results;
        self.bump_clock();
        true
    }

    /// `results -> playing` with the next question, or `results -> finished`
    /// when the deck is exhausted.
    pub fn advance(&mut self) -> bool {
        if self.phase != GamePhase::Results {
            return false;
        }

        let next_index = self.current_index + 1;
        if next_index >= self.deck.len() {
            self.phase = GamePhase::Finished;
            info!("Quiz finished after {} questions", self.deck.len());
        } else {
            self.current_index = next_index;
            self.phase = GamePhase::Playing;
        }
        self.active_player = None;
        self.bump_clock();
        true
    }

    /// `any -> waiting`. Scores are zeroed; in [`ResetMode::ClearRoster`]
    /// the players are dropped entirely.
    pub fn reset(&mut self, mode: ResetMode) -> bool {
        match mode {
            ResetMode::KeepRoster => {
                for player in &mut self.players {
                    player.score = 0;
                }
            }
            ResetMode::ClearRoster => self.players.clear(),
        }
        self.phase = GamePhase::Waiting;
        self.current_index = 0;
        self.active_player = None;
        self.bump_clock();
        info!("Game reset ({:?})", mode);
        true
    }

    /// Current state as a wire snapshot.
    pub fn snapshot(&self) -> QuizSnapshot {
        QuizSnapshot {
            players: self.players.clone(),
            current_question: self.current_question().cloned(),
            current_question_index: self.current_index,
            game_state: self.phase,
            active_player: self.active_player.clone(),
            total_questions: self.deck.len(),
            room_code: self.room_code.clone(),
            timestamp: self.clock,
        }
    }

    /// Snapshot stamped with a fresh clock value, for answering sync
    /// requests.
    pub fn snapshot_now(&mut self) -> QuizSnapshot {
        self.bump_clock();
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playing_game() -> QuizGame {
        let mut game = QuizGame::new("ROOM");
        game.join("p1", "Ana");
        game.join("p2", "Ben");
        game.start();
        game
    }

    fn correct_index(game: &QuizGame) -> usize {
        game.snapshot()
            .current_question
            .expect("question loaded")
            .correct_option_index
    }

    #[test]
    fn test_initial_state_is_waiting() {
        let game = QuizGame::new("ROOM");
        let snapshot = game.snapshot();
        assert_eq!(snapshot.game_state, GamePhase::Waiting);
        assert!(snapshot.players.is_empty());
        assert!(snapshot.current_question.is_none());
        assert_eq!(snapshot.current_question_index, 0);
    }

    #[test]
    fn test_join_dedup_by_id() {
        let mut game = QuizGame::new("ROOM");
        assert!(game.join("p1", "Ana"));
        game.mark_disconnected("p1");
        assert!(game.join("p1", "Ana"));
        assert!(!game.join("p1", "Ana"));

        assert_eq!(game.players().len(), 1);
        assert!(game.players()[0].is_connected);
    }

    #[test]
    fn test_start_loads_first_question() {
        let mut game = QuizGame::new("ROOM");
        game.join("p1", "Ana");
        assert!(game.start());

        let snapshot = game.snapshot();
        assert_eq!(snapshot.game_state, GamePhase::Playing);
        assert_eq!(snapshot.current_question_index, 0);
        assert!(snapshot.current_question.is_some());
    }

    #[test]
    fn test_start_only_from_waiting() {
        let mut game = playing_game();
        assert!(!game.start());
        assert_eq!(game.phase(), GamePhase::Playing);
    }

    #[test]
    fn test_buzz_records_active_player() {
        let mut game = playing_game();
        assert!(game.buzz("p1"));
        assert_eq!(game.phase(), GamePhase::Buzzing);
        assert_eq!(game.active_player(), Some("p1"));

        // Second buzz loses the race
        assert!(!game.buzz("p2"));
        assert_eq!(game.active_player(), Some("p1"));
    }

    #[test]
    fn test_buzz_ignored_outside_playing() {
        let mut game = QuizGame::new("ROOM");
        game.join("p1", "Ana");
        assert!(!game.buzz("p1"));
        assert_eq!(game.phase(), GamePhase::Waiting);
    }

    #[test]
    fn test_buzz_from_unknown_player_ignored() {
        let mut game = playing_game();
        assert!(!game.buzz("ghost"));
        assert_eq!(game.phase(), GamePhase::Playing);
    }

    #[test]
    fn test_correct_answer_scores_ten() {
        let mut game = playing_game();
        let correct = correct_index(&game);
        game.buzz("p1");

        assert!(game.answer("p1", correct));

        let snapshot = game.snapshot();
        assert_eq!(snapshot.game_state, GamePhase::Results);
        let p1 = snapshot.players.iter().find(|p| p.id == "p1").unwrap();
        assert_eq!(p1.score, SCORE_PER_CORRECT_ANSWER);
    }

    #[test]
    fn test_wrong_answer_still_reaches_results() {
        let mut game = playing_game();
        let correct = correct_index(&game);
        let wrong = (correct + 1) % 4;
        game.buzz("p1");

        assert!(game.answer("p1", wrong));

        let snapshot = game.snapshot();
        assert_eq!(snapshot.game_state, GamePhase::Results);
        assert!(snapshot.players.iter().all(|p| p.score == 0));
    }

    #[test]
    fn test_answer_from_non_active_player_never_scores() {
        let mut game = playing_game();
        let correct = correct_index(&game);
        game.buzz("p1");

        assert!(game.answer("p2", correct));

        let snapshot = game.snapshot();
        assert_eq!(snapshot.game_state, GamePhase::Results);
        assert!(snapshot.players.iter().all(|p| p.score == 0));
    }

    #[test]
    fn test_answer_ignored_outside_buzzing() {
        let mut game = playing_game();
        assert!(!game.answer("p1", 0));
        assert_eq!(game.phase(), GamePhase::Playing);
    }

    #[test]
    fn test_advance_moves_to_next_question() {
        let mut game = playing_game();
        game.buzz("p1");
        game.answer("p1", 0);

        assert!(game.advance());

        let snapshot = game.snapshot();
        assert_eq!(snapshot.game_state, GamePhase::Playing);
        assert_eq!(snapshot.current_question_index, 1);
        assert!(snapshot.active_player.is_none());
    }

    #[test]
    fn test_advance_only_from_results() {
        let mut game = playing_game();
        assert!(!game.advance());
        assert_eq!(game.snapshot().current_question_index, 0);
    }

    #[test]
    fn test_finish_boundary() {
        let mut game = playing_game();
        let total = game.snapshot().total_questions;

        for _ in 0..total {
            game.buzz("p1");
            let correct = correct_index(&game);
            game.answer("p1", correct);
            game.advance();
        }

        let snapshot = game.snapshot();
        assert_eq!(snapshot.game_state, GamePhase::Finished);
        assert!(snapshot.current_question.is_none());
        assert!(snapshot.active_player.is_none());
        let p1 = snapshot.players.iter().find(|p| p.id == "p1").unwrap();
        assert_eq!(p1.score, total as u32 * SCORE_PER_CORRECT_ANSWER);
    }

    #[test]
    fn test_reset_keep_roster_zeroes_scores() {
        let mut game = playing_game();
        game.buzz("p1");
        let correct = correct_index(&game);
        game.answer("p1", correct);

        assert!(game.reset(ResetMode::KeepRoster));

        let snapshot = game.snapshot();
        assert_eq!(snapshot.game_state, GamePhase::Waiting);
        assert_eq!(snapshot.players.len(), 2);
        assert!(snapshot.players.iter().all(|p| p.score == 0));
        assert!(snapshot.current_question.is_none());
    }

    #[test]
    fn test_reset_clear_roster_drops_players() {
        let mut game = playing_game();
        assert!(game.reset(ResetMode::ClearRoster));
        assert!(game.players().is_empty());
        assert_eq!(game.phase(), GamePhase::Waiting);
    }

    #[test]
    fn test_reset_exits_finished() {
        let mut game = playing_game();
        for _ in 0..game.snapshot().total_questions {
            game.buzz("p1");
            game.answer("p1", 0);
            game.advance();
        }
        assert_eq!(game.phase(), GamePhase::Finished);

        game.reset(ResetMode::KeepRoster);
        assert_eq!(game.phase(), GamePhase::Waiting);
    }

    #[test]
    fn test_clock_strictly_increases_on_mutation() {
        let mut game = QuizGame::new("ROOM");
        let mut last = game.snapshot().timestamp;

        game.join("p1", "Ana");
        let t1 = game.snapshot().timestamp;
        assert!(t1 > last);
        last = t1;

        game.join("p2", "Ben");
        game.start();
        game.buzz("p1");
        game.answer("p1", 0);
        game.advance();
        let t2 = game.snapshot().timestamp;
        assert!(t2 > last);
    }

    #[test]
    fn test_restore_resumes_clock() {
        let mut game = playing_game();
        let snapshot = game.snapshot();

        let mut restored = QuizGame::new("ROOM");
        restored.restore(&snapshot);

        assert_eq!(restored.snapshot(), snapshot);

        restored.buzz("p1");
        assert!(restored.snapshot().timestamp > snapshot.timestamp);
    }

    #[test]
    fn test_snapshot_now_bumps_clock() {
        let mut game = QuizGame::new("ROOM");
        let a = game.snapshot_now().timestamp;
        let b = game.snapshot_now().timestamp;
        assert!(b > a);
    }
}
