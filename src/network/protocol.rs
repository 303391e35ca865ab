//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON text message. Optional fields that are absent are
//! left out of the frame entirely.

use serde::{Deserialize, Serialize};

use crate::game::state::{Ball, PlayerSlot, RoomId, Score};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Enter a room in the given seat.
    JoinGame {
        /// Room to join.
        game_id: RoomId,
        /// Seat to take.
        player_number: PlayerSlot,
    },

    /// Move this connection's paddle.
    PaddleMove {
        /// New paddle x offset.
        position: f64,
    },

    /// Abort the game.
    GameInterrupted {
        /// Free-form reason relayed to the other participant.
        #[serde(default)]
        reason: Option<String>,
        /// Room, for sockets that never joined (e.g. after a page reload).
        #[serde(default)]
        game_id: Option<RoomId>,
        /// Seat the client claims. The seat is resolved server-side instead.
        #[serde(default)]
        player_number: Option<PlayerSlot>,
    },

    /// Enter the matchmaking queue.
    MatchRequest(MatchRequest),

    /// Leave the matchmaking queue.
    CancelMatching,
}

/// Matchmaking request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    /// Display name shown to the opponent.
    #[serde(default = "default_username")]
    pub username: String,
    /// Avatar reference shown to the opponent.
    #[serde(default)]
    pub avatar: Option<String>,
}

fn default_username() -> String {
    "Unknown Player".to_string()
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Event produced by a room.
    GameMessage(GameEvent),

    /// Matchmaking progress.
    MatchStatus {
        /// Human-readable status.
        message: String,
    },

    /// Opponent found and game record created.
    MatchFound(MatchFoundInfo),

    /// Request could not be served.
    Error(ServerError),
}

/// Room events, tagged by `event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEvent {
    /// A participant entered the room.
    PlayerJoined {
        /// Seat taken.
        player_number: PlayerSlot,
    },

    /// Countdown over; the ball is live.
    GameStart,

    /// A participant moved their paddle.
    PaddleMove {
        /// New paddle x offset.
        position: f64,
        /// Seat that moved.
        player_number: PlayerSlot,
    },

    /// Per-tick state.
    GameStateUpdate {
        /// Ball position and velocity.
        ball: Ball,
        /// Current score.
        score: Score,
    },

    /// A player reached the winning score.
    GameEnd {
        /// Winning seat.
        winner: PlayerSlot,
        /// Final score.
        score: Score,
    },

    /// The game was aborted.
    GameInterrupted {
        /// Why it was aborted.
        reason: String,
        /// Seat that caused it, when known.
        #[serde(skip_serializing_if = "Option::is_none", default)]
        player_number: Option<PlayerSlot>,
    },
}

impl GameEvent {
    /// High-rate events kept out of diagnostic logs.
    pub fn is_high_frequency(&self) -> bool {
        matches!(self, GameEvent::PaddleMove { .. } | GameEvent::GameStateUpdate { .. })
    }
}

/// Opponent shown on match-found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpponentInfo {
    /// Display name.
    pub username: String,
    /// Avatar reference.
    pub avatar: Option<String>,
}

/// Match-found notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFoundInfo {
    /// Game record id.
    pub game_id: String,
    /// Room to send in `join_game`.
    pub game_room: RoomId,
    /// Seat assigned to the recipient.
    pub player_number: PlayerSlot,
    /// The other player.
    pub opponent: OpponentInfo,
}

/// Server error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be parsed.
    InvalidMessage,
    /// Operation requires a joined room.
    NotInRoom,
    /// The room is gone or not accepting the request.
    RoomUnavailable,
    /// Match could not be recorded; the request stays queued.
    MatchmakingFailed,
}

impl ServerMessage {
    /// Wrap a room event.
    pub fn game(event: GameEvent) -> Self {
        ServerMessage::GameMessage(event)
    }

    /// Build an error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }

    /// High-rate messages kept out of diagnostic logs.
    pub fn is_high_frequency(&self) -> bool {
        matches!(self, ServerMessage::GameMessage(event) if event.is_high_frequency())
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn to_value(msg: &ServerMessage) -> Value {
        serde_json::from_str(&msg.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_parse_browser_frames() {
        let join = ClientMessage::from_json(
            r#"{"type":"join_game","game_id":"game_abc","player_number":2}"#,
        )
        .unwrap();
        assert_eq!(
            join,
            ClientMessage::JoinGame {
                game_id: RoomId::new("game_abc"),
                player_number: PlayerSlot::Two,
            }
        );

        // Extra fields sent by the browser are ignored.
        let paddle = ClientMessage::from_json(
            r#"{"type":"paddle_move","game_id":"game_abc","player_number":1,"position":-3.5}"#,
        )
        .unwrap();
        assert_eq!(paddle, ClientMessage::PaddleMove { position: -3.5 });

        let cancel = ClientMessage::from_json(r#"{"type":"cancel_matching"}"#).unwrap();
        assert_eq!(cancel, ClientMessage::CancelMatching);
    }

    #[test]
    fn test_interrupt_and_match_request_defaults() {
        let interrupt = ClientMessage::from_json(r#"{"type":"game_interrupted"}"#).unwrap();
        assert_eq!(
            interrupt,
            ClientMessage::GameInterrupted {
                reason: None,
                game_id: None,
                player_number: None,
            }
        );

        let request = ClientMessage::from_json(r#"{"type":"match_request"}"#).unwrap();
        assert_eq!(
            request,
            ClientMessage::MatchRequest(MatchRequest {
                username: "Unknown Player".to_string(),
                avatar: None,
            })
        );
    }

    #[test]
    fn test_rejects_bad_slot_and_unknown_type() {
        assert!(ClientMessage::from_json(
            r#"{"type":"join_game","game_id":"g","player_number":3}"#
        )
        .is_err());
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
        assert!(ClientMessage::from_json("not json").is_err());
    }

    #[test]
    fn test_game_message_envelope() {
        let msg = ServerMessage::game(GameEvent::PaddleMove {
            position: 1.5,
            player_number: PlayerSlot::One,
        });
        assert_eq!(
            to_value(&msg),
            json!({"type": "game_message", "event": "paddle_move", "position": 1.5, "player_number": 1})
        );
        assert!(msg.is_high_frequency());

        let start = ServerMessage::game(GameEvent::GameStart);
        assert_eq!(to_value(&start), json!({"type": "game_message", "event": "game_start"}));
        assert!(!start.is_high_frequency());
    }

    #[test]
    fn test_game_end_wire_format() {
        let msg = ServerMessage::game(GameEvent::GameEnd {
            winner: PlayerSlot::Two,
            score: Score { player1: 0, player2: 3 },
        });
        assert_eq!(
            to_value(&msg),
            json!({
                "type": "game_message",
                "event": "game_end",
                "winner": 2,
                "score": {"player1": 0, "player2": 3}
            })
        );
    }

    #[test]
    fn test_absent_fields_are_omitted() {
        let msg = ServerMessage::game(GameEvent::GameInterrupted {
            reason: "internal error".to_string(),
            player_number: None,
        });
        let value = to_value(&msg);
        assert_eq!(value["reason"], "internal error");
        assert!(value.get("player_number").is_none());
        assert!(value.get("winner").is_none());
    }

    #[test]
    fn test_state_update_carries_ball() {
        let msg = ServerMessage::game(GameEvent::GameStateUpdate {
            ball: Ball::kickoff(),
            score: Score::default(),
        });
        let value = to_value(&msg);
        assert_eq!(value["event"], "game_state_update");
        assert_eq!(value["ball"]["y"], 1.0);
        assert_eq!(value["ball"]["velocity"]["z"], 0.3);
        assert!(msg.is_high_frequency());

        let parsed = ServerMessage::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_matchmaking_messages() {
        let found = ServerMessage::MatchFound(MatchFoundInfo {
            game_id: "42".to_string(),
            game_room: RoomId::new("game_42"),
            player_number: PlayerSlot::One,
            opponent: OpponentInfo {
                username: "Bob".to_string(),
                avatar: None,
            },
        });
        let value = to_value(&found);
        assert_eq!(value["type"], "match_found");
        assert_eq!(value["game_room"], "game_42");
        assert_eq!(value["opponent"]["username"], "Bob");

        let status = ServerMessage::MatchStatus {
            message: "Waiting for opponent...".to_string(),
        };
        assert_eq!(
            to_value(&status),
            json!({"type": "match_status", "message": "Waiting for opponent..."})
        );

        let error = ServerMessage::error(ErrorCode::MatchmakingFailed, "try again");
        assert!(error.to_json().unwrap().contains("matchmaking_failed"));
    }
}
