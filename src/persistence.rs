//! Persistence Gateway
//!
//! Narrow interface to the game/player record store owned by the surrounding
//! application. The session core only creates records at match time and
//! submits the final score; schema and storage are not its concern.
//!
//! [`InMemoryGateway`] backs the standalone binary and the tests.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::game::state::{PlayerSlot, Score};

/// Reference to an authenticated user, opaque to the core.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityRef(pub String);

impl fmt::Display for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Game record identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GameId(pub uuid::Uuid);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Player record identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerRecordId(pub uuid::Uuid);

/// Game modes known to the record store. Matchmaking only creates `Remote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Two players on one keyboard.
    Local,
    /// Matchmade online game.
    Remote,
    /// Tournament match.
    Tournament,
}

/// Persistence errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    /// Referenced record does not exist.
    #[error("game record {0} not found")]
    GameNotFound(GameId),

    /// Backend refused or failed the operation.
    #[error("persistence backend error: {0}")]
    Backend(String),

    /// The call did not complete in time.
    #[error("persistence call timed out")]
    Timeout,
}

/// Record store used by matchmaking and end-of-game reporting.
///
/// Calls are awaited from boundary tasks, never from a tick.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Create a game record and return its id.
    async fn create_game_record(&self, mode: GameMode) -> Result<GameId, PersistenceError>;

    /// Create the record for one seat of a game.
    async fn create_player_record(
        &self,
        game: GameId,
        slot: PlayerSlot,
        nickname: &str,
        identity: Option<&IdentityRef>,
    ) -> Result<PlayerRecordId, PersistenceError>;

    /// Store per-slot scores and the winner's identity, if any.
    async fn record_final_result(
        &self,
        game: GameId,
        score: Score,
        winner: Option<&IdentityRef>,
    ) -> Result<(), PersistenceError>;
}

// =============================================================================
// IN-MEMORY GATEWAY
// =============================================================================

/// Stored game record.
#[derive(Debug, Clone, PartialEq)]
pub struct GameRecord {
    /// Record id.
    pub id: GameId,
    /// Game mode.
    pub mode: GameMode,
    /// When the record was created.
    pub played_at: DateTime<Utc>,
    /// Winner identity once the result is in.
    pub winner: Option<IdentityRef>,
    /// Seats, in slot order.
    pub players: BTreeMap<PlayerSlot, PlayerRecord>,
}

/// Stored player record.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRecord {
    /// Record id.
    pub id: PlayerRecordId,
    /// Display name at match time.
    pub nickname: String,
    /// Authenticated user, if any.
    pub identity: Option<IdentityRef>,
    /// Final score.
    pub score: u32,
}

/// Gateway keeping records in process memory.
#[derive(Default)]
pub struct InMemoryGateway {
    games: RwLock<BTreeMap<GameId, GameRecord>>,
}

impl InMemoryGateway {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of a game record.
    pub async fn game(&self, id: GameId) -> Option<GameRecord> {
        self.games.read().await.get(&id).cloned()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn create_game_record(&self, mode: GameMode) -> Result<GameId, PersistenceError> {
        let id = GameId(uuid::Uuid::new_v4());
        let record = GameRecord {
            id,
            mode,
            played_at: Utc::now(),
            winner: None,
            players: BTreeMap::new(),
        };
        self.games.write().await.insert(id, record);
        debug!("Created game record {}", id);
        Ok(id)
    }

    async fn create_player_record(
        &self,
        game: GameId,
        slot: PlayerSlot,
        nickname: &str,
        identity: Option<&IdentityRef>,
    ) -> Result<PlayerRecordId, PersistenceError> {
        let mut games = self.games.write().await;
        let record = games.get_mut(&game).ok_or(PersistenceError::GameNotFound(game))?;

        let id = PlayerRecordId(uuid::Uuid::new_v4());
        record.players.insert(
            slot,
            PlayerRecord {
                id,
                nickname: nickname.to_string(),
                identity: identity.cloned(),
                score: 0,
            },
        );
        Ok(id)
    }

    async fn record_final_result(
        &self,
        game: GameId,
        score: Score,
        winner: Option<&IdentityRef>,
    ) -> Result<(), PersistenceError> {
        let mut games = self.games.write().await;
        let record = games.get_mut(&game).ok_or(PersistenceError::GameNotFound(game))?;

        for (slot, player) in record.players.iter_mut() {
            player.score = score.get(*slot);
        }
        if let Some(winner) = winner {
            record.winner = Some(winner.clone());
        }
        Ok(())
    }
}
