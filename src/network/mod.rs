//! Network Layer
//!
//! WebSocket transport, room fan-out, matchmaking and the per-room session
//! tasks. All timing and concurrency lives here; `game/` stays pure.

pub mod auth;
pub mod broadcast;
pub mod handler;
pub mod matchmaking;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use auth::{resolve_identity, validate_token, AuthConfig, AuthError, TokenClaims};
pub use broadcast::{BroadcastHub, ConnectionId, Eviction, HubError};
pub use handler::{ConnectionHandler, ServerContext};
pub use matchmaking::{MatchTicket, MatchmakingConfig, MatchmakingError, MatchmakingQueue, WaitStatus};
pub use protocol::{ClientMessage, ErrorCode, GameEvent, ServerMessage};
pub use registry::SessionRegistry;
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{
    GameSession, JoinOutcome, SessionConfig, SessionError, SessionHandle, SessionPhase,
    SessionSnapshot,
};
