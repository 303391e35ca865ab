//! # Pong Server
//!
//! Real-time multiplayer core for online Pong: matchmaking, per-room
//! authoritative simulation and WebSocket fan-out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        PONG SERVER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  game/            - Simulation (pure, single-owner)          │
//! │  ├── state.rs     - Room, slots, ball, paddles, score        │
//! │  └── physics.rs   - Tick step, rebounds, goals               │
//! │                                                              │
//! │  network/         - Concurrency and transport                │
//! │  ├── session.rs   - One task per room, phase machine         │
//! │  ├── registry.rs  - Room → session map and supervision       │
//! │  ├── matchmaking.rs - FIFO pairing queue                     │
//! │  ├── broadcast.rs - Connection directory, room groups        │
//! │  ├── handler.rs   - Per-connection protocol adapter          │
//! │  ├── protocol.rs  - JSON wire messages                       │
//! │  ├── auth.rs      - JWT identity from the handshake          │
//! │  └── server.rs    - WebSocket accept loop                    │
//! │                                                              │
//! │  persistence.rs   - Game/player record gateway               │
//! │  config.rs        - Environment configuration                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//!
//! Each room's [`SessionState`] is owned by exactly one task. Joins, paddle
//! moves, interrupts and disconnects reach it through that task's command
//! queue, so every event of a room is produced by a single writer and
//! delivered in order. The registry and the matchmaking queue are each
//! guarded by one lock.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod game;
pub mod network;
pub mod persistence;

// Re-export commonly used types
pub use config::{AppConfig, ConfigError};
pub use game::state::{Ball, PlayerSlot, RoomId, Score, SessionState};
pub use network::server::{GameServer, GameServerError};
pub use persistence::{InMemoryGateway, PersistenceGateway};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
