//! Game Logic Module
//!
//! Pong simulation with no I/O and no clocks of its own.
//!
//! ## Module Structure
//!
//! - `state`: Room id, slots, ball, paddles, score and lifecycle flags
//! - `physics`: Per-tick ball movement, rebounds and goals

pub mod physics;
pub mod state;

// Re-export key types
pub use physics::{Field, PhysicsError, TickOutcome};
pub use state::{Ball, PlayerSlot, RoomId, Score, SessionState, Velocity};
