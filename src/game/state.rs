//! Session State Definitions
//!
//! Pure data model for one Pong session: ball, paddles, score and the
//! lifecycle flags. Owned by exactly one session task; nothing here is
//! shared or synchronized.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

// =============================================================================
// ROOM ID
// =============================================================================

/// Prefix used for rooms created by matchmaking (`game_<record id>`).
pub const ROOM_PREFIX: &str = "game_";

/// Opaque room identifier, immutable for the lifetime of a session.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap an arbitrary room identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Room for a persisted game record.
    pub fn for_game(record: uuid::Uuid) -> Self {
        Self(format!("{ROOM_PREFIX}{record}"))
    }

    /// Recover the game record id, if this room was created for one.
    pub fn game_record(&self) -> Option<uuid::Uuid> {
        self.0
            .strip_prefix(ROOM_PREFIX)
            .and_then(|rest| uuid::Uuid::parse_str(rest).ok())
    }

    /// Borrow the raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// PLAYER SLOT
// =============================================================================

/// A player's seat within a session. Serialized as the bare number 1 or 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PlayerSlot {
    /// Seat 1, defends the +z end.
    One,
    /// Seat 2, defends the -z end.
    Two,
}

impl PlayerSlot {
    /// Both slots in seat order.
    pub const ALL: [PlayerSlot; 2] = [PlayerSlot::One, PlayerSlot::Two];

    /// The other seat.
    pub fn opponent(self) -> Self {
        match self {
            PlayerSlot::One => PlayerSlot::Two,
            PlayerSlot::Two => PlayerSlot::One,
        }
    }

    /// Seat number as sent on the wire.
    pub fn number(self) -> u8 {
        match self {
            PlayerSlot::One => 1,
            PlayerSlot::Two => 2,
        }
    }
}

impl TryFrom<u8> for PlayerSlot {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PlayerSlot::One),
            2 => Ok(PlayerSlot::Two),
            other => Err(format!("invalid player slot {other}, expected 1 or 2")),
        }
    }
}

impl From<PlayerSlot> for u8 {
    fn from(slot: PlayerSlot) -> Self {
        slot.number()
    }
}

impl fmt::Display for PlayerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

// =============================================================================
// BALL / PADDLES / SCORE
// =============================================================================

/// Ball velocity in field units per nominal tick. There is no vertical motion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    /// Lateral component.
    pub x: f64,
    /// Lengthwise component (towards a goal).
    pub z: f64,
}

/// Ball position and velocity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Ball {
    /// Lateral position.
    pub x: f64,
    /// Height above the table, constant.
    pub y: f64,
    /// Lengthwise position.
    pub z: f64,
    /// Current velocity.
    pub velocity: Velocity,
}

impl Ball {
    /// Height the ball travels at.
    pub const HEIGHT: f64 = 1.0;

    /// Ball at the centre of the field with the opening serve velocity.
    pub fn kickoff() -> Self {
        Self {
            x: 0.0,
            y: Self::HEIGHT,
            z: 0.0,
            velocity: Velocity { x: 0.2, z: 0.3 },
        }
    }

    /// True when every coordinate is a finite number.
    pub fn is_finite(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.z.is_finite()
            && self.velocity.x.is_finite()
            && self.velocity.z.is_finite()
    }
}

/// Paddle x offsets per slot.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Paddles {
    one: f64,
    two: f64,
}

impl Paddles {
    /// Paddle x offset for a slot.
    pub fn get(&self, slot: PlayerSlot) -> f64 {
        match slot {
            PlayerSlot::One => self.one,
            PlayerSlot::Two => self.two,
        }
    }

    fn set(&mut self, slot: PlayerSlot, x: f64) {
        match slot {
            PlayerSlot::One => self.one = x,
            PlayerSlot::Two => self.two = x,
        }
    }
}

/// Goals per slot, named as the client expects.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    /// Goals scored by slot 1.
    pub player1: u32,
    /// Goals scored by slot 2.
    pub player2: u32,
}

impl Score {
    /// Goals for a slot.
    pub fn get(&self, slot: PlayerSlot) -> u32 {
        match slot {
            PlayerSlot::One => self.player1,
            PlayerSlot::Two => self.player2,
        }
    }

    /// Add exactly one goal and return the new count.
    fn add_goal(&mut self, slot: PlayerSlot) -> u32 {
        let entry = match slot {
            PlayerSlot::One => &mut self.player1,
            PlayerSlot::Two => &mut self.player2,
        };
        *entry += 1;
        *entry
    }
}

// =============================================================================
// SESSION STATE
// =============================================================================

/// Complete simulation state of one room.
#[derive(Clone, Debug)]
pub struct SessionState {
    room_id: RoomId,
    /// Ball position and velocity.
    pub ball: Ball,
    paddles: Paddles,
    score: Score,
    started: bool,
    ended: bool,
    /// Time of the previous tick, `None` until play begins or after a pause.
    pub last_tick: Option<Instant>,
}

impl SessionState {
    /// Fresh state: ball centred, paddles centred, no goals, not started.
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            ball: Ball::kickoff(),
            paddles: Paddles::default(),
            score: Score::default(),
            started: false,
            ended: false,
            last_tick: None,
        }
    }

    /// Room this state belongs to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Paddle offsets.
    pub fn paddles(&self) -> &Paddles {
        &self.paddles
    }

    /// Current score.
    pub fn score(&self) -> Score {
        self.score
    }

    /// Whether ticks are currently applied.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Whether the session reached its terminal state.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Move a paddle. Ignored once the session has ended.
    pub fn set_paddle(&mut self, slot: PlayerSlot, x: f64) -> bool {
        if self.ended || !x.is_finite() {
            return false;
        }
        self.paddles.set(slot, x);
        true
    }

    /// Resume ticking from `now`. No effect once ended.
    pub fn start(&mut self, now: Instant) -> bool {
        if self.ended {
            return false;
        }
        self.started = true;
        self.last_tick = Some(now);
        true
    }

    /// Stop ticking until the next [`start`](Self::start).
    pub fn pause(&mut self) {
        self.started = false;
        self.last_tick = None;
    }

    /// Count a goal for `scorer`. Returns the new count, or `None` once ended.
    pub fn record_goal(&mut self, scorer: PlayerSlot) -> Option<u32> {
        if self.ended {
            return None;
        }
        Some(self.score.add_goal(scorer))
    }

    /// Enter the terminal state. Returns false if it was already ended.
    pub fn mark_ended(&mut self) -> bool {
        if self.ended {
            return false;
        }
        self.ended = true;
        self.started = false;
        true
    }
}
