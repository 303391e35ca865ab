//! Ball and Paddle Physics
//!
//! Stateless functions that advance a [`SessionState`] by one tick.
//!
//! ## Field layout (top view)
//!
//! ```text
//!            z = +20  goal line behind slot 1
//!   ┌────────[ paddle 1 ]────────┐  z ∈ [18, 20]
//!   │                            │
//!   │             ●              │  lateral walls at x = ±15
//!   │                            │
//!   └────────[ paddle 2 ]────────┘  z ∈ [-20, -18]
//!            z = -20  goal line behind slot 2
//! ```
//!
//! Velocities are expressed per nominal tick. Each step scales them by the
//! measured elapsed time divided by the nominal tick period, so scheduling
//! jitter changes the step size instead of the ball speed.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::game::state::{Ball, PlayerSlot, Score, SessionState, Velocity};

/// Field geometry and serve parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    /// Lateral walls sit at `±half_width`.
    pub half_width: f64,
    /// A ball past `±goal_z` scores.
    pub goal_z: f64,
    /// Inner edge of each paddle's z band; the band extends to `goal_z`.
    pub paddle_z: f64,
    /// Half the paddle width.
    pub paddle_half_width: f64,
    /// Lengthwise serve speed after a goal.
    pub serve_speed: f64,
    /// Lateral serve speed is drawn from `[-serve_spread, serve_spread]`.
    pub serve_spread: f64,
    /// Rebound angle divisor: `vx = offset / rebound_divisor`.
    pub rebound_divisor: f64,
    /// Rebound perturbation is drawn from `[-rebound_jitter, rebound_jitter]`.
    pub rebound_jitter: f64,
    /// Upper bound on the elapsed-time scale of a single step.
    pub max_step_scale: f64,
}

impl Default for Field {
    fn default() -> Self {
        Self {
            half_width: 15.0,
            goal_z: 20.0,
            paddle_z: 18.0,
            paddle_half_width: 2.5,
            serve_speed: 0.3,
            serve_spread: 0.1,
            rebound_divisor: 5.0,
            rebound_jitter: 0.05,
            max_step_scale: 4.0,
        }
    }
}

/// What a step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Session not running; nothing moved.
    Skipped,
    /// Ball moved, no goal.
    Moved,
    /// A goal was scored; the ball was re-served and play paused.
    Goal {
        /// Slot credited with the goal.
        scorer: PlayerSlot,
        /// Score after the goal.
        score: Score,
    },
    /// A goal reached the win threshold; the state is now ended.
    Won {
        /// Winning slot.
        winner: PlayerSlot,
        /// Final score.
        score: Score,
    },
}

/// Physics failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PhysicsError {
    /// The ball left the set of finite numbers; the state can't be trusted.
    #[error("ball state corrupted: {0:?}")]
    Corrupted(Ball),
}

/// Scale for one step: elapsed over nominal period, capped.
pub fn step_scale(elapsed: Duration, period: Duration, field: &Field) -> f64 {
    if period.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / period.as_secs_f64()).clamp(0.0, field.max_step_scale)
}

/// Advance the state to `now`.
///
/// Only runs while started and not ended. Elapsed time is measured from
/// `state.last_tick`, which is updated here.
pub fn advance<R: Rng + ?Sized>(
    state: &mut SessionState,
    now: Instant,
    period: Duration,
    win_score: u32,
    field: &Field,
    rng: &mut R,
) -> Result<TickOutcome, PhysicsError> {
    if state.is_ended() || !state.is_started() {
        return Ok(TickOutcome::Skipped);
    }

    let elapsed = state
        .last_tick
        .map(|last| now.saturating_duration_since(last))
        .unwrap_or(period);
    state.last_tick = Some(now);

    step(state, step_scale(elapsed, period, field), win_score, field, rng)
}

/// Advance the ball by `scale` nominal ticks and resolve walls, paddles and goals.
pub fn step<R: Rng + ?Sized>(
    state: &mut SessionState,
    scale: f64,
    win_score: u32,
    field: &Field,
    rng: &mut R,
) -> Result<TickOutcome, PhysicsError> {
    if state.is_ended() || !state.is_started() {
        return Ok(TickOutcome::Skipped);
    }

    let paddles = *state.paddles();
    let ball = &mut state.ball;

    ball.x += ball.velocity.x * scale;
    ball.z += ball.velocity.z * scale;

    if !ball.is_finite() {
        return Err(PhysicsError::Corrupted(*ball));
    }

    bounce_off_walls(ball, field);

    for slot in PlayerSlot::ALL {
        bounce_off_paddle(ball, slot, paddles.get(slot), field, rng);
    }

    let scorer = if ball.z > field.goal_z {
        Some(PlayerSlot::Two)
    } else if ball.z < -field.goal_z {
        Some(PlayerSlot::One)
    } else {
        None
    };

    let Some(scorer) = scorer else {
        return Ok(TickOutcome::Moved);
    };

    // record_goal only fails on an ended state, which was excluded above.
    let goals = state.record_goal(scorer).unwrap_or(0);
    let score = state.score();

    if goals >= win_score {
        state.mark_ended();
        return Ok(TickOutcome::Won { winner: scorer, score });
    }

    serve(&mut state.ball, field, rng);
    state.pause();
    Ok(TickOutcome::Goal { scorer, score })
}

/// Re-centre the ball with a random lateral speed and a random end.
pub fn serve<R: Rng + ?Sized>(ball: &mut Ball, field: &Field, rng: &mut R) {
    let direction = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
    *ball = Ball {
        x: 0.0,
        y: Ball::HEIGHT,
        z: 0.0,
        velocity: Velocity {
            x: rng.gen_range(-field.serve_spread..=field.serve_spread),
            z: direction * field.serve_speed,
        },
    };
}

/// Reflect lateral velocity on wall contact.
///
/// Only a ball moving outward is reflected, so a ball still inside the wall
/// zone on the next tick isn't flipped back.
fn bounce_off_walls(ball: &mut Ball, field: &Field) {
    let hw = field.half_width;
    let outward = (ball.x >= hw && ball.velocity.x > 0.0) || (ball.x <= -hw && ball.velocity.x < 0.0);
    if outward {
        ball.velocity.x = -ball.velocity.x;
        ball.x = ball.x.clamp(-hw, hw);
    }
}

/// Reflect off a paddle when the ball is inside its band, moving towards it,
/// and within its half-width.
fn bounce_off_paddle<R: Rng + ?Sized>(
    ball: &mut Ball,
    slot: PlayerSlot,
    paddle_x: f64,
    field: &Field,
    rng: &mut R,
) {
    let (in_band, approaching) = match slot {
        PlayerSlot::One => (
            ball.z >= field.paddle_z && ball.z <= field.goal_z,
            ball.velocity.z > 0.0,
        ),
        PlayerSlot::Two => (
            ball.z <= -field.paddle_z && ball.z >= -field.goal_z,
            ball.velocity.z < 0.0,
        ),
    };

    let offset = ball.x - paddle_x;
    if !in_band || !approaching || offset.abs() > field.paddle_half_width {
        return;
    }

    ball.velocity.z = -ball.velocity.z;
    let jitter = rng.gen_range(-field.rebound_jitter..=field.rebound_jitter);
    ball.velocity.x = offset / field.rebound_divisor + jitter;
}
