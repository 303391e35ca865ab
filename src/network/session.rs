//! Game Session
//!
//! One task per room owns the [`SessionState`] and drives it through
//! `AwaitingPlayers → Countdown → Running ⇄ GoalPause → Ended`.
//!
//! Everything that touches the state (joins, paddle moves, interrupts,
//! disconnects and ticks) is serialized through the task's command queue, so
//! a broadcast never observes a half-applied update. Countdown, goal pause,
//! idle expiry and post-match linger are deadlines owned by the task; they
//! disappear with it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{env_opt, env_or, ConfigError};
use crate::game::physics::{self, Field, TickOutcome};
use crate::game::state::{PlayerSlot, RoomId, Score, SessionState};
use crate::network::broadcast::{BroadcastHub, ConnectionId};
use crate::network::protocol::{ErrorCode, GameEvent, ServerMessage};
use crate::persistence::{GameId, IdentityRef, PersistenceGateway};

/// Capacity of a session's command queue.
const COMMAND_QUEUE_CAPACITY: usize = 256;

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Rules and timings of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay between the second join and the first tick.
    pub countdown: Duration,
    /// Delay between a goal and the next serve.
    pub goal_pause: Duration,
    /// Ticks per second.
    pub tick_rate: u32,
    /// Goals needed to win.
    pub win_score: u32,
    /// How long an ended session keeps answering late joiners.
    pub post_match_linger: Duration,
    /// End a room nobody completes within this time. Disabled when `None`.
    pub awaiting_timeout: Option<Duration>,
    /// Field geometry.
    pub field: Field,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            countdown: Duration::from_secs(3),
            goal_pause: Duration::from_secs(1),
            tick_rate: 60,
            win_score: 3,
            post_match_linger: Duration::from_secs(5),
            awaiting_timeout: None,
            field: Field::default(),
        }
    }
}

impl SessionConfig {
    /// Load from `PONG_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            countdown: Duration::from_secs(env_or("PONG_COUNTDOWN_SECS", 3)?),
            goal_pause: Duration::from_secs(env_or("PONG_GOAL_PAUSE_SECS", 1)?),
            tick_rate: env_or("PONG_TICK_RATE", defaults.tick_rate)?,
            win_score: env_or("PONG_WIN_SCORE", defaults.win_score)?,
            post_match_linger: Duration::from_secs(env_or("PONG_POST_MATCH_LINGER_SECS", 5)?),
            awaiting_timeout: env_opt("PONG_AWAITING_TIMEOUT_SECS")?.map(Duration::from_secs),
            field: defaults.field,
        };

        if config.tick_rate == 0 {
            return Err(ConfigError::Invalid {
                key: "PONG_TICK_RATE",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if config.win_score == 0 {
            return Err(ConfigError::Invalid {
                key: "PONG_WIN_SCORE",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(config)
    }

    /// Nominal time between ticks.
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}

// =============================================================================
// HANDLE
// =============================================================================

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session task is gone.
    #[error("session {0} is closed")]
    Closed(RoomId),
}

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Fewer than two participants have joined.
    AwaitingPlayers,
    /// Two participants present, waiting to serve.
    Countdown,
    /// Ticking.
    Running,
    /// Paused after a goal.
    GoalPause,
    /// Terminal.
    Ended,
}

/// Result of a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The connection is now a participant.
    Joined,
    /// The game is over; the connection only received the final event.
    AlreadyEnded,
}

/// Copy of a session's state.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    /// Phase.
    pub phase: SessionPhase,
    /// Simulation state.
    pub state: SessionState,
    /// Number of participants.
    pub participants: usize,
}

enum SessionCommand {
    Join {
        conn: ConnectionId,
        slot: PlayerSlot,
        identity: Option<IdentityRef>,
        reply: oneshot::Sender<JoinOutcome>,
    },
    PaddleMove {
        conn: ConnectionId,
        position: f64,
    },
    Interrupt {
        conn: ConnectionId,
        identity: Option<IdentityRef>,
        reason: String,
    },
    Leave {
        conn: ConnectionId,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    #[cfg(test)]
    Mutate(Box<dyn FnOnce(&mut SessionState) + Send>),
}

/// Cloneable address of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    instance: u64,
    room: RoomId,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Registry-assigned instance number.
    pub fn instance(&self) -> u64 {
        self.instance
    }

    /// Room this session serves.
    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// True once the session stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed(self.room.clone()))
    }

    /// Enter the room as `slot`. Resolves once the session processed it.
    pub async fn join(
        &self,
        conn: ConnectionId,
        slot: PlayerSlot,
        identity: Option<IdentityRef>,
    ) -> Result<JoinOutcome, SessionError> {
        let (reply, outcome) = oneshot::channel();
        self.send(SessionCommand::Join {
            conn,
            slot,
            identity,
            reply,
        })
        .await?;
        outcome.await.map_err(|_| SessionError::Closed(self.room.clone()))
    }

    /// Move the connection's paddle.
    pub async fn paddle_move(&self, conn: ConnectionId, position: f64) -> Result<(), SessionError> {
        self.send(SessionCommand::PaddleMove { conn, position }).await
    }

    /// Abort the game on behalf of `conn`.
    ///
    /// A connection that never joined is accepted only when `identity`
    /// belongs to one of the participants; it then speaks for that seat.
    pub async fn interrupt(
        &self,
        conn: ConnectionId,
        identity: Option<IdentityRef>,
        reason: impl Into<String>,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::Interrupt {
            conn,
            identity,
            reason: reason.into(),
        })
        .await
    }

    /// The connection left (closed or switched rooms).
    pub async fn leave(&self, conn: ConnectionId) -> Result<(), SessionError> {
        self.send(SessionCommand::Leave { conn }).await
    }

    /// Current phase and state.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, snapshot) = oneshot::channel();
        self.send(SessionCommand::Snapshot { reply }).await?;
        snapshot.await.map_err(|_| SessionError::Closed(self.room.clone()))
    }

    #[cfg(test)]
    pub(crate) async fn mutate(
        &self,
        f: impl FnOnce(&mut SessionState) + Send + 'static,
    ) -> Result<(), SessionError> {
        self.send(SessionCommand::Mutate(Box::new(f))).await
    }
}

// =============================================================================
// SESSION TASK
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timer {
    StartPlay,
    Resume,
    IdleExpiry,
    Reclaim,
}

enum Ending {
    Won { winner: PlayerSlot, score: Score },
    Interrupted { reason: String, by: Option<PlayerSlot> },
}

struct Participant {
    slot: PlayerSlot,
    identity: Option<IdentityRef>,
}

/// The per-room actor.
pub struct GameSession {
    room: RoomId,
    state: SessionState,
    phase: SessionPhase,
    participants: BTreeMap<ConnectionId, Participant>,
    config: Arc<SessionConfig>,
    hub: Arc<BroadcastHub>,
    persistence: Arc<dyn PersistenceGateway>,
    commands: mpsc::Receiver<SessionCommand>,
    ticker: Interval,
    timer: Option<(Instant, Timer)>,
    final_event: Option<GameEvent>,
    reclaim_due: bool,
    rng: StdRng,
}

impl GameSession {
    /// Start a session task for `room`.
    pub fn spawn(
        room: RoomId,
        instance: u64,
        config: Arc<SessionConfig>,
        hub: Arc<BroadcastHub>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> (SessionHandle, JoinHandle<()>) {
        Self::spawn_with_rng(room, instance, config, hub, persistence, StdRng::from_entropy())
    }

    /// Start a session task with a given random source.
    pub fn spawn_with_rng(
        room: RoomId,
        instance: u64,
        config: Arc<SessionConfig>,
        hub: Arc<BroadcastHub>,
        persistence: Arc<dyn PersistenceGateway>,
        rng: StdRng,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        let mut ticker = interval(config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let timer = config
            .awaiting_timeout
            .map(|timeout| (Instant::now() + timeout, Timer::IdleExpiry));

        let session = Self {
            room: room.clone(),
            state: SessionState::new(room.clone()),
            phase: SessionPhase::AwaitingPlayers,
            participants: BTreeMap::new(),
            config,
            hub,
            persistence,
            commands: rx,
            ticker,
            timer,
            final_event: None,
            reclaim_due: false,
            rng,
        };

        let task = tokio::spawn(session.run());
        let handle = SessionHandle {
            instance,
            room,
            commands: tx,
        };
        (handle, task)
    }

    async fn run(mut self) {
        info!("Session {} created", self.room);

        loop {
            let deadline = self.timer.map(|(at, _)| at);
            let running = self.phase == SessionPhase::Running;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                now = self.ticker.tick(), if running => {
                    self.on_tick(now).await;
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timer().await;
                }
            }

            if self.should_close() {
                break;
            }
        }

        self.shutdown().await;
    }

    fn should_close(&self) -> bool {
        self.phase == SessionPhase::Ended && (self.participants.is_empty() || self.reclaim_due)
    }

    async fn shutdown(&mut self) {
        // Queued commands are dropped with their reply channels, which callers
        // observe as `SessionError::Closed`.
        self.commands.close();
        while self.commands.try_recv().is_ok() {}

        for conn in self.participants.keys() {
            self.hub.unsubscribe(&self.room, *conn).await;
        }
        info!("Session {} closed", self.room);
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join {
                conn,
                slot,
                identity,
                reply,
            } => {
                let outcome = self.on_join(conn, slot, identity).await;
                let _ = reply.send(outcome);
            }
            SessionCommand::PaddleMove { conn, position } => {
                self.on_paddle_move(conn, position).await;
            }
            SessionCommand::Interrupt {
                conn,
                identity,
                reason,
            } => {
                self.on_interrupt(conn, identity, reason).await;
            }
            SessionCommand::Leave { conn } => {
                self.on_leave(conn).await;
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(SessionSnapshot {
                    phase: self.phase,
                    state: self.state.clone(),
                    participants: self.participants.len(),
                });
            }
            #[cfg(test)]
            SessionCommand::Mutate(f) => f(&mut self.state),
        }
    }

    async fn on_join(
        &mut self,
        conn: ConnectionId,
        slot: PlayerSlot,
        identity: Option<IdentityRef>,
    ) -> JoinOutcome {
        if self.phase == SessionPhase::Ended {
            if let Some(event) = self.final_event.clone() {
                if let Err(e) = self.hub.send_to(conn, ServerMessage::game(event)).await {
                    debug!("Late joiner {} unreachable: {}", conn, e);
                }
            }
            return JoinOutcome::AlreadyEnded;
        }

        self.hub.subscribe(&self.room, conn).await;
        self.participants.insert(conn, Participant { slot, identity });
        info!(
            "Player {} joined {} ({} participants)",
            slot,
            self.room,
            self.participants.len()
        );

        self.broadcast(GameEvent::PlayerJoined { player_number: slot }).await;

        if self.phase == SessionPhase::AwaitingPlayers && self.participants.len() >= 2 {
            self.phase = SessionPhase::Countdown;
            self.timer = Some((Instant::now() + self.config.countdown, Timer::StartPlay));
            info!("Session {} starting in {:?}", self.room, self.config.countdown);
        }

        JoinOutcome::Joined
    }

    async fn on_paddle_move(&mut self, conn: ConnectionId, position: f64) {
        let Some(slot) = self.participants.get(&conn).map(|p| p.slot) else {
            debug!("Paddle move from non-participant {} in {}", conn, self.room);
            return;
        };

        if self.state.set_paddle(slot, position) {
            self.broadcast(GameEvent::PaddleMove {
                position,
                player_number: slot,
            })
            .await;
        }
    }

    async fn on_interrupt(
        &mut self,
        conn: ConnectionId,
        identity: Option<IdentityRef>,
        reason: String,
    ) {
        if self.phase == SessionPhase::Ended {
            debug!("Interrupt of already ended {} ignored", self.room);
            return;
        }

        let seat = self.participants.get(&conn).or_else(|| {
            let identity = identity.as_ref()?;
            self.participants
                .values()
                .find(|p| p.identity.as_ref() == Some(identity))
        });
        let Some(by) = seat.map(|p| p.slot) else {
            warn!("Interrupt of {} from outsider {} rejected", self.room, conn);
            let msg = ServerMessage::error(ErrorCode::NotInRoom, "Not a player of this game");
            if let Err(e) = self.hub.send_to(conn, msg).await {
                debug!("Rejection for {} not delivered: {}", conn, e);
            }
            return;
        };

        self.end(Ending::Interrupted {
            reason,
            by: Some(by),
        })
        .await;
    }

    async fn on_leave(&mut self, conn: ConnectionId) {
        let Some(participant) = self.participants.remove(&conn) else {
            return;
        };
        self.hub.unsubscribe(&self.room, conn).await;
        info!("Player {} left {}", participant.slot, self.room);

        if self.phase != SessionPhase::Ended {
            self.end(Ending::Interrupted {
                reason: "disconnect".to_string(),
                by: Some(participant.slot),
            })
            .await;
        }
    }

    async fn on_tick(&mut self, now: Instant) {
        let outcome = physics::advance(
            &mut self.state,
            now,
            self.config.tick_period(),
            self.config.win_score,
            &self.config.field,
            &mut self.rng,
        );

        match outcome {
            Ok(TickOutcome::Skipped) => {}
            Ok(TickOutcome::Moved) => self.broadcast_state().await,
            Ok(TickOutcome::Goal { scorer, score }) => {
                info!(
                    "Player {} scored in {}: {}-{}",
                    scorer, self.room, score.player1, score.player2
                );
                self.phase = SessionPhase::GoalPause;
                self.timer = Some((now + self.config.goal_pause, Timer::Resume));
                self.broadcast_state().await;
            }
            Ok(TickOutcome::Won { winner, score }) => {
                self.broadcast_state().await;
                self.end(Ending::Won { winner, score }).await;
            }
            Err(e) => {
                error!("Session {} stopped: {}", self.room, e);
                self.end(Ending::Interrupted {
                    reason: "internal error".to_string(),
                    by: None,
                })
                .await;
            }
        }
    }

    async fn on_timer(&mut self) {
        let Some((_, timer)) = self.timer.take() else {
            return;
        };
        let now = Instant::now();

        match timer {
            Timer::StartPlay if self.phase == SessionPhase::Countdown => {
                self.resume_play(now);
                info!("Session {} started", self.room);
                self.broadcast(GameEvent::GameStart).await;
            }
            Timer::Resume if self.phase == SessionPhase::GoalPause => {
                self.resume_play(now);
            }
            Timer::IdleExpiry if self.phase == SessionPhase::AwaitingPlayers => {
                self.end(Ending::Interrupted {
                    reason: "timeout".to_string(),
                    by: None,
                })
                .await;
            }
            Timer::Reclaim => self.reclaim_due = true,
            stale => debug!("Dropped stale {:?} timer in {}", stale, self.room),
        }
    }

    fn resume_play(&mut self, now: Instant) {
        if self.state.start(now) {
            self.phase = SessionPhase::Running;
            self.ticker.reset();
        }
    }

    async fn end(&mut self, ending: Ending) {
        if self.phase == SessionPhase::Ended {
            error!("Session {} ended twice; ignoring", self.room);
            return;
        }

        self.phase = SessionPhase::Ended;
        self.state.mark_ended();
        self.timer = Some((
            Instant::now() + self.config.post_match_linger,
            Timer::Reclaim,
        ));

        let event = match ending {
            Ending::Won { winner, score } => {
                info!(
                    "Player {} won {} ({}-{})",
                    winner, self.room, score.player1, score.player2
                );
                self.report_result(winner, score);
                GameEvent::GameEnd { winner, score }
            }
            Ending::Interrupted { reason, by } => {
                info!("Session {} interrupted: {}", self.room, reason);
                GameEvent::GameInterrupted {
                    reason,
                    player_number: by,
                }
            }
        };

        self.final_event = Some(event.clone());
        self.broadcast(event).await;
    }

    /// Hand the final score to persistence without blocking the session.
    fn report_result(&self, winner: PlayerSlot, score: Score) {
        let Some(record) = self.room.game_record() else {
            warn!("Room {} has no game record; result not persisted", self.room);
            return;
        };

        let identity = self
            .participants
            .values()
            .find(|p| p.slot == winner)
            .and_then(|p| p.identity.clone());
        let persistence = self.persistence.clone();
        let room = self.room.clone();

        tokio::spawn(async move {
            match persistence
                .record_final_result(GameId(record), score, identity.as_ref())
                .await
            {
                Ok(()) => debug!("Recorded result of {}", room),
                Err(e) => error!("Failed to record result of {}: {}", room, e),
            }
        });
    }

    async fn broadcast_state(&self) {
        self.broadcast(GameEvent::GameStateUpdate {
            ball: self.state.ball,
            score: self.state.score(),
        })
        .await;
    }

    async fn broadcast(&self, event: GameEvent) {
        if let Err(e) = self.hub.broadcast(&self.room, ServerMessage::game(event)).await {
            warn!("Delivery failure in {}: {}", self.room, e);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
