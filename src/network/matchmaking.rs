//! Matchmaking Queue
//!
//! FIFO queue of players waiting for an opponent. The two oldest tickets
//! are paired as soon as two are queued. Pairing creates the game record and
//! both player records before either player hears about the match; if that
//! fails the pair goes back to the head of the queue in its original order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{env_or, ConfigError};
use crate::game::state::{PlayerSlot, RoomId};
use crate::network::broadcast::{BroadcastHub, ConnectionId};
use crate::network::protocol::{ErrorCode, MatchFoundInfo, OpponentInfo, ServerMessage};
use crate::network::registry::SessionRegistry;
use crate::persistence::{GameId, GameMode, IdentityRef, PersistenceError, PersistenceGateway};

/// Matchmaking configuration.
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// Upper bound on creating the records of one match.
    pub persistence_timeout: Duration,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            persistence_timeout: Duration::from_secs(5),
        }
    }
}

impl MatchmakingConfig {
    /// Load from `PONG_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            persistence_timeout: Duration::from_secs(env_or("PONG_PERSISTENCE_TIMEOUT_SECS", 5)?),
        })
    }
}

/// Unique id of one wait entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TicketId(uuid::Uuid);

impl TicketId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A player's request for an opponent.
#[derive(Debug, Clone)]
pub struct MatchTicket {
    /// Name shown to the opponent.
    pub display_name: String,
    /// Avatar shown to the opponent.
    pub avatar_ref: Option<String>,
    /// Authenticated user, handed to persistence.
    pub identity: Option<IdentityRef>,
    /// Where to deliver the result.
    pub connection: ConnectionId,
}

impl MatchTicket {
    fn opponent_info(&self) -> OpponentInfo {
        OpponentInfo {
            username: self.display_name.clone(),
            avatar: self.avatar_ref.clone(),
        }
    }
}

#[derive(Debug)]
struct WaitingPlayer {
    ticket_id: TicketId,
    ticket: MatchTicket,
    queued_at: Instant,
}

/// Outcome of a submission for the submitting player.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitStatus {
    /// Queued, no opponent yet.
    Waiting {
        /// The queued ticket.
        ticket: TicketId,
    },
    /// Paired; `match_found` has been delivered.
    Matched {
        /// Room to join.
        room: RoomId,
        /// Assigned seat.
        slot: PlayerSlot,
        /// The other player.
        opponent: OpponentInfo,
    },
}

/// Matchmaking errors.
#[derive(Debug, thiserror::Error)]
pub enum MatchmakingError {
    /// The match could not be recorded; the ticket is still queued.
    #[error("failed to record match: {0}")]
    Persistence(#[from] PersistenceError),
}

/// The matchmaking queue.
pub struct MatchmakingQueue {
    waiting: Mutex<VecDeque<WaitingPlayer>>,
    config: MatchmakingConfig,
    hub: Arc<BroadcastHub>,
    registry: Arc<SessionRegistry>,
    persistence: Arc<dyn PersistenceGateway>,
}

impl MatchmakingQueue {
    /// Create an empty queue.
    pub fn new(
        config: MatchmakingConfig,
        hub: Arc<BroadcastHub>,
        registry: Arc<SessionRegistry>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            waiting: Mutex::new(VecDeque::new()),
            config,
            hub,
            registry,
            persistence,
        }
    }

    /// Queue a ticket and pair the oldest tickets while two are waiting.
    ///
    /// Both players of a match receive `match_found`, or an error frame when
    /// recording fails; the returned status only describes the submitter.
    /// A connection that is already queued keeps its existing ticket.
    ///
    /// Frames are handed to the hub while the queue is locked, which keeps
    /// each player's error and `match_found` frames in order; the hub never
    /// waits on a slow client.
    pub async fn submit(&self, ticket: MatchTicket) -> Result<WaitStatus, MatchmakingError> {
        let mut waiting = self.waiting.lock().await;
        let caller = ticket.connection;

        if let Some(existing) = waiting.iter().find(|w| w.ticket.connection == caller) {
            debug!("Connection {} already queued as {}", caller, existing.ticket_id);
            return Ok(WaitStatus::Waiting {
                ticket: existing.ticket_id,
            });
        }

        let ticket_id = TicketId::new();
        info!(
            "{} queued for matchmaking ({} waiting)",
            ticket.display_name,
            waiting.len() + 1
        );
        waiting.push_back(WaitingPlayer {
            ticket_id,
            ticket,
            queued_at: Instant::now(),
        });

        let mut status = WaitStatus::Waiting { ticket: ticket_id };

        while waiting.len() >= 2 {
            let (Some(first), Some(second)) = (waiting.pop_front(), waiting.pop_front()) else {
                break;
            };

            match self.pair(&first, &second).await {
                Ok(room) => {
                    for (player, slot, opponent) in [
                        (&first, PlayerSlot::One, &second),
                        (&second, PlayerSlot::Two, &first),
                    ] {
                        if player.ticket.connection == caller {
                            status = WaitStatus::Matched {
                                room: room.clone(),
                                slot,
                                opponent: opponent.ticket.opponent_info(),
                            };
                        }
                    }
                }
                Err(e) => {
                    warn!("Match recording failed, requeueing both players: {}", e);
                    let involved = [first.ticket.connection, second.ticket.connection];
                    waiting.push_front(second);
                    waiting.push_front(first);

                    for conn in involved {
                        let msg = ServerMessage::error(
                            ErrorCode::MatchmakingFailed,
                            "Could not create the game, still waiting for an opponent",
                        );
                        if let Err(e) = self.hub.send_to(conn, msg).await {
                            debug!("Matchmaking error not delivered: {}", e);
                        }
                    }

                    if involved.contains(&caller) {
                        return Err(e.into());
                    }
                    break;
                }
            }
        }

        Ok(status)
    }

    /// Record the match, prepare its session and notify both players.
    async fn pair(
        &self,
        first: &WaitingPlayer,
        second: &WaitingPlayer,
    ) -> Result<RoomId, PersistenceError> {
        let game = timeout(self.config.persistence_timeout, self.create_records(first, second))
            .await
            .map_err(|_| PersistenceError::Timeout)??;

        let room = RoomId::for_game(game.0);
        self.registry.get_or_create(&room).await;

        info!(
            "Matched {} vs {} in {} (waited {:?})",
            first.ticket.display_name,
            second.ticket.display_name,
            room,
            first.queued_at.elapsed()
        );

        for (player, slot, opponent) in [
            (first, PlayerSlot::One, second),
            (second, PlayerSlot::Two, first),
        ] {
            let msg = ServerMessage::MatchFound(MatchFoundInfo {
                game_id: game.to_string(),
                game_room: room.clone(),
                player_number: slot,
                opponent: opponent.ticket.opponent_info(),
            });
            if let Err(e) = self.hub.send_to(player.ticket.connection, msg).await {
                warn!("Match notification for {} lost: {}", player.ticket.display_name, e);
            }
        }

        Ok(room)
    }

    async fn create_records(
        &self,
        first: &WaitingPlayer,
        second: &WaitingPlayer,
    ) -> Result<GameId, PersistenceError> {
        let game = self.persistence.create_game_record(GameMode::Remote).await?;
        for (player, slot) in [(first, PlayerSlot::One), (second, PlayerSlot::Two)] {
            self.persistence
                .create_player_record(
                    game,
                    slot,
                    &player.ticket.display_name,
                    player.ticket.identity.as_ref(),
                )
                .await?;
        }
        Ok(game)
    }

    /// Remove the connection's ticket. Returns false if it had none.
    pub async fn cancel(&self, conn: ConnectionId) -> bool {
        let mut waiting = self.waiting.lock().await;
        match waiting.iter().position(|w| w.ticket.connection == conn) {
            Some(index) => {
                if let Some(removed) = waiting.remove(index) {
                    info!("{} left matchmaking", removed.ticket.display_name);
                }
                true
            }
            None => false,
        }
    }

    /// Whether the connection has a queued ticket.
    pub async fn is_queued(&self, conn: ConnectionId) -> bool {
        self.waiting
            .lock()
            .await
            .iter()
            .any(|w| w.ticket.connection == conn)
    }

    /// Number of queued tickets.
    pub async fn len(&self) -> usize {
        self.waiting.lock().await.len()
    }

    /// True when nobody is waiting.
    pub async fn is_empty(&self) -> bool {
        self.waiting.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::Score;
    use crate::network::session::SessionConfig;
    use crate::persistence::{InMemoryGateway, PlayerRecordId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// In-memory store that can be told to fail or hang.
    #[derive(Default)]
    struct FlakyGateway {
        inner: InMemoryGateway,
        fail: AtomicBool,
        hang: AtomicBool,
    }

    #[async_trait]
    impl PersistenceGateway for FlakyGateway {
        async fn create_game_record(&self, mode: GameMode) -> Result<GameId, PersistenceError> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(PersistenceError::Backend("database unavailable".to_string()));
            }
            self.inner.create_game_record(mode).await
        }

        async fn create_player_record(
            &self,
            game: GameId,
            slot: PlayerSlot,
            nickname: &str,
            identity: Option<&IdentityRef>,
        ) -> Result<PlayerRecordId, PersistenceError> {
            self.inner.create_player_record(game, slot, nickname, identity).await
        }

        async fn record_final_result(
            &self,
            game: GameId,
            score: Score,
            winner: Option<&IdentityRef>,
        ) -> Result<(), PersistenceError> {
            self.inner.record_final_result(game, score, winner).await
        }
    }

    struct Fixture {
        hub: Arc<BroadcastHub>,
        registry: Arc<SessionRegistry>,
        gateway: Arc<FlakyGateway>,
        queue: Arc<MatchmakingQueue>,
    }

    impl Fixture {
        fn new() -> Self {
            let hub = Arc::new(BroadcastHub::new());
            let gateway = Arc::new(FlakyGateway::default());
            let registry = Arc::new(SessionRegistry::new(
                SessionConfig::default(),
                hub.clone(),
                gateway.clone(),
            ));
            let queue = Arc::new(MatchmakingQueue::new(
                MatchmakingConfig::default(),
                hub.clone(),
                registry.clone(),
                gateway.clone(),
            ));
            Self {
                hub,
                registry,
                gateway,
                queue,
            }
        }

        async fn player(&self, name: &str) -> (MatchTicket, mpsc::Receiver<ServerMessage>) {
            let conn = ConnectionId::new();
            let (tx, rx) = mpsc::channel(16);
            self.hub.register(conn, tx).await;
            let ticket = MatchTicket {
                display_name: name.to_string(),
                avatar_ref: Some(format!("{name}.png")),
                identity: Some(IdentityRef(name.to_lowercase())),
                connection: conn,
            };
            (ticket, rx)
        }
    }

    fn match_found(msg: Option<ServerMessage>) -> MatchFoundInfo {
        match msg {
            Some(ServerMessage::MatchFound(info)) => info,
            other => panic!("expected match_found, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pairs_two_oldest_in_order() {
        let fixture = Fixture::new();
        let (alice, mut rx_alice) = fixture.player("Alice").await;
        let (bob, mut rx_bob) = fixture.player("Bob").await;
        let (carol, _rx_carol) = fixture.player("Carol").await;

        let status = fixture.queue.submit(alice).await.unwrap();
        assert!(matches!(status, WaitStatus::Waiting { .. }));

        let status = fixture.queue.submit(bob).await.unwrap();
        let WaitStatus::Matched { room, slot, opponent } = status else {
            panic!("expected a match, got {status:?}");
        };
        assert_eq!(slot, PlayerSlot::Two);
        assert_eq!(opponent.username, "Alice");
        assert_eq!(opponent.avatar.as_deref(), Some("Alice.png"));

        let alice_info = match_found(rx_alice.recv().await);
        assert_eq!(alice_info.player_number, PlayerSlot::One);
        assert_eq!(alice_info.opponent.username, "Bob");
        assert_eq!(alice_info.game_room, room);

        let bob_info = match_found(rx_bob.recv().await);
        assert_eq!(bob_info.player_number, PlayerSlot::Two);
        assert_eq!(bob_info.game_id, alice_info.game_id);

        // Records exist before anyone hears about the match.
        let record = fixture
            .gateway
            .inner
            .game(GameId(room.game_record().unwrap()))
            .await
            .unwrap();
        assert_eq!(record.mode, GameMode::Remote);
        assert_eq!(record.players[&PlayerSlot::One].nickname, "Alice");
        assert_eq!(
            record.players[&PlayerSlot::Two].identity,
            Some(IdentityRef("bob".to_string()))
        );
        assert!(fixture.registry.get(&room).await.is_some());

        let status = fixture.queue.submit(carol).await.unwrap();
        assert!(matches!(status, WaitStatus::Waiting { .. }));
        assert_eq!(fixture.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_submissions() {
        let fixture = Fixture::new();
        let (alice, mut rx_alice) = fixture.player("Alice").await;
        let (bob, mut rx_bob) = fixture.player("Bob").await;
        let (carol, mut rx_carol) = fixture.player("Carol").await;
        let carol_conn = carol.connection;

        let (q1, q2) = (fixture.queue.clone(), fixture.queue.clone());
        let (a, b) = tokio::join!(
            tokio::spawn(async move { q1.submit(alice).await }),
            tokio::spawn(async move { q2.submit(bob).await }),
        );
        let statuses = [a.unwrap().unwrap(), b.unwrap().unwrap()];
        let matched = statuses
            .iter()
            .filter(|s| matches!(s, WaitStatus::Matched { .. }))
            .count();
        assert_eq!(matched, 1);

        let status = fixture.queue.submit(carol).await.unwrap();
        assert!(matches!(status, WaitStatus::Waiting { .. }));

        let alice_info = match_found(rx_alice.recv().await);
        let bob_info = match_found(rx_bob.recv().await);
        assert_eq!(alice_info.game_room, bob_info.game_room);
        assert_ne!(alice_info.player_number, bob_info.player_number);
        assert!(rx_carol.try_recv().is_err());
        assert!(fixture.queue.is_queued(carol_conn).await);
        assert_eq!(fixture.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_cancelled_ticket_is_never_matched() {
        let fixture = Fixture::new();
        let (alice, mut rx_alice) = fixture.player("Alice").await;
        let (bob, _rx_bob) = fixture.player("Bob").await;
        let (carol, _rx_carol) = fixture.player("Carol").await;
        let alice_conn = alice.connection;

        fixture.queue.submit(alice).await.unwrap();
        assert!(fixture.queue.cancel(alice_conn).await);
        assert!(!fixture.queue.cancel(alice_conn).await);

        assert!(matches!(
            fixture.queue.submit(bob).await.unwrap(),
            WaitStatus::Waiting { .. }
        ));
        let status = fixture.queue.submit(carol).await.unwrap();
        let WaitStatus::Matched { opponent, .. } = status else {
            panic!("expected a match, got {status:?}");
        };
        assert_eq!(opponent.username, "Bob");
        assert!(rx_alice.try_recv().is_err());
        assert!(fixture.queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_resubmit_keeps_ticket() {
        let fixture = Fixture::new();
        let (alice, _rx) = fixture.player("Alice").await;

        let first = fixture.queue.submit(alice.clone()).await.unwrap();
        let second = fixture.queue.submit(alice).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fixture.queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_requeues_pair_in_order() {
        let fixture = Fixture::new();
        let (alice, mut rx_alice) = fixture.player("Alice").await;
        let (bob, mut rx_bob) = fixture.player("Bob").await;
        let (carol, _rx_carol) = fixture.player("Carol").await;

        fixture.gateway.fail.store(true, Ordering::SeqCst);
        fixture.queue.submit(alice).await.unwrap();
        let result = fixture.queue.submit(bob).await;
        assert!(matches!(
            result,
            Err(MatchmakingError::Persistence(PersistenceError::Backend(_)))
        ));
        assert_eq!(fixture.queue.len().await, 2);
        assert_eq!(fixture.registry.len().await, 0);

        for rx in [&mut rx_alice, &mut rx_bob] {
            match rx.recv().await {
                Some(ServerMessage::Error(error)) => {
                    assert_eq!(error.code, ErrorCode::MatchmakingFailed)
                }
                other => panic!("expected error frame, got {other:?}"),
            }
        }

        // Once the store recovers, the original pair is matched first.
        fixture.gateway.fail.store(false, Ordering::SeqCst);
        let status = fixture.queue.submit(carol).await.unwrap();
        assert!(matches!(status, WaitStatus::Waiting { .. }));
        assert_eq!(match_found(rx_alice.recv().await).player_number, PlayerSlot::One);
        assert_eq!(match_found(rx_bob.recv().await).opponent.username, "Alice");
        assert_eq!(fixture.queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_timeout_rolls_back() {
        let fixture = Fixture::new();
        let (alice, _rx_alice) = fixture.player("Alice").await;
        let (bob, _rx_bob) = fixture.player("Bob").await;

        fixture.gateway.hang.store(true, Ordering::SeqCst);
        fixture.queue.submit(alice).await.unwrap();
        let result = fixture.queue.submit(bob).await;
        assert!(matches!(
            result,
            Err(MatchmakingError::Persistence(PersistenceError::Timeout))
        ));
        assert_eq!(fixture.queue.len().await, 2);
    }

    #[tokio::test]
    async fn test_full_client_queue_does_not_stall_matchmaking() {
        let fixture = Fixture::new();
        let alice_conn = ConnectionId::new();
        let (tx, _rx_alice) = mpsc::channel(1);
        tx.send(ServerMessage::MatchStatus {
            message: "Waiting for opponent...".to_string(),
        })
        .await
        .unwrap();
        let eviction = fixture.hub.register(alice_conn, tx).await;
        let alice = MatchTicket {
            display_name: "Alice".to_string(),
            avatar_ref: None,
            identity: None,
            connection: alice_conn,
        };
        let (bob, mut rx_bob) = fixture.player("Bob").await;
        let (carol, _rx_carol) = fixture.player("Carol").await;

        fixture.queue.submit(alice).await.unwrap();
        let queue = fixture.queue.clone();
        let pairing = tokio::spawn(async move { queue.submit(bob).await });

        let cancelled = timeout(Duration::from_secs(2), fixture.queue.cancel(carol.connection)).await;
        assert_eq!(cancelled, Ok(false));

        let status = pairing.await.unwrap().unwrap();
        assert!(matches!(status, WaitStatus::Matched { slot: PlayerSlot::Two, .. }));
        assert_eq!(match_found(rx_bob.recv().await).opponent.username, "Alice");

        // The player who stopped reading is dropped instead.
        assert_eq!(eviction.await, Ok(()));
        assert_eq!(fixture.hub.connection_count().await, 2);
        assert!(fixture.queue.is_empty().await);
    }
}
