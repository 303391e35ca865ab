//! Room Broadcast Hub
//!
//! Directory of live connections and their room subscriptions.
//!
//! Ordering contract: each room has a single producer (its session task),
//! and every delivery goes through one per-connection queue, so a subscriber
//! receives a room's events in the order they were produced.
//!
//! Delivery never waits on a client. When a connection's queue is full,
//! state updates and paddle echoes are dropped for that connection only; any
//! other frame evicts it from the hub, and its transport is told to close.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, trace, warn};

use crate::game::state::RoomId;
use crate::network::protocol::ServerMessage;

/// Identifier of one transport connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    /// Fresh random id.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell connections apart in logs.
        let id = self.0.simple().to_string();
        f.write_str(&id[..8])
    }
}

/// Delivery errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Connection is not registered.
    #[error("connection {0} not registered")]
    NotConnected(ConnectionId),

    /// Connection's outbound queue is closed.
    #[error("connection {0} closed")]
    Closed(ConnectionId),

    /// Connection's outbound queue was full; it has been evicted.
    #[error("connection {0} fell behind and was evicted")]
    Lagging(ConnectionId),

    /// Some subscribers of a room could not be reached.
    #[error("{count} subscriber(s) of room {room} unreachable")]
    Undeliverable {
        /// Room being broadcast to.
        room: RoomId,
        /// Number of failed deliveries.
        count: usize,
    },
}

/// Resolves when the hub evicts the connection it was issued for.
pub type Eviction = oneshot::Receiver<()>;

struct Outbound {
    sender: mpsc::Sender<ServerMessage>,
    evicted: oneshot::Sender<()>,
}

enum Delivery {
    Sent,
    Skipped,
    Lagging,
    Closed,
}

fn offer(
    conn: ConnectionId,
    sender: &mpsc::Sender<ServerMessage>,
    msg: ServerMessage,
) -> Delivery {
    match sender.try_send(msg) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(msg)) if msg.is_high_frequency() => {
            trace!("Queue of {} full, frame dropped", conn);
            Delivery::Skipped
        }
        Err(TrySendError::Full(_)) => Delivery::Lagging,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

#[derive(Default)]
struct HubInner {
    connections: BTreeMap<ConnectionId, Outbound>,
    rooms: BTreeMap<RoomId, BTreeSet<ConnectionId>>,
}

impl HubInner {
    fn forget(&mut self, conn: ConnectionId) -> Option<Outbound> {
        self.rooms.retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });
        self.connections.remove(&conn)
    }
}

/// Fan-out of server messages to connections and rooms.
#[derive(Default)]
pub struct BroadcastHub {
    inner: RwLock<HubInner>,
}

impl BroadcastHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound queue.
    ///
    /// The returned [`Eviction`] fires if the connection is dropped for
    /// falling behind.
    pub async fn register(
        &self,
        conn: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Eviction {
        let (evicted, eviction) = oneshot::channel();
        self.inner
            .write()
            .await
            .connections
            .insert(conn, Outbound { sender, evicted });
        debug!("Registered connection {}", conn);
        eviction
    }

    /// Drop a connection and all of its subscriptions.
    pub async fn unregister(&self, conn: ConnectionId) {
        self.inner.write().await.forget(conn);
    }

    async fn evict(&self, conn: ConnectionId) {
        if let Some(outbound) = self.inner.write().await.forget(conn) {
            warn!("Connection {} fell behind, evicting", conn);
            let _ = outbound.evicted.send(());
        }
    }

    /// Add a connection to a room's group.
    pub async fn subscribe(&self, room: &RoomId, conn: ConnectionId) {
        let mut inner = self.inner.write().await;
        inner.rooms.entry(room.clone()).or_default().insert(conn);
    }

    /// Remove a connection from a room's group.
    pub async fn unsubscribe(&self, room: &RoomId, conn: ConnectionId) {
        let mut inner = self.inner.write().await;
        if let Some(members) = inner.rooms.get_mut(room) {
            members.remove(&conn);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
    }

    /// Current members of a room.
    pub async fn subscribers(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Deliver a message to every member of a room.
    ///
    /// Senders are collected under the lock and offered outside it.
    pub async fn broadcast(&self, room: &RoomId, msg: ServerMessage) -> Result<(), HubError> {
        let targets: Vec<_> = {
            let inner = self.inner.read().await;
            match inner.rooms.get(room) {
                Some(members) => members
                    .iter()
                    .filter_map(|conn| {
                        inner
                            .connections
                            .get(conn)
                            .map(|outbound| (*conn, outbound.sender.clone()))
                    })
                    .collect(),
                None => return Ok(()),
            }
        };

        if msg.is_high_frequency() {
            trace!("Broadcast to {} ({} subscribers)", room, targets.len());
        } else {
            debug!("Broadcast to {} ({} subscribers): {:?}", room, targets.len(), msg);
        }

        let mut failed = 0;
        let mut lagging = Vec::new();
        for (conn, sender) in targets {
            match offer(conn, &sender, msg.clone()) {
                Delivery::Sent | Delivery::Skipped => {}
                Delivery::Lagging => {
                    lagging.push(conn);
                    failed += 1;
                }
                Delivery::Closed => failed += 1,
            }
        }
        for conn in lagging {
            self.evict(conn).await;
        }

        if failed > 0 {
            return Err(HubError::Undeliverable {
                room: room.clone(),
                count: failed,
            });
        }
        Ok(())
    }

    /// Deliver a message to one connection.
    pub async fn send_to(&self, conn: ConnectionId, msg: ServerMessage) -> Result<(), HubError> {
        let sender = self
            .inner
            .read()
            .await
            .connections
            .get(&conn)
            .map(|outbound| outbound.sender.clone())
            .ok_or(HubError::NotConnected(conn))?;

        match offer(conn, &sender, msg) {
            Delivery::Sent | Delivery::Skipped => Ok(()),
            Delivery::Lagging => {
                self.evict(conn).await;
                Err(HubError::Lagging(conn))
            }
            Delivery::Closed => Err(HubError::Closed(conn)),
        }
    }

    /// Drop a room's group entirely.
    pub async fn close_room(&self, room: &RoomId) {
        self.inner.write().await.rooms.remove(room);
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{Ball, PlayerSlot, Score};
    use crate::network::protocol::GameEvent;

    fn joined(slot: PlayerSlot) -> ServerMessage {
        ServerMessage::game(GameEvent::PlayerJoined { player_number: slot })
    }

    #[tokio::test]
    async fn test_broadcast_reaches_room_members_only() {
        let hub = BroadcastHub::new();
        let room = RoomId::new("game_a");
        let (a, b, c) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let (tx_c, mut rx_c) = mpsc::channel(8);
        hub.register(a, tx_a).await;
        hub.register(b, tx_b).await;
        hub.register(c, tx_c).await;
        hub.subscribe(&room, a).await;
        hub.subscribe(&room, b).await;

        hub.broadcast(&room, joined(PlayerSlot::One)).await.unwrap();

        assert_eq!(rx_a.recv().await, Some(joined(PlayerSlot::One)));
        assert_eq!(rx_b.recv().await, Some(joined(PlayerSlot::One)));
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order() {
        let hub = BroadcastHub::new();
        let room = RoomId::new("game_a");
        let conn = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.register(conn, tx).await;
        hub.subscribe(&room, conn).await;

        hub.broadcast(&room, joined(PlayerSlot::One)).await.unwrap();
        hub.broadcast(&room, ServerMessage::game(GameEvent::GameStart)).await.unwrap();

        assert_eq!(rx.recv().await, Some(joined(PlayerSlot::One)));
        assert_eq!(rx.recv().await, Some(ServerMessage::game(GameEvent::GameStart)));
    }

    #[tokio::test]
    async fn test_closed_receiver_reported() {
        let hub = BroadcastHub::new();
        let room = RoomId::new("game_a");
        let (live, dead) = (ConnectionId::new(), ConnectionId::new());
        let (tx_live, mut rx_live) = mpsc::channel(8);
        let (tx_dead, rx_dead) = mpsc::channel(8);
        drop(rx_dead);
        hub.register(live, tx_live).await;
        hub.register(dead, tx_dead).await;
        hub.subscribe(&room, live).await;
        hub.subscribe(&room, dead).await;

        let result = hub.broadcast(&room, joined(PlayerSlot::Two)).await;
        assert_eq!(
            result,
            Err(HubError::Undeliverable { room: room.clone(), count: 1 })
        );
        // The live subscriber still got it.
        assert_eq!(rx_live.recv().await, Some(joined(PlayerSlot::Two)));

        assert_eq!(
            hub.send_to(dead, joined(PlayerSlot::Two)).await,
            Err(HubError::Closed(dead))
        );
    }

    #[tokio::test]
    async fn test_unregister_drops_subscriptions() {
        let hub = BroadcastHub::new();
        let room = RoomId::new("game_a");
        let conn = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(8);
        hub.register(conn, tx).await;
        hub.subscribe(&room, conn).await;
        assert_eq!(hub.subscribers(&room).await, vec![conn]);

        hub.unregister(conn).await;
        assert!(hub.subscribers(&room).await.is_empty());
        assert_eq!(hub.connection_count().await, 0);
        assert_eq!(
            hub.send_to(conn, joined(PlayerSlot::One)).await,
            Err(HubError::NotConnected(conn))
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close_room() {
        let hub = BroadcastHub::new();
        let room = RoomId::new("game_a");
        let (a, b) = (ConnectionId::new(), ConnectionId::new());
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, _rx_b) = mpsc::channel(8);
        hub.register(a, tx_a).await;
        hub.register(b, tx_b).await;
        hub.subscribe(&room, a).await;
        hub.subscribe(&room, b).await;

        hub.unsubscribe(&room, a).await;
        assert_eq!(hub.subscribers(&room).await, vec![b]);

        hub.close_room(&room).await;
        assert!(hub.subscribers(&room).await.is_empty());
        // Broadcasting to an empty room is not an error.
        assert!(hub.broadcast(&room, joined(PlayerSlot::One)).await.is_ok());
    }

    #[tokio::test]
    async fn test_full_queue_never_blocks_delivery() {
        let hub = BroadcastHub::new();
        let room = RoomId::new("game_a");
        let (slow, fast) = (ConnectionId::new(), ConnectionId::new());
        let (tx_slow, mut rx_slow) = mpsc::channel(1);
        let (tx_fast, mut rx_fast) = mpsc::channel(8);
        let mut eviction = hub.register(slow, tx_slow).await;
        hub.register(fast, tx_fast).await;
        hub.subscribe(&room, slow).await;
        hub.subscribe(&room, fast).await;
        hub.broadcast(&room, joined(PlayerSlot::One)).await.unwrap();

        // State updates are dropped for the full queue only.
        let update = ServerMessage::game(GameEvent::GameStateUpdate {
            ball: Ball::kickoff(),
            score: Score::default(),
        });
        hub.broadcast(&room, update.clone()).await.unwrap();
        assert!(eviction.try_recv().is_err());
        assert_eq!(hub.subscribers(&room).await.len(), 2);

        // Anything else evicts it.
        let result = hub.broadcast(&room, ServerMessage::game(GameEvent::GameStart)).await;
        assert_eq!(
            result,
            Err(HubError::Undeliverable { room: room.clone(), count: 1 })
        );
        assert_eq!(eviction.await, Ok(()));
        assert_eq!(hub.subscribers(&room).await, vec![fast]);
        assert_eq!(hub.connection_count().await, 1);

        assert_eq!(rx_fast.recv().await, Some(joined(PlayerSlot::One)));
        assert_eq!(rx_fast.recv().await, Some(update));
        assert_eq!(rx_fast.recv().await, Some(ServerMessage::game(GameEvent::GameStart)));
        assert_eq!(rx_slow.recv().await, Some(joined(PlayerSlot::One)));
    }

    #[tokio::test]
    async fn test_send_to_full_queue_evicts() {
        let hub = BroadcastHub::new();
        let conn = ConnectionId::new();
        let (tx, _rx) = mpsc::channel(1);
        let eviction = hub.register(conn, tx).await;

        hub.send_to(conn, joined(PlayerSlot::One)).await.unwrap();
        assert_eq!(
            hub.send_to(conn, joined(PlayerSlot::Two)).await,
            Err(HubError::Lagging(conn))
        );
        assert_eq!(eviction.await, Ok(()));
        assert_eq!(
            hub.send_to(conn, joined(PlayerSlot::Two)).await,
            Err(HubError::NotConnected(conn))
        );
    }
}
