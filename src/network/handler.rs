//! Connection Handler
//!
//! Per-connection protocol adapter. Turns inbound frames into session and
//! matchmaking calls; outbound traffic reaches the client through the
//! connection's queue registered in the [`BroadcastHub`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::game::state::{PlayerSlot, RoomId};
use crate::network::broadcast::{BroadcastHub, ConnectionId, Eviction};
use crate::network::matchmaking::{MatchTicket, MatchmakingConfig, MatchmakingQueue, WaitStatus};
use crate::network::protocol::{ClientMessage, ErrorCode, MatchRequest, ServerMessage};
use crate::network::registry::SessionRegistry;
use crate::network::session::{JoinOutcome, SessionConfig, SessionHandle};
use crate::persistence::{IdentityRef, PersistenceGateway};

/// Shared services every connection talks to.
#[derive(Clone)]
pub struct ServerContext {
    /// Connection directory and room groups.
    pub hub: Arc<BroadcastHub>,
    /// Live sessions.
    pub registry: Arc<SessionRegistry>,
    /// Players waiting for an opponent.
    pub matchmaking: Arc<MatchmakingQueue>,
}

impl ServerContext {
    /// Wire up hub, registry and queue around a persistence gateway.
    pub fn new(
        session: SessionConfig,
        matchmaking: MatchmakingConfig,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let hub = Arc::new(BroadcastHub::new());
        let registry = Arc::new(SessionRegistry::new(session, hub.clone(), persistence.clone()));
        let matchmaking = Arc::new(MatchmakingQueue::new(
            matchmaking,
            hub.clone(),
            registry.clone(),
            persistence,
        ));
        Self {
            hub,
            registry,
            matchmaking,
        }
    }
}

struct JoinedRoom {
    session: SessionHandle,
}

/// Protocol state of one connection.
pub struct ConnectionHandler {
    id: ConnectionId,
    identity: Option<IdentityRef>,
    ctx: ServerContext,
    room: Option<JoinedRoom>,
    eviction: Eviction,
}

impl ConnectionHandler {
    /// Register a new connection whose outbound frames go to `sender`.
    pub async fn connect(
        ctx: ServerContext,
        identity: Option<IdentityRef>,
        sender: mpsc::Sender<ServerMessage>,
    ) -> Self {
        let id = ConnectionId::new();
        let eviction = ctx.hub.register(id, sender).await;
        Self {
            id,
            identity,
            ctx,
            room: None,
            eviction,
        }
    }

    /// Resolves once the hub dropped this connection for falling behind.
    /// Poll it only until it first resolves.
    pub async fn evicted(&mut self) {
        let _ = (&mut self.eviction).await;
    }

    /// This connection's id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Room this connection currently plays in.
    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref().map(|joined| joined.session.room())
    }

    /// Handle one text frame. Malformed frames get an error reply and are
    /// otherwise ignored.
    pub async fn handle_text(&mut self, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                debug!("Invalid message from {}: {}", self.id, e);
                self.reply(ServerMessage::error(
                    ErrorCode::InvalidMessage,
                    "Invalid message format",
                ))
                .await;
            }
        }
    }

    /// Handle one parsed message.
    pub async fn handle(&mut self, msg: ClientMessage) {
        if matches!(msg, ClientMessage::PaddleMove { .. }) {
            trace!("<- {}: {:?}", self.id, msg);
        } else {
            debug!("<- {}: {:?}", self.id, msg);
        }

        match msg {
            ClientMessage::JoinGame {
                game_id,
                player_number,
            } => self.join(game_id, player_number).await,
            ClientMessage::PaddleMove { position } => self.paddle_move(position).await,
            ClientMessage::GameInterrupted {
                reason,
                game_id,
                ..
            } => self.interrupt(reason, game_id).await,
            ClientMessage::MatchRequest(request) => self.match_request(request).await,
            ClientMessage::CancelMatching => self.cancel_matching().await,
        }
    }

    async fn join(&mut self, room: RoomId, slot: PlayerSlot) {
        if self.room().is_some_and(|current| *current != room) {
            self.leave_room().await;
        }

        // A session that closes between lookup and join is replaced once.
        for attempt in 1..=2 {
            let session = self.ctx.registry.get_or_create(&room).await;
            match session.join(self.id, slot, self.identity.clone()).await {
                Ok(JoinOutcome::Joined) => {
                    self.room = Some(JoinedRoom { session });
                    return;
                }
                Ok(JoinOutcome::AlreadyEnded) => {
                    info!("{} joined finished room {}", self.id, room);
                    self.room = None;
                    return;
                }
                Err(e) => debug!("Join attempt {} for {} failed: {}", attempt, self.id, e),
            }
        }

        warn!("{} could not join {}", self.id, room);
        self.reply(ServerMessage::error(
            ErrorCode::RoomUnavailable,
            format!("Room {room} is not available"),
        ))
        .await;
    }

    async fn paddle_move(&mut self, position: f64) {
        let Some(joined) = &self.room else {
            trace!("Paddle move from {} outside a room", self.id);
            return;
        };
        if joined.session.paddle_move(self.id, position).await.is_err() {
            self.room = None;
        }
    }

    async fn interrupt(&mut self, reason: Option<String>, game_id: Option<RoomId>) {
        let reason = reason.unwrap_or_else(|| "unknown".to_string());

        let target = match (&self.room, &game_id) {
            (Some(joined), _) => Some(joined.session.clone()),
            (None, Some(room)) => self.ctx.registry.get(room).await,
            (None, None) => None,
        };

        let Some(session) = target else {
            self.reply(ServerMessage::error(
                ErrorCode::NotInRoom,
                "No game to interrupt",
            ))
            .await;
            return;
        };

        info!("{} interrupts {}: {}", self.id, session.room(), reason);
        if let Err(e) = session.interrupt(self.id, self.identity.clone(), reason).await {
            debug!("Interrupt from {} not delivered: {}", self.id, e);
        }
    }

    async fn match_request(&mut self, request: MatchRequest) {
        let ticket = MatchTicket {
            display_name: request.username,
            avatar_ref: request.avatar,
            identity: self.identity.clone(),
            connection: self.id,
        };

        match self.ctx.matchmaking.submit(ticket).await {
            Ok(WaitStatus::Waiting { .. }) => {
                self.reply(ServerMessage::MatchStatus {
                    message: "Waiting for opponent...".to_string(),
                })
                .await;
            }
            // match_found or the error frame was already delivered by the queue
            Ok(WaitStatus::Matched { room, .. }) => debug!("{} matched into {}", self.id, room),
            Err(e) => warn!("Matchmaking for {} failed: {}", self.id, e),
        }
    }

    async fn cancel_matching(&mut self) {
        self.ctx.matchmaking.cancel(self.id).await;
        self.reply(ServerMessage::MatchStatus {
            message: "Matching cancelled".to_string(),
        })
        .await;
    }

    async fn leave_room(&mut self) {
        if let Some(joined) = self.room.take() {
            if let Err(e) = joined.session.leave(self.id).await {
                debug!("Leave from {} not delivered: {}", self.id, e);
            }
        }
    }

    /// Transport closed: drop the ticket, leave the room, unregister.
    pub async fn disconnect(mut self) {
        self.ctx.matchmaking.cancel(self.id).await;
        self.leave_room().await;
        self.ctx.hub.unregister(self.id).await;
    }

    async fn reply(&self, msg: ServerMessage) {
        if let Err(e) = self.ctx.hub.send_to(self.id, msg).await {
            debug!("Reply to {} dropped: {}", self.id, e);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
