//! Session Registry
//!
//! Process-wide map from room to its running session. Lookups create the
//! session on first use; a supervisor task per session removes the entry
//! when the session finishes and reports a crashed session to its room.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::game::state::RoomId;
use crate::network::broadcast::BroadcastHub;
use crate::network::protocol::{GameEvent, ServerMessage};
use crate::network::session::{GameSession, SessionConfig, SessionHandle};
use crate::persistence::PersistenceGateway;

/// Registry of live sessions.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<RoomId, SessionHandle>>,
    config: Arc<SessionConfig>,
    hub: Arc<BroadcastHub>,
    persistence: Arc<dyn PersistenceGateway>,
    next_instance: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new(
        config: SessionConfig,
        hub: Arc<BroadcastHub>,
        persistence: Arc<dyn PersistenceGateway>,
    ) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            config: Arc::new(config),
            hub,
            persistence,
            next_instance: AtomicU64::new(1),
        }
    }

    /// Session for `room`, started if absent or if the previous one closed.
    pub async fn get_or_create(self: &Arc<Self>, room: &RoomId) -> SessionHandle {
        let mut sessions = self.sessions.write().await;

        if let Some(handle) = sessions.get(room) {
            if !handle.is_closed() {
                return handle.clone();
            }
            debug!("Replacing closed session {} #{}", room, handle.instance());
        }

        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let (handle, task) = GameSession::spawn(
            room.clone(),
            instance,
            self.config.clone(),
            self.hub.clone(),
            self.persistence.clone(),
        );
        sessions.insert(room.clone(), handle.clone());
        drop(sessions);

        self.supervise(room.clone(), instance, task);
        handle
    }

    /// Live session for `room`, without creating one.
    pub async fn get(&self, room: &RoomId) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(room)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Remove `room` if it still maps to `instance`.
    pub async fn remove(&self, room: &RoomId, instance: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(room) {
            Some(handle) if handle.instance() == instance => {
                sessions.remove(room);
                true
            }
            _ => false,
        }
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// True when no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    fn supervise(self: &Arc<Self>, room: RoomId, instance: u64, task: JoinHandle<()>) {
        let registry = self.clone();

        tokio::spawn(async move {
            let result = task.await;
            let removed = registry.remove(&room, instance).await;

            match result {
                Ok(()) => info!("Session {} #{} reclaimed", room, instance),
                Err(e) => {
                    error!("Session {} #{} crashed: {}", room, instance, e);
                    if removed {
                        let event = GameEvent::GameInterrupted {
                            reason: "internal error".to_string(),
                            player_number: None,
                        };
                        let _ = registry.hub.broadcast(&room, ServerMessage::game(event)).await;
                        registry.hub.close_room(&room).await;
                    }
                }
            }
        });
    }
}
