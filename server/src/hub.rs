//! Connection registry and message router for the Huddle server.
//!
//! The [`Hub`] is the single owner of cross-room state: the set of all live
//! connections and the map of rooms. It is constructed once at startup and
//! shared by reference (`Arc<Hub>`) with every handler and pump.
//!
//! # Architecture
//!
//! ```text
//!             register / unregister / route
//!   pumps ─────────────────────────────────────▶ Hub
//!                                                 │ connections (RwLock)
//!                                                 │ rooms       (RwLock)
//!                                                 ▼
//!                               Room "lobby"   Room "random"   ...
//!                               inbox ─▶ task ─▶ member mailboxes
//! ```
//!
//! Operations run directly under per-structure locks; there is no central
//! coordination task. Locks are held only for map mutation, never across
//! transport I/O.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use huddle_server::connection::{Connection, Session};
//! use huddle_server::hub::{Hub, HubConfig};
//! use huddle_server::types::Message;
//!
//! # tokio_test::block_on(async {
//! let hub = Hub::new(HubConfig::default());
//!
//! let alice = Arc::new(Session::new("alice", "lobby", 64));
//! hub.register(alice.clone()).await.unwrap();
//!
//! let msg = Message::broadcast("alice", "lobby", "hi").unwrap();
//! hub.route(msg).await;
//!
//! hub.unregister(alice.as_ref()).await;
//! hub.shutdown().await;
//! # });
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use crate::connection::{Connection, ConnectionId, DEFAULT_MAILBOX_CAPACITY};
use crate::error::{Result, ServerError};
use crate::room::{Room, DEFAULT_INBOX_CAPACITY, HISTORY_LIMIT};
use crate::types::{Message, MessageKind};

/// Sizing for the queues owned by the hub, its rooms and its sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// Capacity of each connection's outbound mailbox.
    pub mailbox_capacity: usize,

    /// Capacity of each room's inbox.
    pub room_inbox_capacity: usize,

    /// Number of messages each room retains for join replay.
    pub history_limit: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            room_inbox_capacity: DEFAULT_INBOX_CAPACITY,
            history_limit: HISTORY_LIMIT,
        }
    }
}

/// Room name and current member count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub name: String,
    pub online: usize,
}

/// Registry of live connections and router of chat messages.
pub struct Hub {
    config: HubConfig,
    connections: RwLock<HashMap<ConnectionId, Arc<dyn Connection>>>,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    shutting_down: AtomicBool,
}

impl Hub {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        debug!(
            mailbox_capacity = config.mailbox_capacity,
            room_inbox_capacity = config.room_inbox_capacity,
            history_limit = config.history_limit,
            "Created hub"
        );
        Self {
            config,
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Registers a connection and joins it to its room.
    ///
    /// The connection first receives the room history, in order, through its
    /// own mailbox. It is then added as a member, and a "joined room" notice
    /// is published to the room.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ShuttingDown`] once [`Hub::shutdown`] has begun.
    /// The connection is closed in that case.
    pub async fn register(&self, conn: Arc<dyn Connection>) -> Result<Arc<Room>> {
        {
            // The flag flips under this lock, so a connection inserted here is
            // always in the set that shutdown closes.
            let mut connections = self.connections.write().await;
            if self.shutting_down.load(Ordering::Acquire) {
                drop(connections);
                conn.close();
                return Err(ServerError::ShuttingDown);
            }
            connections.insert(conn.id(), conn.clone());
        }

        let room = match self.get_or_create_room(conn.room_name()).await {
            Ok(room) => room,
            Err(err) => {
                self.connections.write().await.remove(&conn.id());
                conn.close();
                return Err(err);
            }
        };
        let replayed = room.admit(conn.clone()).await;

        info!(
            connection_id = %conn.id(),
            identity = %conn.identity(),
            room = %room.name(),
            replayed,
            "Connection registered"
        );

        let notice = Message::system(conn.identity(), format!("joined room {}", room.name()));
        room.broadcast(Arc::new(notice)).await;

        Ok(room)
    }

    /// Removes a connection, closes it and announces its departure.
    ///
    /// Safe to call repeatedly or concurrently for the same connection. Only
    /// the call that actually removes it closes it and publishes the "left
    /// room" notice. Returns whether this call did so.
    pub async fn unregister(&self, conn: &dyn Connection) -> bool {
        let room = self.room(conn.room_name()).await;
        if let Some(room) = &room {
            room.remove_member(conn.id()).await;
        }

        let removed = self.connections.write().await.remove(&conn.id()).is_some();
        if !removed {
            return false;
        }

        conn.close();
        info!(
            connection_id = %conn.id(),
            identity = %conn.identity(),
            room = %conn.room_name(),
            "Connection unregistered"
        );

        if let Some(room) = room {
            let notice = Message::system(conn.identity(), format!("left room {}", room.name()));
            room.broadcast(Arc::new(notice)).await;
        }
        true
    }

    /// Routes a message to its destination.
    ///
    /// - Direct messages go to every live connection of the recipient and a
    ///   copy to every live connection of the sender. If the recipient has no
    ///   live connection, nothing is delivered.
    /// - Broadcasts go to the named room's inbox. Unknown rooms are ignored.
    /// - System messages are published by the hub itself and are ignored here.
    ///
    /// Returns the number of mailboxes (direct) or rooms (broadcast) that
    /// accepted the message. Misses are never reported to the sender.
    pub async fn route(&self, msg: Message) -> usize {
        match msg.kind() {
            MessageKind::Direct => self.route_direct(Arc::new(msg)).await,
            MessageKind::Broadcast => {
                let Some(room) = self.room(msg.room().unwrap_or_default()).await else {
                    debug!(room = ?msg.room(), sender = %msg.sender(), "Broadcast to unknown room dropped");
                    return 0;
                };
                usize::from(room.broadcast(Arc::new(msg)).await)
            }
            MessageKind::System => {
                debug!(sender = %msg.sender(), "Ignoring externally routed system message");
                0
            }
        }
    }

    async fn route_direct(&self, msg: Arc<Message>) -> usize {
        let recipient = msg.recipient().unwrap_or_default();
        let targets: Vec<Arc<dyn Connection>> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|conn| conn.identity() == recipient || conn.identity() == msg.sender())
                .cloned()
                .collect()
        };

        if !targets.iter().any(|conn| conn.identity() == recipient) {
            debug!(
                sender = %msg.sender(),
                recipient = %recipient,
                "Direct message to offline identity dropped"
            );
            return 0;
        }

        let delivered = targets
            .iter()
            .filter(|conn| conn.send(msg.clone()).is_queued())
            .count();
        trace!(
            sender = %msg.sender(),
            recipient = %recipient,
            targets = targets.len(),
            delivered,
            "Direct message routed"
        );
        delivered
    }

    /// Returns the room with `name`, creating it and starting its task on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ShuttingDown`] if the room does not exist yet and
    /// [`Hub::shutdown`] has begun.
    pub async fn get_or_create_room(&self, name: &str) -> Result<Arc<Room>> {
        if let Some(room) = self.rooms.read().await.get(name) {
            return Ok(room.clone());
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(name) {
            return Ok(room.clone());
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ServerError::ShuttingDown);
        }

        info!(room = %name, "Creating room");
        let room = Room::spawn(name, self.config.room_inbox_capacity, self.config.history_limit);
        rooms.insert(name.to_string(), room.clone());
        Ok(room)
    }

    /// Returns the room with `name` if it has been created.
    pub async fn room(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Member identities of a room, or `None` if the room does not exist.
    pub async fn online_users(&self, room: &str) -> Option<Vec<String>> {
        let room = self.room(room).await?;
        Some(room.online_users().await)
    }

    /// All rooms with their current member counts, sorted by name.
    pub async fn room_summaries(&self) -> Vec<RoomSummary> {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            summaries.push(RoomSummary {
                name: room.name().to_string(),
                online: room.member_count().await,
            });
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Whether [`Hub::shutdown`] has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub async fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.read().await.contains_key(&id)
    }

    /// Closes every connection and stops every room task.
    ///
    /// Rooms deliver whatever is already queued before stopping. New
    /// registrations are refused from this point on.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<dyn Connection>> = {
            let connections = self.connections.write().await;
            if self.shutting_down.swap(true, Ordering::AcqRel) {
                return;
            }
            connections.values().cloned().collect()
        };
        info!(connections = connections.len(), "Hub shutting down");
        for conn in &connections {
            conn.close();
        }

        // Rooms are only created while the flag is clear and under this lock,
        // so the snapshot holds every room there will ever be.
        let rooms: Vec<Arc<Room>> = self.rooms.write().await.values().cloned().collect();
        for room in rooms {
            room.shutdown().await;
        }
        info!("Hub shutdown complete");
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("config", &self.config)
            .field("shutting_down", &self.shutting_down.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Session;

    #[tokio::test]
    async fn get_or_create_room_is_idempotent() {
        let hub = Hub::default();
        let first = hub.get_or_create_room("lobby").await.unwrap();
        let second = hub.get_or_create_room("lobby").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(hub.room_count().await, 1);
    }

    #[tokio::test]
    async fn room_lookup_does_not_create() {
        let hub = Hub::default();
        assert!(hub.room("nowhere").await.is_none());
        assert!(hub.online_users("nowhere").await.is_none());
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn register_adds_to_registry_and_room() {
        let hub = Hub::default();
        let session = Arc::new(Session::new("alice", "lobby", 64));

        let room = hub.register(session.clone()).await.unwrap();

        assert!(hub.is_registered(session.id()).await);
        assert!(room.contains(session.id()).await);
        assert_eq!(hub.online_users("lobby").await.unwrap(), ["alice"]);
    }

    #[tokio::test]
    async fn unregister_twice_is_noop() {
        let hub = Hub::default();
        let session = Arc::new(Session::new("alice", "lobby", 64));
        let room = hub.register(session.clone()).await.unwrap();

        assert!(hub.unregister(session.as_ref()).await);
        assert!(!hub.unregister(session.as_ref()).await);

        assert!(session.is_closed());
        assert!(!hub.is_registered(session.id()).await);
        assert!(!room.contains(session.id()).await);
    }

    #[tokio::test]
    async fn room_summaries_are_sorted() {
        let hub = Hub::default();
        hub.register(Arc::new(Session::new("a", "zeta", 64))).await.unwrap();
        hub.register(Arc::new(Session::new("b", "alpha", 64))).await.unwrap();
        hub.register(Arc::new(Session::new("c", "alpha", 64))).await.unwrap();

        let summaries = hub.room_summaries().await;
        assert_eq!(
            summaries,
            [
                RoomSummary { name: "alpha".into(), online: 2 },
                RoomSummary { name: "zeta".into(), online: 1 },
            ]
        );
    }

    #[tokio::test]
    async fn register_after_shutdown_is_refused() {
        let hub = Hub::default();
        hub.shutdown().await;

        let session = Arc::new(Session::new("alice", "lobby", 64));
        let result = hub.register(session.clone()).await;

        assert!(matches!(result, Err(ServerError::ShuttingDown)));
        assert!(session.is_closed());
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn rooms_are_not_created_after_shutdown() {
        let hub = Hub::default();
        let lobby = hub.get_or_create_room("lobby").await.unwrap();
        hub.shutdown().await;

        assert!(Arc::ptr_eq(&hub.get_or_create_room("lobby").await.unwrap(), &lobby));
        assert!(matches!(
            hub.get_or_create_room("fresh").await,
            Err(ServerError::ShuttingDown)
        ));
        assert_eq!(hub.room_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_racing_registrations_leaves_nothing_running() {
        for round in 0..100 {
            let hub = Arc::new(Hub::default());
            let sessions: Vec<Arc<Session>> = (0..8)
                .map(|i| Arc::new(Session::new(format!("user{i}"), format!("room{round}-{i}"), 64)))
                .collect();

            let registrations: Vec<_> = sessions
                .iter()
                .map(|session| {
                    let hub = hub.clone();
                    let session = session.clone();
                    tokio::spawn(async move { hub.register(session).await.is_ok() })
                })
                .collect();
            hub.shutdown().await;
            for registration in registrations {
                registration.await.unwrap();
            }

            for session in &sessions {
                assert!(session.is_closed(), "round {round}: session left open");
            }
            let summaries = hub.room_summaries().await;
            for summary in summaries {
                let room = hub.room(&summary.name).await.unwrap();
                let late = Message::system("hub", "after shutdown");
                assert!(
                    !room.broadcast(Arc::new(late)).await,
                    "round {round}: room {} still running",
                    summary.name
                );
            }
        }
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let hub = Hub::default();
        let alice = Arc::new(Session::new("alice", "lobby", 64));
        let bob = Arc::new(Session::new("bob", "random", 64));
        hub.register(alice.clone()).await.unwrap();
        hub.register(bob.clone()).await.unwrap();

        hub.shutdown().await;

        assert!(alice.is_closed());
        assert!(bob.is_closed());
    }
}
