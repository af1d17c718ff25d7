//! Named broadcast rooms.
//!
//! Each [`Room`] owns its member set, a bounded inbox and a capped history
//! ring, and runs one dedicated task that drains the inbox. Slow fan-out in
//! one room never blocks another room or the hub.
//!
//! # Ordering
//!
//! The room task holds the history lock while it fans a message out and
//! appends it, and [`Room::admit`] holds the same lock while it replays
//! history and inserts the new member. A joiner therefore receives the
//! history and then every later broadcast, with nothing missed or repeated.
//! Lock order is always history, then members.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::connection::{Connection, ConnectionId};
use crate::types::Message;

/// Number of messages retained per room.
pub const HISTORY_LIMIT: usize = 50;

/// Default capacity of a room's inbox.
pub const DEFAULT_INBOX_CAPACITY: usize = 128;

/// A named broadcast domain.
pub struct Room {
    name: String,
    members: RwLock<HashMap<ConnectionId, Arc<dyn Connection>>>,
    history: RwLock<VecDeque<Arc<Message>>>,
    history_limit: usize,
    inbox: mpsc::Sender<Arc<Message>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    /// Creates a room and starts its processing task.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if `inbox_capacity` is 0.
    pub fn spawn(name: impl Into<String>, inbox_capacity: usize, history_limit: usize) -> Arc<Self> {
        let (inbox, rx) = mpsc::channel(inbox_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let room = Arc::new(Self {
            name: name.into(),
            members: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(history_limit)),
            history_limit,
            inbox,
            shutdown_tx,
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(room.clone().run(rx, shutdown_rx));
        *room.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        debug!(room = %room.name, inbox_capacity, history_limit, "Room created");
        room
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a message for fan-out to the current members.
    ///
    /// Waits for inbox capacity, which only back-pressures the caller.
    /// Returns `false` if the room has been shut down and the message was
    /// discarded.
    pub async fn broadcast(&self, msg: Arc<Message>) -> bool {
        trace!(room = %self.name, sender = %msg.sender(), "Queueing room message");
        if self.inbox.send(msg).await.is_err() {
            debug!(room = %self.name, "Room is shut down, message discarded");
            return false;
        }
        true
    }

    /// Replays history to `conn` in chronological order, then adds it as a
    /// member. Returns the number of replayed messages.
    pub async fn admit(&self, conn: Arc<dyn Connection>) -> usize {
        let history = self.history.read().await;
        let mut dropped = 0usize;
        for msg in history.iter() {
            if !conn.send(msg.clone()).is_queued() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!(
                room = %self.name,
                identity = %conn.identity(),
                dropped,
                "Mailbox overflowed during history replay"
            );
        }

        self.members.write().await.insert(conn.id(), conn);
        history.len()
    }

    /// Adds a member without replaying history. Returns `false` if it was
    /// already present.
    pub async fn add_member(&self, conn: Arc<dyn Connection>) -> bool {
        let mut members = self.members.write().await;
        if members.contains_key(&conn.id()) {
            return false;
        }
        members.insert(conn.id(), conn);
        true
    }

    /// Removes a member. Returns `false` if it was not present.
    pub async fn remove_member(&self, id: ConnectionId) -> bool {
        self.members.write().await.remove(&id).is_some()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.members.read().await.contains_key(&id)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Point-in-time snapshot of member identities, sorted.
    pub async fn online_users(&self) -> Vec<String> {
        let members = self.members.read().await;
        let mut users: Vec<String> = members
            .values()
            .map(|conn| conn.identity().to_string())
            .collect();
        users.sort();
        users
    }

    /// Snapshot of the retained history, oldest first.
    pub async fn history(&self) -> Vec<Arc<Message>> {
        self.history.read().await.iter().cloned().collect()
    }

    /// Stops the processing task after draining already-queued messages.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(room = %self.name, error = %err, "Room task ended abnormally");
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::Receiver<Arc<Message>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let stopping = loop {
            tokio::select! {
                msg = inbox.recv() => match msg {
                    Some(msg) => self.deliver(msg).await,
                    None => break false,
                },
                () = stop_requested(&mut shutdown) => break true,
            }
        };

        if stopping {
            inbox.close();
            while let Some(msg) = inbox.recv().await {
                self.deliver(msg).await;
            }
        }
        debug!(room = %self.name, "Room task stopped");
    }

    async fn deliver(&self, msg: Arc<Message>) {
        let mut history = self.history.write().await;
        {
            let members = self.members.read().await;
            let mut dropped = 0usize;
            for member in members.values() {
                if !member.send(msg.clone()).is_queued() {
                    dropped += 1;
                }
            }
            trace!(
                room = %self.name,
                recipients = members.len(),
                dropped,
                "Room message delivered"
            );
        }

        history.push_back(msg);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone. The
/// `watch::Ref` from `wait_for` is not `Send` and must not outlive this call.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("history_limit", &self.history_limit)
            .finish_non_exhaustive()
    }
}
