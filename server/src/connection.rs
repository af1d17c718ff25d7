//! Client connections and their outbound mailboxes.
//!
//! A [`Connection`] is the capability set the hub and rooms need from a live
//! client: identity lookup, room lookup, a non-blocking enqueue and an
//! idempotent close. [`Session`] is the real implementation backing a
//! WebSocket; tests provide their own stand-ins.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting --activate--> Active --close--> Closing --mark_closed--> Closed
//! ```
//!
//! `close` may be invoked from several paths at once (inbound failure,
//! outbound failure, hub eviction). Only the first call wins; the rest are
//! no-ops.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::types::Message;

/// Default capacity of a connection's outbound mailbox.
///
/// Must be at least the room history limit so a full join replay fits.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Server-generated key for a live connection.
///
/// Identities are not unique over time (nor across tabs), so membership is
/// keyed by this instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiving end of a connection's outbound mailbox.
pub type Mailbox = mpsc::Receiver<Arc<Message>>;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message is in the mailbox.
    Queued,
    /// The mailbox was full or closed; the message is lost.
    Dropped,
}

impl SendOutcome {
    pub fn is_queued(self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// What the hub and rooms need from a live client.
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    /// The authenticated user identity.
    fn identity(&self) -> &str;

    /// The room joined at connect time.
    fn room_name(&self) -> &str;

    /// Enqueues without blocking; drops the message if the mailbox is full.
    fn send(&self, msg: Arc<Message>) -> SendOutcome;

    /// Begins teardown. Returns `true` only for the call that performed it.
    fn close(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Hands out the mailbox receiver. Returns `None` after the first call.
    fn take_mailbox(&self) -> Option<Mailbox>;
}

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Resolves once the owning connection has been closed.
#[derive(Debug, Clone)]
pub struct CloseSignal(watch::Receiver<bool>);

impl CloseSignal {
    /// Waits until the connection is closed.
    ///
    /// Also resolves if the connection itself has been dropped.
    pub async fn closed(&mut self) {
        let _ = self.0.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.0.borrow()
    }
}

/// A live WebSocket client session.
pub struct Session {
    id: ConnectionId,
    identity: String,
    room: String,
    sender: mpsc::Sender<Arc<Message>>,
    mailbox: Mutex<Option<Mailbox>>,
    state: AtomicU8,
    closed_tx: watch::Sender<bool>,
}

impl Session {
    /// Creates a session in the `Connecting` state with a bounded mailbox.
    ///
    /// # Panics
    ///
    /// Panics if `mailbox_capacity` is 0.
    pub fn new(
        identity: impl Into<String>,
        room: impl Into<String>,
        mailbox_capacity: usize,
    ) -> Self {
        let (sender, mailbox) = mpsc::channel(mailbox_capacity);
        let (closed_tx, _) = watch::channel(false);
        Self {
            id: ConnectionId::new(),
            identity: identity.into(),
            room: room.into(),
            sender,
            mailbox: Mutex::new(Some(mailbox)),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            closed_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `Connecting -> Active`. Returns `false` from any other state.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Connecting as u8,
                ConnectionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Records that both pumps have exited and the transport is released.
    pub fn mark_closed(&self) {
        self.close();
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        debug!(connection_id = %self.id, identity = %self.identity, "Session closed");
    }

    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal(self.closed_tx.subscribe())
    }
}

impl Connection for Session {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn room_name(&self) -> &str {
        &self.room
    }

    fn send(&self, msg: Arc<Message>) -> SendOutcome {
        if self.is_closed() {
            return SendOutcome::Dropped;
        }
        match self.sender.try_send(msg) {
            Ok(()) => SendOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(connection_id = %self.id, identity = %self.identity, "Mailbox full, message dropped");
                SendOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Dropped,
        }
    }

    fn close(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= ConnectionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.closed_tx.send_replace(true);
        debug!(connection_id = %self.id, identity = %self.identity, "Session closing");
        true
    }

    fn is_closed(&self) -> bool {
        self.state() >= ConnectionState::Closing
    }

    fn take_mailbox(&self) -> Option<Mailbox> {
        self.mailbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("room", &self.room)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn msg(text: &str) -> Arc<Message> {
        Arc::new(Message::broadcast("alice", "lobby", text).unwrap())
    }

    #[test]
    fn new_session_starts_connecting() {
        let session = Session::new("alice", "lobby", 4);
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.identity(), "alice");
        assert_eq!(session.room_name(), "lobby");
        assert!(!session.is_closed());
    }

    #[test]
    fn activate_only_from_connecting() {
        let session = Session::new("alice", "lobby", 4);
        assert!(session.activate());
        assert!(!session.activate());
        assert_eq!(session.state(), ConnectionState::Active);
    }

    #[tokio::test]
    async fn send_queues_until_full_then_drops() {
        let session = Session::new("alice", "lobby", 2);
        let mut mailbox = session.take_mailbox().unwrap();

        assert_eq!(session.send(msg("one")), SendOutcome::Queued);
        assert_eq!(session.send(msg("two")), SendOutcome::Queued);
        assert_eq!(session.send(msg("three")), SendOutcome::Dropped);

        assert_eq!(mailbox.recv().await.unwrap().body(), "one");
        assert_eq!(mailbox.recv().await.unwrap().body(), "two");
        assert!(mailbox.try_recv().is_err());
    }

    #[test]
    fn send_after_close_is_dropped() {
        let session = Session::new("alice", "lobby", 2);
        session.close();
        assert_eq!(session.send(msg("late")), SendOutcome::Dropped);
    }

    #[test]
    fn take_mailbox_only_once() {
        let session = Session::new("alice", "lobby", 2);
        assert!(session.take_mailbox().is_some());
        assert!(session.take_mailbox().is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let session = Session::new("alice", "lobby", 2);
        session.activate();
        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), ConnectionState::Closing);
    }

    #[tokio::test]
    async fn concurrent_close_has_single_winner() {
        let session = Arc::new(Session::new("alice", "lobby", 2));
        session.activate();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let session = session.clone();
                tokio::spawn(async move { session.close() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn close_signal_resolves_on_close() {
        let session = Session::new("alice", "lobby", 2);
        let mut signal = session.close_signal();
        assert!(!signal.is_closed());

        session.close();

        tokio::time::timeout(Duration::from_secs(1), signal.closed())
            .await
            .expect("close signal should fire");
        assert!(signal.is_closed());
    }

    #[test]
    fn mark_closed_reaches_terminal_state() {
        let session = Session::new("alice", "lobby", 2);
        session.activate();
        session.mark_closed();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(!session.close());
        assert!(!session.activate());
    }
}
