//! Per-connection delivery pumps.
//!
//! Every session runs two loops side by side:
//!
//! - the **inbound pump** reads frames under a rolling read deadline, turns
//!   them into [`Message`]s and hands them to the hub;
//! - the **outbound pump** drains the session mailbox to the wire and sends a
//!   heartbeat ping on a fixed interval, each write under its own deadline.
//!
//! Any failure on either side closes the session, which stops the other side.
//! The inbound pump always deregisters the session from the hub on exit.
//!
//! ```text
//!  wire ──▶ inbound_pump ──▶ Hub::route ──▶ Room / mailboxes
//!  wire ◀── outbound_pump ◀── mailbox
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, Mailbox, Session};
use crate::hub::Hub;
use crate::transport::{Frame, TransportError};
use crate::types::{InboundFrame, Message};

/// Rolling read deadline.
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between heartbeat pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(45);

/// Deadline for a single write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest accepted inbound frame.
pub const MAX_FRAME_BYTES: usize = 512;

/// Deadlines and limits for the pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    pub read_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            read_timeout: READ_TIMEOUT,
            ping_interval: PING_INTERVAL,
            write_timeout: WRITE_TIMEOUT,
            max_frame_bytes: MAX_FRAME_BYTES,
        }
    }
}

/// Registers `session`, runs both pumps until the connection ends, then
/// deregisters it.
///
/// Returns once both pumps have exited and the session is `Closed`.
pub async fn serve_session<K, S>(
    hub: &Hub,
    session: Arc<Session>,
    mut sink: K,
    stream: S,
    settings: PumpSettings,
) where
    K: Sink<Frame, Error = TransportError> + Unpin,
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let Some(mailbox) = session.take_mailbox() else {
        warn!(connection_id = %session.id(), "Session mailbox already taken");
        session.mark_closed();
        return;
    };

    if let Err(err) = hub.register(session.clone()).await {
        debug!(connection_id = %session.id(), error = %err, "Registration refused");
        let _ = timeout(settings.write_timeout, sink.send(Frame::Close)).await;
        session.mark_closed();
        return;
    }
    session.activate();

    let (inbound, outbound) = tokio::join!(
        inbound_pump(hub, &session, stream, &settings),
        outbound_pump(&session, mailbox, sink, &settings),
    );

    for (side, result) in [("inbound", inbound), ("outbound", outbound)] {
        if let Err(err) = result {
            debug!(
                connection_id = %session.id(),
                identity = %session.identity(),
                side,
                error = %err,
                "Pump ended with error"
            );
        }
    }

    session.mark_closed();
    info!(
        connection_id = %session.id(),
        identity = %session.identity(),
        room = %session.room_name(),
        "Connection finished"
    );
}

/// Reads frames and routes the messages they carry.
///
/// The read deadline restarts after every frame, liveness acknowledgments
/// included. Oversized or malformed frames, read errors and deadline expiry
/// all end the loop. Blank messages are skipped. On exit the session is
/// deregistered from `hub`.
pub async fn inbound_pump<S>(
    hub: &Hub,
    session: &Session,
    mut stream: S,
    settings: &PumpSettings,
) -> Result<(), TransportError>
where
    S: Stream<Item = Result<Frame, TransportError>> + Unpin,
{
    let mut closed = session.close_signal();

    let result = loop {
        let next = tokio::select! {
            _ = closed.closed() => break Ok(()),
            next = timeout(settings.read_timeout, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => break Err(TransportError::ReadTimeout(settings.read_timeout)),
            Ok(None) => break Err(TransportError::Closed),
            Ok(Some(Err(err))) => break Err(err),
            Ok(Some(Ok(frame))) => frame,
        };

        let payload = match frame {
            Frame::Ping(_) | Frame::Pong(_) => {
                trace!(connection_id = %session.id(), "Liveness frame received");
                continue;
            }
            Frame::Close => break Ok(()),
            Frame::Text(text) => text.into_bytes(),
            Frame::Binary(bytes) => bytes,
        };

        match decode(session, &payload, settings.max_frame_bytes) {
            Ok(Some(msg)) => {
                hub.route(msg).await;
            }
            Ok(None) => {
                trace!(connection_id = %session.id(), "Blank message discarded");
            }
            Err(err) => break Err(err),
        }
    };

    hub.unregister(session).await;
    session.close();
    result
}

fn decode(session: &Session, payload: &[u8], limit: usize) -> Result<Option<Message>, TransportError> {
    if payload.len() > limit {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            limit,
        });
    }
    let frame: InboundFrame =
        serde_json::from_slice(payload).map_err(|err| TransportError::Malformed(err.to_string()))?;
    Ok(frame.into_message(session.identity(), session.room_name()))
}

/// Writes queued messages and heartbeat pings until the session closes or a
/// write fails. Sends a close frame on the way out unless a write failed.
pub async fn outbound_pump<K>(
    session: &Session,
    mut mailbox: Mailbox,
    mut sink: K,
    settings: &PumpSettings,
) -> Result<(), TransportError>
where
    K: Sink<Frame, Error = TransportError> + Unpin,
{
    let mut closed = session.close_signal();
    let mut ticker = interval_at(Instant::now() + settings.ping_interval, settings.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            msg = mailbox.recv() => {
                let Some(msg) = msg else { break Ok(()) };
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(connection_id = %session.id(), error = %err, "Failed to serialize message");
                        continue;
                    }
                };
                if let Err(err) = write_frame(&mut sink, Frame::Text(text), settings.write_timeout).await {
                    break Err(err);
                }
            }
            _ = ticker.tick() => {
                trace!(connection_id = %session.id(), "Sending heartbeat ping");
                if let Err(err) = write_frame(&mut sink, Frame::Ping(Vec::new()), settings.write_timeout).await {
                    break Err(err);
                }
            }
            _ = closed.closed() => break Ok(()),
        }
    };

    // A sink that has returned an error must not be polled again.
    if result.is_ok() {
        let _ = timeout(settings.write_timeout, sink.send(Frame::Close)).await;
    }
    session.close();
    result
}

async fn write_frame<K>(sink: &mut K, frame: Frame, limit: Duration) -> Result<(), TransportError>
where
    K: Sink<Frame, Error = TransportError> + Unpin,
{
    match timeout(limit, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::WriteTimeout(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let settings = PumpSettings::default();
        assert_eq!(settings.read_timeout, Duration::from_secs(60));
        assert_eq!(settings.ping_interval, Duration::from_secs(45));
        assert_eq!(settings.write_timeout, Duration::from_secs(10));
        assert_eq!(settings.max_frame_bytes, 512);
    }

    #[test]
    fn decode_enforces_size_limit() {
        let session = Session::new("alice", "lobby", 4);
        let payload = format!(r#"{{"text":"{}"}}"#, "x".repeat(600));

        let err = decode(&session, payload.as_bytes(), MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, TransportError::FrameTooLarge { limit: 512, .. }));
    }

    #[test]
    fn decode_rejects_non_json() {
        let session = Session::new("alice", "lobby", 4);
        let err = decode(&session, b"hello", MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[test]
    fn decode_uses_session_identity_and_room() {
        let session = Session::new("alice", "lobby", 4);
        let msg = decode(&session, br#"{"type":"message","text":"hi"}"#, MAX_FRAME_BYTES)
            .unwrap()
            .unwrap();
        assert_eq!(msg.sender(), "alice");
        assert_eq!(msg.room(), Some("lobby"));
    }

    #[tokio::test]
    async fn outbound_stops_touching_sink_after_write_error() {
        let session = Session::new("alice", "lobby", 4);
        let mailbox = session.take_mailbox().unwrap();
        session.send(Arc::new(Message::broadcast("bob", "lobby", "hi").unwrap()));

        let writes = std::sync::atomic::AtomicUsize::new(0);
        let sink = Box::pin(futures_util::sink::unfold((), |(), _frame: Frame| {
            writes.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async { Err::<(), _>(TransportError::Closed) }
        }));

        let result = outbound_pump(&session, mailbox, sink, &PumpSettings::default()).await;

        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(writes.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(session.is_closed());
    }

    #[test]
    fn decode_blank_is_none() {
        let session = Session::new("alice", "lobby", 4);
        assert!(decode(&session, br#"{"text":"   "}"#, MAX_FRAME_BYTES)
            .unwrap()
            .is_none());
    }
}
