//! Per-connection control loops, independent of the wire transport.
//!
//! The server adapts each WebSocket into a stream of [`ChannelMessage`]
//! results plus an outbound queue and hands both to one of these drivers.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::MediaEngineFactory;
use crate::error::{ProtocolError, SessionError, TransportError};
use crate::media::FrameTransform;
use crate::negotiation::{NegotiationSession, SessionConfig};
use crate::protocol::{ChannelMessage, SignalingMessage, CLOSE_GOING_AWAY, CLOSE_POLICY};
use crate::registry::{ConnectionHandle, ConnectionId, RoomDirectory};
use crate::relay::{MessageRelay, RelayConfig};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Why a control loop ended.
#[derive(Debug)]
pub enum Disconnect {
    /// The client sent a close frame.
    ClientClosed,
    /// The inbound stream ended without a close frame.
    StreamEnded,
    /// The relay dropped this connection after a failed delivery.
    Evicted,
    /// The server is shutting down.
    Shutdown,
    Transport(TransportError),
    Session(SessionError),
}

impl Disconnect {
    /// Ordinary hang-ups, as opposed to failures worth a warning.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            Disconnect::ClientClosed | Disconnect::StreamEnded | Disconnect::Shutdown
        )
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::ClientClosed => f.write_str("client closed the channel"),
            Disconnect::StreamEnded => f.write_str("channel ended"),
            Disconnect::Evicted => f.write_str("dropped by relay"),
            Disconnect::Shutdown => f.write_str("server shutting down"),
            Disconnect::Transport(err) => write!(f, "transport error: {err}"),
            Disconnect::Session(err) => write!(f, "session error: {err}"),
        }
    }
}

/// Entry point for pure-relay connections.
#[derive(Clone)]
pub struct RelayEndpoint {
    rooms: RoomDirectory,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl RelayEndpoint {
    pub fn new(rooms: RoomDirectory, config: RelayConfig) -> Self {
        Self {
            rooms,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling `token` ends every connection served by this endpoint.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    /// Register a connection in `room`. The receiver is the connection's
    /// outbound queue and must be drained by the transport writer.
    pub fn join(&self, room: &str) -> (RelayConnection, mpsc::Receiver<ChannelMessage>) {
        let (registry, registration) = self.rooms.join(room);
        info!(
            room,
            connection_id = %registration.handle.id(),
            active = registration.active_connections,
            "relay connection opened"
        );
        let connection = RelayConnection {
            room: room.to_string(),
            handle: registration.handle,
            relay: MessageRelay::new(registry, self.config.clone()),
            rooms: self.rooms.clone(),
            shutdown: self.shutdown.clone(),
        };
        (connection, registration.receiver)
    }
}

pub struct RelayConnection {
    room: String,
    handle: ConnectionHandle,
    relay: MessageRelay,
    rooms: RoomDirectory,
    shutdown: CancellationToken,
}

impl RelayConnection {
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    /// Relay every inbound message until the client leaves, the relay drops
    /// this connection or the server shuts down. Always unregisters before
    /// returning.
    pub async fn run<S>(self, mut inbound: S) -> Disconnect
    where
        S: Stream<Item = Result<ChannelMessage, TransportError>> + Unpin,
    {
        let id = self.handle.id();
        let reason = loop {
            tokio::select! {
                _ = self.handle.dropped() => break Disconnect::Evicted,
                _ = self.shutdown.cancelled() => break Disconnect::Shutdown,
                next = inbound.next() => match next {
                    Some(Ok(ChannelMessage::Close { .. })) => break Disconnect::ClientClosed,
                    Some(Ok(message)) => {
                        self.relay.relay(id, message).await;
                    }
                    Some(Err(err)) => break Disconnect::Transport(err),
                    None => break Disconnect::StreamEnded,
                },
            }
        };

        // Best effort; after an eviction the queue is usually what overflowed.
        let farewell = match reason {
            Disconnect::Evicted => Some(ChannelMessage::close(
                CLOSE_POLICY,
                "relay delivery failed",
            )),
            Disconnect::Shutdown => Some(ChannelMessage::close(
                CLOSE_GOING_AWAY,
                "server shutting down",
            )),
            _ => None,
        };
        if let Some(message) = farewell {
            let _ = self.handle.try_deliver(message);
        }

        let remaining = self.rooms.leave(&self.room, self.relay.registry(), id);
        if reason.is_expected() {
            info!(
                room = %self.room,
                connection_id = %id,
                remaining,
                reason = %reason,
                "relay connection closed"
            );
        } else {
            warn!(
                room = %self.room,
                connection_id = %id,
                remaining,
                reason = %reason,
                "relay connection closed"
            );
        }
        reason
    }
}

/// Entry point for media-terminating connections: one
/// [`NegotiationSession`] per connection.
#[derive(Clone)]
pub struct MediaEndpoint {
    inner: Arc<MediaInner>,
    shutdown: CancellationToken,
}

struct MediaInner {
    factory: Arc<dyn MediaEngineFactory>,
    transform: Arc<dyn FrameTransform>,
    config: SessionConfig,
    next_session_id: AtomicU64,
    active_sessions: AtomicUsize,
}

impl MediaEndpoint {
    pub fn new(
        factory: Arc<dyn MediaEngineFactory>,
        transform: Arc<dyn FrameTransform>,
        config: SessionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(MediaInner {
                factory,
                transform,
                config,
                next_session_id: AtomicU64::new(1),
                active_sessions: AtomicUsize::new(0),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling `token` ends every session served by this endpoint.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn active_sessions(&self) -> usize {
        self.inner.active_sessions.load(Ordering::SeqCst)
    }

    /// Drive one negotiation session over a control channel.
    ///
    /// Replies are queued on `outbound`. When the session fails the client
    /// gets an `error` message and a close frame; the engine is released on
    /// every exit path.
    pub async fn serve<S>(
        &self,
        mut inbound: S,
        outbound: mpsc::Sender<ChannelMessage>,
    ) -> Disconnect
    where
        S: Stream<Item = Result<ChannelMessage, TransportError>> + Unpin,
    {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
        let engine = match self.inner.factory.create().await {
            Ok(engine) => engine,
            Err(err) => {
                let err = SessionError::from(err);
                counter!("tidepool_session_errors_total", 1, "reason" => err.metric_label());
                warn!(session_id = id, error = %err, "could not create media engine");
                notify_failure(&outbound, &err).await;
                return Disconnect::Session(err);
            }
        };

        let mut session = NegotiationSession::new(
            id,
            engine,
            Arc::clone(&self.inner.transform),
            self.inner.config.clone(),
        );
        let _active = ActiveSession::enter(&self.inner.active_sessions);
        info!(session_id = id, "media session opened");

        let mut engine_events_open = true;
        let reason = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Disconnect::Shutdown,
                event = session.next_engine_event(), if engine_events_open => match event {
                    Some(event) => {
                        if let Err(err) = session.handle_engine_event(event).await {
                            break Disconnect::Session(err);
                        }
                    }
                    None => engine_events_open = false,
                },
                next = inbound.next() => match next {
                    Some(Ok(ChannelMessage::Text(text))) => match session.handle_text(&text).await {
                        Ok(Some(reply)) => {
                            debug!(session_id = id, kind = reply.kind(), "replying to client");
                            if outbound.send(ChannelMessage::from(&reply)).await.is_err() {
                                break Disconnect::Transport(TransportError::Closed);
                            }
                        }
                        Ok(None) => {}
                        Err(err) => break Disconnect::Session(err),
                    },
                    Some(Ok(ChannelMessage::Binary(_))) => {
                        let err = session.abort(ProtocolError::BinaryFrame.into()).await;
                        break Disconnect::Session(err);
                    }
                    Some(Ok(ChannelMessage::Close { .. })) => break Disconnect::ClientClosed,
                    Some(Err(err)) => break Disconnect::Transport(err),
                    None => break Disconnect::StreamEnded,
                },
            }
        };

        match &reason {
            Disconnect::Session(err) => notify_failure(&outbound, err).await,
            Disconnect::Shutdown => {
                let _ = outbound
                    .send_timeout(
                        ChannelMessage::close(CLOSE_GOING_AWAY, "server shutting down"),
                        NOTIFY_TIMEOUT,
                    )
                    .await;
            }
            _ => {}
        }
        session.close().await;

        if reason.is_expected() {
            info!(session_id = id, reason = %reason, "media session closed");
        } else {
            warn!(session_id = id, reason = %reason, "media session closed");
        }
        reason
    }
}

/// Keeps the active-session gauge right even if `serve` is cancelled.
struct ActiveSession<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ActiveSession<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let active = counter.fetch_add(1, Ordering::SeqCst) + 1;
        gauge!("tidepool_sessions_active", active as f64);
        Self { counter }
    }
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        let active = self.counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        gauge!("tidepool_sessions_active", active as f64);
    }
}

async fn notify_failure(outbound: &mpsc::Sender<ChannelMessage>, err: &SessionError) {
    let notice = SignalingMessage::Error {
        message: err.to_string(),
    };
    for message in [
        ChannelMessage::from(&notice),
        ChannelMessage::close(err.close_code(), err.metric_label()),
    ] {
        if outbound.send_timeout(message, NOTIFY_TIMEOUT).await.is_err() {
            debug!(error = %err, "client gone before failure notice was sent");
            return;
        }
    }
}
