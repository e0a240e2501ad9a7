//! Per-connection lifecycle
//!
//! Each accepted connection runs [`handle_connection`] on its own task:
//!
//! ```text
//! Connecting -> AwaitingJoin -> Active -> Closed
//!                    |                      ^
//!                    +----------------------+  (handshake violation)
//! ```
//!
//! Nothing is registered until the first frame is a valid `Join`, and
//! every path out of `Active` unregisters the session and announces the
//! departure, except during relay shutdown where a single shutdown notice
//! replaces the per-session announcements.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use chatrelay_protocol::{ApplicationMessage, CodecError, Identity};

use crate::registry::RegistryError;
use crate::router::Delivery;
use crate::session::{InboundFrames, ReceiveEnd, Session};
use crate::state::SharedState;

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, codec not yet attached
    Connecting,
    /// Waiting for the first frame
    AwaitingJoin,
    /// Registered and routing
    Active,
    /// Terminal
    Closed,
}

/// Why a connection never became [`ConnectionState::Active`]
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("expected join, got {0}")]
    UnexpectedMessage(&'static str),

    #[error("identity is empty")]
    EmptyIdentity,

    #[error("identity is {len} characters, limit is {max}")]
    IdentityTooLong { len: usize, max: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("connection ended before join: {0}")]
    Ended(ReceiveEnd),

    #[error("no join within {0:?}")]
    Timeout(Duration),

    #[error("relay is shutting down")]
    ShuttingDown,
}

/// How a connection ended
#[derive(Debug)]
pub enum CloseReason {
    Handshake(HandshakeError),
    /// Peer closed on a frame boundary
    EndOfStream,
    Framing(CodecError),
    Transport(CodecError),
    /// The session was closed from elsewhere after a failed delivery
    SendFailed,
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake(e) => write!(f, "handshake failed: {}", e),
            Self::EndOfStream => write!(f, "disconnected"),
            Self::Framing(e) => write!(f, "framing error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
            Self::SendFailed => write!(f, "send failed"),
            Self::Shutdown => write!(f, "relay shutdown"),
        }
    }
}

/// Trim `raw` and check it against the identity rules
pub fn validate_identity(raw: &str, max_len: usize) -> Result<Identity, HandshakeError> {
    let identity = raw.trim();

    if identity.is_empty() {
        return Err(HandshakeError::EmptyIdentity);
    }

    let len = identity.chars().count();
    if len > max_len {
        return Err(HandshakeError::IdentityTooLong { len, max: max_len });
    }

    Ok(identity.to_string())
}

/// Drive one connection from accept to close
pub async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    state: SharedState,
) -> CloseReason
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut conn_state = ConnectionState::Connecting;

    let codec = state.codec();
    let mut inbound = InboundFrames::new(reader, codec.clone());
    let sink = FramedWrite::new(writer, codec);
    transition(&mut conn_state, ConnectionState::AwaitingJoin, peer);

    let identity = match await_join(&mut inbound, &state).await {
        Ok(identity) => identity,
        Err(e) => return reject(&state, &mut conn_state, peer, e),
    };

    let session = Session::spawn(
        state.registry.next_session_id(),
        identity,
        peer,
        sink,
        state.config.outbound_queue,
    );

    match state.router.join(&session) {
        Ok(delivery) => {
            state.metrics.record_join();
            close_failed(&delivery);
        }
        Err(e) => {
            session.close();
            return reject(&state, &mut conn_state, peer, e.into());
        }
    }
    transition(&mut conn_state, ConnectionState::Active, peer);

    let reason = receive_loop(&session, &mut inbound, &state).await;

    teardown(&session, &state);
    transition(&mut conn_state, ConnectionState::Closed, peer);

    info!("{} ({}) closed: {}", session.identity(), peer, reason);
    reason
}

/// Wait for the join frame, bounded by the join timeout and shutdown
async fn await_join<R>(
    inbound: &mut InboundFrames<R>,
    state: &SharedState,
) -> Result<Identity, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let limit = state.config.join_timeout();

    let first = tokio::select! {
        _ = state.shutdown_signal() => return Err(HandshakeError::ShuttingDown),
        result = tokio::time::timeout(limit, inbound.recv()) => {
            result.map_err(|_| HandshakeError::Timeout(limit))?
        }
    };

    match first.map_err(HandshakeError::Ended)? {
        ApplicationMessage::Join { identity } => {
            validate_identity(&identity, state.config.max_identity_len)
        }
        other => Err(HandshakeError::UnexpectedMessage(other.kind())),
    }
}

/// Route inbound messages until the connection ends
async fn receive_loop<R>(
    session: &Arc<Session>,
    inbound: &mut InboundFrames<R>,
    state: &SharedState,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = session.closed() => {
                return if state.is_shutting_down() {
                    CloseReason::Shutdown
                } else {
                    CloseReason::SendFailed
                };
            }

            received = inbound.recv() => match received {
                Ok(message) => {
                    debug!("{} sent {}", session.identity(), message.kind());
                    let delivery = state.router.route(session, message);
                    close_failed(&delivery);
                }
                Err(ReceiveEnd::EndOfStream) => return CloseReason::EndOfStream,
                Err(ReceiveEnd::Framing(e)) => {
                    warn!("Dropping {}: {}", session.identity(), e);
                    return CloseReason::Framing(e);
                }
                Err(ReceiveEnd::Transport(e)) => return CloseReason::Transport(e),
            },
        }
    }
}

fn reject(
    state: &SharedState,
    conn_state: &mut ConnectionState,
    peer: SocketAddr,
    error: HandshakeError,
) -> CloseReason {
    state.metrics.record_handshake_rejected();
    info!("Rejected connection from {}: {}", peer, error);
    transition(conn_state, ConnectionState::Closed, peer);
    CloseReason::Handshake(error)
}

/// Unregister and announce the departure, then close the session
///
/// A session must leave the registry before it stops accepting messages.
fn teardown(session: &Session, state: &SharedState) {
    // Returns None once shutdown has drained the registry
    if let Some(delivery) = state.router.depart(session) {
        state.metrics.record_departure();
        close_failed(&delivery);
    }
    session.close();
}

/// Close every session a delivery could not reach
///
/// Their own connection tasks notice and run the departure.
fn close_failed(delivery: &Delivery) {
    for session in &delivery.failed {
        session.close();
    }
}

fn transition(current: &mut ConnectionState, next: ConnectionState, peer: SocketAddr) {
    debug!("{}: {:?} -> {:?}", peer, current, next);
    *current = next;
}
