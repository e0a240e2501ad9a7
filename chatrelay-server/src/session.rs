//! One connected, identified client
//!
//! A [`Session`] owns the outbound half of a connection. Messages are pushed
//! onto a bounded queue and a dedicated writer task drains it into the socket,
//! so concurrent routers never interleave partial frames and every recipient
//! sees its messages in enqueue order. The inbound half stays with the
//! connection task as an [`InboundFrames`] reader.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, warn};

use chatrelay_protocol::{ApplicationMessage, CodecError, FrameCodec, Identity};

/// Unique session identifier
///
/// Identities can be reused as soon as their owner leaves; the id tells two
/// sessions with the same identity apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session({})", self.0)
    }
}

/// Failure to hand a message to a session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("session for {0} is closed")]
    Closed(Identity),

    #[error("outbound queue for {0} is full")]
    QueueFull(Identity),
}

/// Item on a session's outbound queue
#[derive(Debug)]
enum Outbound {
    Frame(ApplicationMessage),
    /// Flush everything queued so far, then close the write half
    Finish,
}

/// A connected client that completed the join handshake
pub struct Session {
    id: SessionId,
    identity: Identity,
    remote_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    live: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("remote_addr", &self.remote_addr)
            .field("live", &self.is_live())
            .finish()
    }
}

impl Session {
    /// Create a session and spawn its writer task on `sink`
    pub fn spawn<W>(
        id: SessionId,
        identity: Identity,
        remote_addr: SocketAddr,
        sink: FramedWrite<W, FrameCodec>,
        queue_capacity: usize,
    ) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let session = Arc::new(Self::new(id, identity, remote_addr, tx));

        let handle = tokio::spawn(write_loop(
            sink,
            rx,
            session.cancel.clone(),
            session.identity.clone(),
        ));
        *session.writer.lock() = Some(handle);

        session
    }

    fn new(
        id: SessionId,
        identity: Identity,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            id,
            identity,
            remote_addr,
            outbound,
            cancel: CancellationToken::new(),
            live: AtomicBool::new(true),
            writer: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// True until the session is closed or its writer gives up
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    /// Queue a message for this session
    ///
    /// Never waits: a peer that lets its queue fill up is treated as a failed
    /// write so one slow reader cannot stall routing for everyone else.
    pub fn send(&self, message: ApplicationMessage) -> Result<(), SessionError> {
        if !self.is_live() {
            return Err(SessionError::Closed(self.identity.clone()));
        }

        match self.outbound.try_send(Outbound::Frame(message)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(SessionError::QueueFull(self.identity.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.live.store(false, Ordering::Release);
                Err(SessionError::Closed(self.identity.clone()))
            }
        }
    }

    /// Ask the writer to flush what is queued and close the write half
    ///
    /// Messages sent after this are dropped by the writer.
    pub fn finish(&self) -> Result<(), SessionError> {
        self.outbound
            .try_send(Outbound::Finish)
            .map_err(|_| SessionError::Closed(self.identity.clone()))
    }

    /// Wait for the writer task to exit
    ///
    /// Returns immediately if another caller already awaited it. Callers bound
    /// this with a timeout; dropping the future leaves the writer running
    /// until [`Session::close`].
    pub async fn flushed(&self) {
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Writer for {} ended abnormally: {}", self.identity, e);
            }
        }
    }

    /// Close the session: stop the writer and wake the connection task
    ///
    /// Idempotent. Pending queued messages are discarded.
    pub fn close(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            debug!("Closing session {} ({})", self.id, self.identity);
        }
        self.cancel.cancel();
    }

    /// Resolves once the session has been closed from any task
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Drain the outbound queue into the socket until closed
async fn write_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut rx: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
    identity: Identity,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => next,
        };

        match next {
            Some(Outbound::Frame(message)) => {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = sink.send(message) => result,
                };
                if let Err(e) = result {
                    warn!("Write to {} failed: {}", identity, e);
                    cancel.cancel();
                    break;
                }
            }
            Some(Outbound::Finish) => {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = sink.close() => {
                        if let Err(e) = result {
                            debug!("Closing write half for {} failed: {}", identity, e);
                        }
                    }
                }
                break;
            }
            None => break,
        }
    }

    debug!("Writer for {} stopped", identity);
}

/// Why a receive loop ended
#[derive(Debug)]
pub enum ReceiveEnd {
    /// Peer closed the connection on a frame boundary
    EndOfStream,
    /// Peer sent bytes that do not decode to a message
    Framing(CodecError),
    /// The socket itself failed
    Transport(CodecError),
}

impl std::fmt::Display for ReceiveEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EndOfStream => write!(f, "end of stream"),
            Self::Framing(e) => write!(f, "framing error: {}", e),
            Self::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// Inbound half of a connection: decodes one message per call
pub struct InboundFrames<R> {
    frames: FramedRead<R, FrameCodec>,
}

impl<R> InboundFrames<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            frames: FramedRead::new(reader, codec),
        }
    }

    /// Next decoded message, or why the stream is finished
    ///
    /// Cancel-safe: partially received frames stay buffered.
    pub async fn recv(&mut self) -> Result<ApplicationMessage, ReceiveEnd> {
        match self.frames.next().await {
            Some(Ok(message)) => Ok(message),
            Some(Err(e)) if e.is_framing() => Err(ReceiveEnd::Framing(e)),
            Some(Err(e)) => Err(ReceiveEnd::Transport(e)),
            None => Err(ReceiveEnd::EndOfStream),
        }
    }
}

#[cfg(test)]
impl Session {
    /// Session without a socket: the returned receiver sees what the writer
    /// task would have written
    pub(crate) fn detached(
        id: u64,
        identity: &str,
        capacity: usize,
    ) -> (Arc<Self>, TestReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let addr: SocketAddr = ([127, 0, 0, 1], 40_000 + (id % 20_000) as u16).into();
        let session = Arc::new(Self::new(
            SessionId::new(id),
            identity.to_string(),
            addr,
            tx,
        ));
        (session, TestReceiver { rx })
    }
}

/// Receiving end of a detached session's queue
#[cfg(test)]
pub(crate) struct TestReceiver {
    rx: mpsc::Receiver<Outbound>,
}

#[cfg(test)]
impl TestReceiver {
    /// Every message queued so far, in order
    pub(crate) fn drain(&mut self) -> Vec<ApplicationMessage> {
        let mut out = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            if let Outbound::Frame(message) = item {
                out.push(message);
            }
        }
        out
    }
}
