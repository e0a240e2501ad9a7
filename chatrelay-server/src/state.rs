//! Relay-wide shared state

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};

use chatrelay_protocol::FrameCodec;

use crate::config::ServerConfig;
use crate::observability::Metrics;
use crate::registry::SessionRegistry;
use crate::router::Router;

/// Notice every session receives before the relay closes it
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down";

/// Handles shared by the accept loop, every connection task and the console
#[derive(Clone)]
pub struct SharedState {
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<Router>,
    pub config: Arc<ServerConfig>,
    pub metrics: Arc<Metrics>,
    /// Cancelled when shutdown begins
    shutdown: CancellationToken,
    /// Cancelled once every session has been closed
    stopped: CancellationToken,
    shutdown_started: Arc<AtomicBool>,
}

impl SharedState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let metrics = Arc::new(Metrics::new());
        let router = Arc::new(Router::new(Arc::clone(&registry), Arc::clone(&metrics)));

        Self {
            registry,
            router,
            config: Arc::new(config),
            metrics,
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            shutdown_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Codec configured with this relay's frame limit
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::with_max_frame_size(self.config.max_frame_bytes)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves when shutdown begins
    pub fn shutdown_signal(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Resolves when shutdown has closed every session
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.stopped.cancelled()
    }

    /// Gracefully stop the relay
    ///
    /// Stops accepting, sends [`SHUTDOWN_NOTICE`] to every joined session,
    /// gives writers `shutdown_grace` to flush, then closes whatever is left.
    /// Concurrent callers all return once the first one has finished.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::AcqRel) {
            self.stopped.cancelled().await;
            return;
        }

        info!("Relay shutting down");
        self.shutdown.cancel();

        let sessions = self.router.close_all(SHUTDOWN_NOTICE);
        let grace = self.config.shutdown_grace();

        let flushes = join_all(sessions.iter().map(|session| session.flushed()));
        if tokio::time::timeout(grace, flushes).await.is_err() {
            warn!("Writers did not flush within {:?}; closing anyway", grace);
        }

        for session in &sessions {
            session.close();
        }

        info!("Closed {} sessions", sessions.len());
        self.stopped.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use chatrelay_protocol::ApplicationMessage;
    use std::time::Duration;

    #[test]
    fn test_codec_uses_configured_limit() {
        let state = SharedState::new(ServerConfig {
            max_frame_bytes: 512,
            ..Default::default()
        });
        assert_eq!(state.codec().max_frame_size(), 512);
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_closes() {
        let state = SharedState::new(ServerConfig::default());
        let (alice, mut alice_rx) = Session::detached(1, "alice", 16);
        state.router.join(&alice).unwrap();
        alice_rx.drain();

        state.shutdown().await;

        assert!(state.is_shutting_down());
        assert!(state.registry.is_closed());
        assert!(!alice.is_live());

        let messages = alice_rx.drain();
        assert_eq!(messages.len(), 1);
        assert!(matches!(
            &messages[0],
            ApplicationMessage::SystemNotice { text, timestamp: Some(_) } if text == SHUTDOWN_NOTICE
        ));
    }

    #[tokio::test]
    async fn test_shutdown_twice_returns() {
        let state = SharedState::new(ServerConfig::default());

        state.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), state.shutdown())
            .await
            .expect("second shutdown hung");
        tokio::time::timeout(Duration::from_secs(1), state.stopped())
            .await
            .expect("stopped never fired");
    }

    #[tokio::test]
    async fn test_shutdown_grace_bounds_stalled_writer() {
        let state = SharedState::new(ServerConfig {
            shutdown_grace_ms: 50,
            ..Default::default()
        });

        // Writer whose peer never reads: the duplex buffer fills and the
        // final flush cannot complete
        let (server_side, _client_side) = tokio::io::duplex(16);
        let stalled = Session::spawn(
            state.registry.next_session_id(),
            "stalled".into(),
            ([127, 0, 0, 1], 9).into(),
            tokio_util::codec::FramedWrite::new(server_side, state.codec()),
            16,
        );
        state.router.join(&stalled).unwrap();

        tokio::time::timeout(Duration::from_secs(2), state.shutdown())
            .await
            .expect("shutdown ignored the grace period");
        assert!(!stalled.is_live());
    }
}
