//! TCP listener and accept loop

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use chatrelay_utils::{RelayError, Result};

use crate::config::ServerConfig;
use crate::lifecycle::handle_connection;
use crate::state::SharedState;

/// Bind the relay listener
///
/// Failing to bind is the one error that stops the process.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener> {
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::bind(addr, e))?;

    let local = listener.local_addr().unwrap_or(addr);
    info!("Relay listening on {}", local);
    Ok(listener)
}

/// Run the accept loop until shutdown begins
///
/// Every accepted connection gets its own task. Transient accept errors are
/// logged and skipped; anything else ends the loop with an error.
pub async fn run_accept_loop(listener: TcpListener, state: SharedState) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            _ = state.shutdown_signal() => {
                info!("Shutdown signal received, stopping accept loop");
                return Ok(());
            }

            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("New connection from {}", peer);
                        state.metrics.record_connection();

                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
                        }

                        let state = state.clone();
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            handle_connection(reader, writer, peer, state).await;
                        });
                    }
                    Err(e) => {
                        let e = RelayError::Accept(e);
                        if e.is_transient() {
                            warn!("{}", e);
                        } else {
                            error!("{}", e);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }
}
