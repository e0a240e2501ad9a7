//! Configuration schema structs

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chatrelay_protocol::DEFAULT_MAX_FRAME_SIZE;
use chatrelay_utils::{LogOutput, RelayError, Result};
use serde::{Deserialize, Serialize};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Listener and per-connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on (default: 0.0.0.0)
    pub bind_address: String,
    /// TCP port; 0 picks an ephemeral port (default: 5555)
    pub port: u16,
    /// Largest accepted frame payload in bytes (default: 1 MiB)
    pub max_frame_bytes: usize,
    /// Messages buffered per session before it counts as stalled (default: 256)
    pub outbound_queue: usize,
    /// Seconds a new connection may take to send its join (default: 30)
    pub join_timeout_secs: u64,
    /// Milliseconds to let writers flush on shutdown (default: 2000)
    pub shutdown_grace_ms: u64,
    /// Longest accepted identity, in characters (default: 64)
    pub max_identity_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: 5555,
            max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
            outbound_queue: 256,
            join_timeout_secs: 30,
            shutdown_grace_ms: 2000,
            max_identity_len: 64,
        }
    }
}

impl ServerConfig {
    /// Socket address the listener binds to
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .bind_address
            .trim()
            .parse()
            .map_err(|e: std::net::AddrParseError| RelayError::InvalidAddress {
                addr: self.bind_address.clone(),
                message: e.to_string(),
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Process log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `CHATRELAY_LOG` overrides it
    pub filter: String,
    pub output: LogOutput,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            output: LogOutput::Stderr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.port, 5555);
        assert_eq!(config.server.max_frame_bytes, 1024 * 1024);
        assert_eq!(config.server.outbound_queue, 256);
        assert_eq!(config.server.join_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.shutdown_grace(), Duration::from_millis(2000));
        assert_eq!(config.logging.output, LogOutput::Stderr);
    }

    #[test]
    fn test_listen_addr() {
        let config = ServerConfig {
            bind_address: "127.0.0.1".into(),
            port: 7000,
            ..Default::default()
        };
        assert_eq!(
            config.listen_addr().unwrap(),
            "127.0.0.1:7000".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_listen_addr_ipv6() {
        let config = ServerConfig {
            bind_address: "::1".into(),
            port: 0,
            ..Default::default()
        };
        assert!(config.listen_addr().unwrap().is_ipv6());
    }

    #[test]
    fn test_listen_addr_invalid() {
        let config = ServerConfig {
            bind_address: "not-an-ip".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.listen_addr(),
            Err(RelayError::InvalidAddress { .. })
        ));
    }
}
