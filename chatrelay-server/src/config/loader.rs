//! Configuration loader

use std::path::Path;

use chatrelay_utils::{config_file, RelayError, Result};

use super::AppConfig;

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from `path`, or from the default location
    ///
    /// A missing default file yields the defaults; a missing explicit path
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<AppConfig> {
        match path {
            Some(path) if !path.exists() => Err(RelayError::ConfigNotFound(path.to_path_buf())),
            Some(path) => Self::load_from_path(path),
            None => {
                let path = config_file();
                if path.exists() {
                    Self::load_from_path(&path)
                } else {
                    Ok(AppConfig::default())
                }
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<AppConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| RelayError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        Self::parse(&content, path)
    }

    /// Parse configuration from string
    pub fn parse(content: &str, path: &Path) -> Result<AppConfig> {
        toml::from_str(content).map_err(|e| RelayError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Validate configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        let server = &config.server;

        server.listen_addr()?;

        if server.max_frame_bytes == 0 {
            return Err(RelayError::config("max_frame_bytes must be at least 1"));
        }

        // The length prefix is a u32
        if server.max_frame_bytes as u64 > u64::from(u32::MAX) {
            return Err(RelayError::config(format!(
                "max_frame_bytes must be at most {}",
                u32::MAX
            )));
        }

        if server.outbound_queue == 0 {
            return Err(RelayError::config("outbound_queue must be at least 1"));
        }

        if server.max_identity_len == 0 {
            return Err(RelayError::config("max_identity_len must be at least 1"));
        }

        if server.join_timeout_secs == 0 {
            return Err(RelayError::config("join_timeout_secs must be at least 1"));
        }

        Ok(())
    }
}
