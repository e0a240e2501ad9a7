//! Relay configuration

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::{AppConfig, LoggingConfig, ServerConfig};
