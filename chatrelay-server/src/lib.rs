//! chatrelay-server: TCP chat relay
//!
//! Accepts client connections, tracks who is online in a
//! [`SessionRegistry`] and fans messages out through the [`Router`]:
//! chat to everyone, direct messages to one recipient, and system notices
//! plus roster updates whenever someone joins or leaves.

pub mod config;
pub mod console;
pub mod lifecycle;
pub mod observability;
pub mod registry;
pub mod router;
pub mod session;
pub mod state;
pub mod tcp;

pub use config::{AppConfig, ConfigLoader, ServerConfig};
pub use lifecycle::{handle_connection, CloseReason, ConnectionState, HandshakeError};
pub use registry::{RegistryError, SessionRegistry};
pub use router::{Delivery, RouteError, Router};
pub use session::{Session, SessionError, SessionId};
pub use state::SharedState;

#[cfg(test)]
mod tests;
