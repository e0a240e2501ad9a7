//! chatrelay-protocol: Wire definitions shared by the relay and its clients
//!
//! This crate defines the application messages exchanged over a relay
//! connection and the length-prefixed codec that frames them on a TCP stream.

pub mod codec;
pub mod messages;

// Re-export main types at crate root
pub use codec::{CodecError, FrameCodec, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use messages::{ApplicationMessage, Identity, Timestamp};
