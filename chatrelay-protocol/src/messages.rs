//! Application messages carried inside relay frames

use serde::{Deserialize, Serialize};

/// Display name a client claims at join time
pub type Identity = String;

/// Wall-clock time in Unix seconds
pub type Timestamp = i64;

/// One logical message exchanged between a client and the relay
///
/// Serialized as an internally tagged JSON object, e.g.
/// `{"type":"chat","text":"hi","sender_identity":"alice","timestamp":1700000000}`.
/// `sender_identity` and `timestamp` are assigned by the relay; values sent by
/// a client are overwritten before fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplicationMessage {
    /// Handshake: claim an identity. Must be the first frame on a connection.
    Join { identity: Identity },

    /// Broadcast text to every connected session
    Chat {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_identity: Option<Identity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },

    /// Text addressed to a single identity
    Direct {
        text: String,
        target_identity: Identity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_identity: Option<Identity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },

    /// Relay-generated notice (joins, departures, errors, shutdown)
    SystemNotice {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },

    /// Full list of identities currently online
    Roster {
        identities: Vec<Identity>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
}

impl ApplicationMessage {
    /// Build a join request
    pub fn join(identity: impl Into<Identity>) -> Self {
        Self::Join {
            identity: identity.into(),
        }
    }

    /// Build an unstamped chat message, as a client would send it
    pub fn chat(text: impl Into<String>) -> Self {
        Self::Chat {
            text: text.into(),
            sender_identity: None,
            timestamp: None,
        }
    }

    /// Build an unstamped direct message, as a client would send it
    pub fn direct(target: impl Into<Identity>, text: impl Into<String>) -> Self {
        Self::Direct {
            text: text.into(),
            target_identity: target.into(),
            sender_identity: None,
            timestamp: None,
        }
    }

    /// Build a system notice stamped with `timestamp`
    pub fn system_notice(text: impl Into<String>, timestamp: Timestamp) -> Self {
        Self::SystemNotice {
            text: text.into(),
            timestamp: Some(timestamp),
        }
    }

    /// Build a roster stamped with `timestamp`
    pub fn roster(identities: Vec<Identity>, timestamp: Timestamp) -> Self {
        Self::Roster {
            identities,
            timestamp: Some(timestamp),
        }
    }

    /// Replace origin fields with relay-assigned values.
    ///
    /// Chat and Direct get both sender and timestamp; notices and rosters only
    /// the timestamp. Join is returned unchanged.
    pub fn stamped(self, sender: &str, now: Timestamp) -> Self {
        match self {
            Self::Chat { text, .. } => Self::Chat {
                text,
                sender_identity: Some(sender.to_string()),
                timestamp: Some(now),
            },
            Self::Direct {
                text,
                target_identity,
                ..
            } => Self::Direct {
                text,
                target_identity,
                sender_identity: Some(sender.to_string()),
                timestamp: Some(now),
            },
            Self::SystemNotice { text, .. } => Self::SystemNotice {
                text,
                timestamp: Some(now),
            },
            Self::Roster { identities, .. } => Self::Roster {
                identities,
                timestamp: Some(now),
            },
            join @ Self::Join { .. } => join,
        }
    }

    /// Short name of the variant, matching the JSON `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Chat { .. } => "chat",
            Self::Direct { .. } => "direct",
            Self::SystemNotice { .. } => "system_notice",
            Self::Roster { .. } => "roster",
        }
    }

    /// Relay-assigned sender, if any
    pub fn sender_identity(&self) -> Option<&str> {
        match self {
            Self::Chat {
                sender_identity, ..
            }
            | Self::Direct {
                sender_identity, ..
            } => sender_identity.as_deref(),
            _ => None,
        }
    }

    /// Relay-assigned timestamp, if any
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::Chat { timestamp, .. }
            | Self::Direct { timestamp, .. }
            | Self::SystemNotice { timestamp, .. }
            | Self::Roster { timestamp, .. } => *timestamp,
            Self::Join { .. } => None,
        }
    }
}
