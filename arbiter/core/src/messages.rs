//! Arbiter Messages
//!
//! Events sent from the arbiter to operator surfaces. Surfaces are pure
//! renderers: they show the roster, whose turn it is, and the audit feed,
//! and they report errors for their own requests. Internal connection ids
//! never leave the process; holders are described by display name only.
//!
//! On the wire every event is a JSON object tagged by its `event` field:
//!
//! ```json
//! {"event":"turn-update","current":{"name":"Alice","ammoRemaining":1},"next":null}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public view of a holder
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderView {
    /// Display name of the holder
    pub name: String,
    /// Shots left in the turn
    #[serde(rename = "ammoRemaining")]
    pub ammo_remaining: u32,
}

/// Current and next holder as shown to surfaces
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSnapshot {
    /// Holder allowed to command the bot right now
    pub current: Option<HolderView>,
    /// Holder promoted on the next rotation
    pub next: Option<HolderView>,
}

/// Category of an audit/feed message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// An operator triggered an action
    Action,
    /// The turn changed hands
    Turn,
    /// Hardware came up or went away
    Hardware,
    /// Anything else
    System,
}

/// Messages from the arbiter to surfaces
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum OutboundEvent {
    /// Registered display names in queue order
    RosterUpdate {
        /// Names, turn-queue order
        names: Vec<String>,
    },

    /// Holder state after a promotion
    TurnUpdate(TurnSnapshot),

    /// Feed entry for spectators
    Message {
        /// Message category
        kind: MessageKind,
        /// Human-readable text
        text: String,
        /// When the arbiter produced it
        timestamp: DateTime<Utc>,
    },

    /// Registration refused (session-scoped)
    RegistrationError {
        /// Why it was refused
        reason: String,
    },

    /// Action refused because it is not the sender's turn (session-scoped)
    QueueError {
        /// Error text
        message: String,
    },

    /// Action refused or failed for another reason (session-scoped)
    ActionError {
        /// Error text
        message: String,
    },

    /// Hardware link state
    HardwareStatus {
        /// Whether the bot is reachable
        connected: bool,
    },
}

impl OutboundEvent {
    /// Build a feed message stamped with the current time
    pub fn message(kind: MessageKind, text: impl Into<String>) -> Self {
        Self::Message {
            kind,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Wire name of the event
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RosterUpdate { .. } => "roster-update",
            Self::TurnUpdate(_) => "turn-update",
            Self::Message { .. } => "message",
            Self::RegistrationError { .. } => "registration-error",
            Self::QueueError { .. } => "queue-error",
            Self::ActionError { .. } => "action-error",
            Self::HardwareStatus { .. } => "hardware-status",
        }
    }
}
