//! Message delivery status and its legal transitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Delivery status of a message
///
/// ```text
/// queued ──> processing ──> sent ──> delivered
///               │  ↺          ├────> bounced
///               │             └────> failed
///               └──────────────────> failed
/// ```
///
/// `processing → processing` records a redelivered attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepted and waiting for a worker
    Queued,
    /// A worker is rendering or sending it
    Processing,
    /// Accepted by a provider
    Sent,
    /// Provider confirmed delivery
    Delivered,
    /// Provider reported a bounce
    Bounced,
    /// Permanently failed
    Failed,
}

impl MessageStatus {
    /// Every status, in lifecycle order
    pub const ALL: [Self; 6] = [
        Self::Queued,
        Self::Processing,
        Self::Sent,
        Self::Delivered,
        Self::Bounced,
        Self::Failed,
    ];

    /// Check whether `self → next` is a legal edge
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Queued | Self::Processing, Self::Processing)
                | (Self::Processing, Self::Sent | Self::Failed)
                | (Self::Sent, Self::Delivered | Self::Bounced | Self::Failed)
        )
    }

    /// Statuses from which `next` may be entered
    #[must_use]
    pub const fn allowed_predecessors(next: Self) -> &'static [Self] {
        match next {
            Self::Queued => &[],
            Self::Processing => &[Self::Queued, Self::Processing],
            Self::Sent => &[Self::Processing],
            Self::Delivered | Self::Bounced => &[Self::Sent],
            Self::Failed => &[Self::Processing, Self::Sent],
        }
    }

    /// Whether no further transitions are possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Bounced | Self::Failed)
    }

    /// Whether a provider has accepted the message
    #[must_use]
    pub const fn is_dispatched(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Bounced)
    }

    /// Lowercase name, as stored in the database
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Bounced => "bounced",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a status name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for MessageStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
