//! Message lifecycle store
//!
//! Every accepted message has one row tracking its delivery status. Status
//! only moves along the edges in [`MessageStatus::can_transition_to`], and
//! every change is a single conditional update: the write names the statuses
//! it may start from, so two writers racing on one message cannot both win and
//! a late event can never move a message backwards.
//!
//! The provider message id is written once, at the `sent` transition. It is
//! the only key used to correlate asynchronous delivery events.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod status;

pub use memory::InMemoryMessageStore;
#[cfg(feature = "postgres")]
pub use postgres::PgMessageStore;
pub use status::{MessageStatus, UnknownStatus};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random message ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A tracked message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Message ID
    pub id: MessageId,
    /// Client that submitted the message
    pub client_id: String,
    /// Correlation id supplied at ingress
    pub trace_id: Option<String>,
    /// Template rendered for the body
    pub template_name: String,
    /// Recipient address
    pub recipient: String,
    /// Subject line
    pub subject: Option<String>,
    /// Current status
    pub status: MessageStatus,
    /// Label of the provider that accepted it
    pub provider: Option<String>,
    /// Provider's identifier for the message
    pub provider_msg_id: Option<String>,
    /// Highest delivery attempt recorded
    pub attempts: u32,
    /// Failure or bounce detail
    pub error_message: Option<String>,
    /// When a provider accepted it
    pub sent_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a message is accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Pre-generated message ID (shared with the job payload)
    pub id: MessageId,
    /// Submitting client
    pub client_id: String,
    /// Correlation id
    pub trace_id: Option<String>,
    /// Template name
    pub template_name: String,
    /// Recipient address
    pub recipient: String,
    /// Subject line
    pub subject: Option<String>,
}

/// A requested status change and the data it records
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A worker picked the message up for delivery attempt `attempt` (1-based)
    Processing {
        /// Attempt number reported by the job broker
        attempt: u32,
    },
    /// A provider accepted the message
    Sent {
        /// Provider label
        provider: String,
        /// Provider message id
        provider_message_id: String,
    },
    /// Delivery failed permanently
    Failed {
        /// Failure reason
        error: String,
    },
    /// Provider confirmed delivery
    Delivered,
    /// Provider reported a bounce
    Bounced {
        /// Bounce detail, when the provider gave one
        reason: Option<String>,
    },
}

impl Transition {
    /// Status entered by this transition
    #[must_use]
    pub const fn target(&self) -> MessageStatus {
        match self {
            Self::Processing { .. } => MessageStatus::Processing,
            Self::Sent { .. } => MessageStatus::Sent,
            Self::Failed { .. } => MessageStatus::Failed,
            Self::Delivered => MessageStatus::Delivered,
            Self::Bounced { .. } => MessageStatus::Bounced,
        }
    }
}

/// Asynchronous outcome reported by a provider after `sent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// Delivered to the recipient's mailbox
    Delivered,
    /// Rejected by the receiving side
    Bounced {
        /// Bounce detail
        reason: Option<String>,
    },
    /// Recipient reported the message as spam
    Complaint,
}

impl DeliveryOutcome {
    /// Transition recorded for this outcome
    #[must_use]
    pub fn into_transition(self) -> Transition {
        match self {
            Self::Delivered => Transition::Delivered,
            Self::Bounced { reason } => Transition::Bounced { reason },
            Self::Complaint => Transition::Failed {
                error: "recipient reported the message as spam".to_string(),
            },
        }
    }
}

/// Errors raised by a message store
#[derive(Debug, Error)]
pub enum StoreError {
    /// No message with this ID
    #[error("message not found: {0}")]
    NotFound(MessageId),

    /// A message with this ID was already created
    #[error("message already exists: {0}")]
    AlreadyExists(MessageId),

    /// The requested edge is not allowed from the current status
    #[error("message {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        /// Message ID
        id: MessageId,
        /// Current status
        from: MessageStatus,
        /// Requested status
        to: MessageStatus,
    },

    /// A stored row could not be decoded
    #[error("corrupt message row: {0}")]
    Corrupt(String),

    /// Database error
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Whether a later attempt may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        #[cfg(feature = "postgres")]
        if matches!(self, Self::Database(_)) {
            return true;
        }
        false
    }
}

/// Persistence for message rows
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert a `queued` message
    ///
    /// # Errors
    ///
    /// - `StoreError::AlreadyExists` if the ID is taken
    /// - `StoreError::Database` if the row cannot be written
    async fn create(&self, message: &NewMessage) -> Result<Message, StoreError>;

    /// Fetch a message by ID
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be read
    async fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Apply `transition` if the current status allows it
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` for an unknown ID
    /// - `StoreError::InvalidTransition` when the edge is not allowed
    async fn transition(&self, id: MessageId, transition: Transition) -> Result<Message, StoreError>;

    /// Apply a delivery event to the `sent` message with this provider id
    ///
    /// Returns `None` when no `sent` message carries the id: either it is
    /// unknown or the message has already settled.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the store cannot be updated
    async fn transition_by_provider_id(
        &self,
        provider_message_id: &str,
        outcome: DeliveryOutcome,
    ) -> Result<Option<Message>, StoreError>;
}
