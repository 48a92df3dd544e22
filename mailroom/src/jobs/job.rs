//! Job identifiers and the email job payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

use crate::lifecycle::MessageId;

/// Subject used when a request does not supply one.
pub const DEFAULT_SUBJECT: &str = "No Subject";

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a new random job ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Payload of one email delivery job.
///
/// Immutable once enqueued. The same payload may be delivered to a worker
/// more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    /// Recipient address.
    pub to: String,
    /// Template name.
    pub template: String,
    /// Template variables.
    #[serde(default)]
    pub props: Map<String, Value>,
    /// Subject line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Lifecycle record this job delivers.
    pub message_id: MessageId,
    /// Submitting client.
    pub client_id: String,
    /// Correlation id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl EmailJob {
    /// Subject to send, falling back to [`DEFAULT_SUBJECT`].
    #[must_use]
    pub fn subject_or_default(&self) -> &str {
        self.subject.as_deref().unwrap_or(DEFAULT_SUBJECT)
    }

    /// Template variables as a JSON object.
    #[must_use]
    pub fn props_value(&self) -> Value {
        Value::Object(self.props.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_wire_shape() {
        let raw = json!({
            "to": "user@example.com",
            "template": "welcome",
            "props": {"name": "Ada"},
            "message_id": "6f1c1c55-3cf2-4a8e-9d8f-3b7e1f6b2a10",
            "client_id": "client-1"
        });

        let job: EmailJob = serde_json::from_value(raw).unwrap();
        assert_eq!(job.subject_or_default(), DEFAULT_SUBJECT);
        assert_eq!(job.props_value(), json!({"name": "Ada"}));
        assert!(job.trace_id.is_none());

        let encoded = serde_json::to_value(&job).unwrap();
        assert!(encoded.get("subject").is_none());
    }
}
