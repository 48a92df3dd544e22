//! Postgres message store
//!
//! Every transition is one `UPDATE ... WHERE status = ANY($allowed)` so the
//! database decides races. When no row matches, a follow-up `SELECT` tells an
//! unknown ID apart from an illegal edge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::info;
use uuid::Uuid;

use super::{
    DeliveryOutcome, Message, MessageId, MessageStatus, MessageStore, NewMessage, StoreError,
    Transition,
};

const MIGRATION: &str = include_str!("../../migrations/0001_messages.sql");

const COLUMNS: &str = "id, client_id, trace_id, template_name, recipient, subject, status, \
     provider, provider_msg_id, attempts, error_message, sent_at, created_at, updated_at";

#[derive(Debug, FromRow)]
struct MessageRow {
    id: Uuid,
    client_id: String,
    trace_id: Option<String>,
    template_name: String,
    recipient: String,
    subject: Option<String>,
    status: String,
    provider: Option<String>,
    provider_msg_id: Option<String>,
    attempts: i32,
    error_message: Option<String>,
    sent_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<MessageStatus>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| StoreError::Corrupt(format!("negative attempts: {}", row.attempts)))?;

        Ok(Self {
            id: row.id.into(),
            client_id: row.client_id,
            trace_id: row.trace_id,
            template_name: row.template_name,
            recipient: row.recipient,
            subject: row.subject,
            status,
            provider: row.provider,
            provider_msg_id: row.provider_msg_id,
            attempts,
            error_message: row.error_message,
            sent_at: row.sent_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Column values written by one transition
#[derive(Debug, Default)]
struct Changes {
    attempt: i32,
    provider: Option<String>,
    provider_msg_id: Option<String>,
    set_error: bool,
    error_message: Option<String>,
}

impl From<Transition> for Changes {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Processing { attempt } => Self {
                attempt: i32::try_from(attempt).unwrap_or(i32::MAX),
                ..Self::default()
            },
            Transition::Sent {
                provider,
                provider_message_id,
            } => Self {
                provider: Some(provider),
                provider_msg_id: Some(provider_message_id),
                ..Self::default()
            },
            Transition::Failed { error } => Self {
                set_error: true,
                error_message: Some(error),
                ..Self::default()
            },
            Transition::Bounced { reason } => Self {
                set_error: true,
                error_message: reason,
                ..Self::default()
            },
            Transition::Delivered => Self::default(),
        }
    }
}

fn status_names(statuses: &[MessageStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// [`MessageStore`] backed by Postgres
#[derive(Debug, Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    /// Wrap an existing pool
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `messages` table and its indexes if missing
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Database` if the migration fails
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION).execute(&self.pool).await?;
        info!("Message store migrated");
        Ok(())
    }

    async fn update(
        &self,
        filter: &str,
        key: Bind<'_>,
        transition: Transition,
    ) -> Result<Option<Message>, StoreError> {
        let target = transition.target();
        let allowed = status_names(MessageStatus::allowed_predecessors(target));
        let changes = Changes::from(transition);

        let sql = format!(
            r"
            UPDATE messages
            SET status = $2,
                attempts = GREATEST(attempts, $3),
                provider = COALESCE($4, provider),
                provider_msg_id = COALESCE($5, provider_msg_id),
                error_message = CASE WHEN $6 THEN $7 ELSE error_message END,
                sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END,
                updated_at = NOW()
            WHERE {filter} AND status = ANY($8)
            RETURNING {COLUMNS}
            "
        );

        let query = sqlx::query_as::<_, MessageRow>(&sql);
        let query = match key {
            Bind::Id(id) => query.bind(id),
            Bind::ProviderId(provider_id) => query.bind(provider_id),
        };

        let row = query
            .bind(target.as_str())
            .bind(changes.attempt)
            .bind(changes.provider)
            .bind(changes.provider_msg_id)
            .bind(changes.set_error)
            .bind(changes.error_message)
            .bind(allowed)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Message::try_from).transpose()
    }
}

enum Bind<'a> {
    Id(Uuid),
    ProviderId(&'a str),
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn create(&self, message: &NewMessage) -> Result<Message, StoreError> {
        let sql = format!(
            r"
            INSERT INTO messages (id, client_id, trace_id, template_name, recipient, subject)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            RETURNING {COLUMNS}
            "
        );

        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(*message.id.as_uuid())
            .bind(&message.client_id)
            .bind(&message.trace_id)
            .bind(&message.template_name)
            .bind(&message.recipient)
            .bind(&message.subject)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(StoreError::AlreadyExists(message.id))?.try_into()
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM messages WHERE id = $1");
        sqlx::query_as::<_, MessageRow>(&sql)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .map(Message::try_from)
            .transpose()
    }

    async fn transition(&self, id: MessageId, transition: Transition) -> Result<Message, StoreError> {
        let to = transition.target();
        if let Some(message) = self.update("id = $1", Bind::Id(*id.as_uuid()), transition).await? {
            return Ok(message);
        }

        match self.get(id).await? {
            Some(current) => Err(StoreError::InvalidTransition {
                id,
                from: current.status,
                to,
            }),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn transition_by_provider_id(
        &self,
        provider_message_id: &str,
        outcome: DeliveryOutcome,
    ) -> Result<Option<Message>, StoreError> {
        // Events only settle messages a provider has accepted.
        self.update(
            "provider_msg_id = $1 AND status = 'sent'",
            Bind::ProviderId(provider_message_id),
            outcome.into_transition(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    async fn store() -> PgMessageStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.unwrap();
        let store = PgMessageStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    fn new_message() -> NewMessage {
        NewMessage {
            id: MessageId::new(),
            client_id: "client-pg".to_string(),
            trace_id: None,
            template_name: "welcome".to_string(),
            recipient: "user@example.com".to_string(),
            subject: None,
        }
    }

    #[test]
    fn test_changes_for_bounce_clear_error_flag() {
        let changes = Changes::from(Transition::Bounced { reason: None });
        assert!(changes.set_error);
        assert!(changes.error_message.is_none());

        let changes = Changes::from(Transition::Delivered);
        assert!(!changes.set_error);
        assert_eq!(changes.attempt, 0);
    }

    #[tokio::test]
    #[ignore = "requires Postgres at DATABASE_URL"]
    async fn test_pg_lifecycle() {
        let store = store().await;
        let id = store.create(&new_message()).await.unwrap().id;

        store.transition(id, Transition::Processing { attempt: 1 }).await.unwrap();
        let provider_id = format!("pg-{}", Uuid::new_v4());
        let sent = store
            .transition(
                id,
                Transition::Sent {
                    provider: "smtp".to_string(),
                    provider_message_id: provider_id.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert!(sent.sent_at.is_some());

        let delivered = store
            .transition_by_provider_id(&provider_id, DeliveryOutcome::Delivered)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);
        assert!(store
            .transition_by_provider_id(&provider_id, DeliveryOutcome::Delivered)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    #[ignore = "requires Postgres at DATABASE_URL"]
    async fn test_pg_illegal_and_missing() {
        let store = store().await;
        let id = store.create(&new_message()).await.unwrap().id;

        assert!(matches!(
            store.transition(id, Transition::Delivered).await,
            Err(StoreError::InvalidTransition { from: MessageStatus::Queued, .. })
        ));
        assert!(matches!(
            store.transition(MessageId::new(), Transition::Delivered).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
