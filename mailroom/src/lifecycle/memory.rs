//! In-memory message store
//!
//! Each check-and-apply happens under one write guard, which gives the same
//! atomicity as the conditional `UPDATE` of the Postgres store.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;

use super::{
    DeliveryOutcome, Message, MessageId, MessageStatus, MessageStore, NewMessage, StoreError,
    Transition,
};

/// Message store held in process memory
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    messages: RwLock<HashMap<MessageId, Message>>,
}

impl InMemoryMessageStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }
}

fn apply(message: &mut Message, transition: Transition) {
    let now = Utc::now();
    message.status = transition.target();
    message.updated_at = now;

    match transition {
        Transition::Processing { attempt } => {
            message.attempts = message.attempts.max(attempt);
        }
        Transition::Sent {
            provider,
            provider_message_id,
        } => {
            message.provider = Some(provider);
            message.provider_msg_id = Some(provider_message_id);
            message.sent_at = Some(now);
        }
        Transition::Failed { error } => message.error_message = Some(error),
        Transition::Bounced { reason } => message.error_message = reason,
        Transition::Delivered => {}
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create(&self, message: &NewMessage) -> Result<Message, StoreError> {
        let mut messages = self.messages.write();
        if messages.contains_key(&message.id) {
            return Err(StoreError::AlreadyExists(message.id));
        }

        let now = Utc::now();
        let stored = Message {
            id: message.id,
            client_id: message.client_id.clone(),
            trace_id: message.trace_id.clone(),
            template_name: message.template_name.clone(),
            recipient: message.recipient.clone(),
            subject: message.subject.clone(),
            status: MessageStatus::Queued,
            provider: None,
            provider_msg_id: None,
            attempts: 0,
            error_message: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        };
        messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.read().get(&id).cloned())
    }

    async fn transition(&self, id: MessageId, transition: Transition) -> Result<Message, StoreError> {
        let mut messages = self.messages.write();
        let message = messages.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        let to = transition.target();
        if !message.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                id,
                from: message.status,
                to,
            });
        }

        apply(message, transition);
        Ok(message.clone())
    }

    async fn transition_by_provider_id(
        &self,
        provider_message_id: &str,
        outcome: DeliveryOutcome,
    ) -> Result<Option<Message>, StoreError> {
        let mut messages = self.messages.write();
        let Some(message) = messages.values_mut().find(|m| {
            m.status == MessageStatus::Sent
                && m.provider_msg_id.as_deref() == Some(provider_message_id)
        }) else {
            return Ok(None);
        };

        apply(message, outcome.into_transition());
        Ok(Some(message.clone()))
    }
}
