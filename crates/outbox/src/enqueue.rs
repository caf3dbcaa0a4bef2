//! Translation of domain events into outbox records.

use serde::Serialize;
use tracing::debug;

use herald_core::{DomainError, NewUser, TaskSignup, TransactionalEmailRequest, UserLogin};

use super::store::{OutboxStore, OutboxStoreError};
use super::types::{NotificationId, NotificationType, OutboxRecord};

/// Enqueue error, surfaced synchronously to the producer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] OutboxStoreError),
}

impl EnqueueError {
    /// Whether the notification id was already enqueued.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, EnqueueError::Store(OutboxStoreError::DuplicateKey(_)))
    }
}

/// Writes one `New` outbox record per domain event.
#[derive(Debug, Clone)]
pub struct Enqueuer<S> {
    store: S,
}

impl<S: OutboxStore> Enqueuer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Keyed by the new user's id; labelled with the email.
    pub fn enqueue_user_registration(&self, user: &NewUser) -> Result<OutboxRecord, EnqueueError> {
        self.insert(
            NotificationId::new(user.id.to_string()),
            NotificationType::UserRegistration,
            user.email.clone(),
            user,
        )
    }

    /// Keyed by the signup id, so re-enqueueing the same signup is rejected.
    pub fn enqueue_task_signup(&self, signup: &TaskSignup) -> Result<OutboxRecord, EnqueueError> {
        self.insert(
            NotificationId::new(signup.id.to_string()),
            NotificationType::TaskSignup,
            signup.user_id.to_string(),
            signup,
        )
    }

    /// A user logs in many times, so each login gets a fresh id.
    pub fn enqueue_user_login(&self, login: &UserLogin) -> Result<OutboxRecord, EnqueueError> {
        login.login_timestamp()?;
        self.insert(
            NotificationId::generate(),
            NotificationType::UserLogin,
            login.email.clone(),
            login,
        )
    }

    /// Labelled `{template_name}_{recipient}`; exactly one recipient selector is required.
    pub fn enqueue_transactional_email(
        &self,
        request: &TransactionalEmailRequest,
    ) -> Result<OutboxRecord, EnqueueError> {
        let recipient = request.recipient()?;
        let label = format!("{}_{}", request.template_name, recipient);
        self.insert(
            NotificationId::generate(),
            NotificationType::TransactionalEmail,
            label,
            request,
        )
    }

    fn insert<P: Serialize>(
        &self,
        id: NotificationId,
        kind: NotificationType,
        label: String,
        payload: &P,
    ) -> Result<OutboxRecord, EnqueueError> {
        let details = serde_json::to_value(payload)
            .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?;
        let record = OutboxRecord::new(id, kind, label, details);

        self.store.put(record.clone(), false)?;
        debug!(notification_id = %record.id, kind = %kind, "notification enqueued");
        Ok(record)
    }
}
