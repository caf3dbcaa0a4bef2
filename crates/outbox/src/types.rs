//! Outbox record, notification types and processing statuses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default number of retries after the first failed delivery.
///
/// A record fails `MAX_RETRIES + 1` times before it is dead-lettered.
pub const MAX_RETRIES: u32 = 2;

/// Unique outbox record identifier.
///
/// Reuses the originating entity's id when one exists, otherwise a fresh UUIDv7.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(String);

impl NotificationId {
    /// Generate a fresh identifier for events with no natural key.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NotificationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NotificationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of notification; selects the delivery handler and the GC policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    UserRegistration,
    TaskSignup,
    UserLogin,
    TransactionalEmail,
}

impl NotificationType {
    pub const ALL: [NotificationType; 4] = [
        NotificationType::UserRegistration,
        NotificationType::TaskSignup,
        NotificationType::UserLogin,
        NotificationType::TransactionalEmail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::UserRegistration => "user_registration",
            NotificationType::TaskSignup => "task_signup",
            NotificationType::UserLogin => "user_login",
            NotificationType::TransactionalEmail => "transactional_email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    /// Whether settled records of this type may be garbage collected.
    ///
    /// Transactional emails double as a delivery audit log and are kept.
    pub fn is_collectable(&self) -> bool {
        !matches!(self, NotificationType::TransactionalEmail)
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    /// Enqueued, never attempted
    New,
    /// Failed at least once, eligible for the next cycle
    Retrying,
    /// Delivered
    Processed,
    /// Exhausted retries; requires manual intervention
    #[serde(rename = "DLQ")]
    Dlq,
}

impl ProcessingStatus {
    /// Statuses the dispatcher polls.
    pub const PENDING: [ProcessingStatus; 2] = [ProcessingStatus::New, ProcessingStatus::Retrying];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::New => "NEW",
            ProcessingStatus::Retrying => "RETRYING",
            ProcessingStatus::Processed => "PROCESSED",
            ProcessingStatus::Dlq => "DLQ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            ProcessingStatus::New,
            ProcessingStatus::Retrying,
            ProcessingStatus::Processed,
            ProcessingStatus::Dlq,
        ]
        .into_iter()
        .find(|st| st.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Processed | ProcessingStatus::Dlq)
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable notification awaiting (or past) delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    /// Diagnostic only (email or recipient); never used for dispatch
    pub label: String,
    /// Full delivery payload, write-once
    pub details: serde_json::Value,
    pub processing_status: ProcessingStatus,
    pub processing_fail_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_error_message: Option<String>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl OutboxRecord {
    /// Create a new, never-attempted record.
    pub fn new(
        id: NotificationId,
        kind: NotificationType,
        label: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            kind,
            label: label.into(),
            details,
            processing_status: ProcessingStatus::New,
            processing_fail_count: 0,
            processing_error_message: None,
            created: now,
            modified: now,
        }
    }

    /// Timestamp the garbage collector measures age from.
    pub fn settled_at(&self) -> DateTime<Utc> {
        self.modified
    }

    /// Apply bookkeeping changes in place and bump `modified`.
    pub fn apply(&mut self, changes: &RecordChanges, now: DateTime<Utc>) {
        if let Some(status) = changes.processing_status {
            self.processing_status = status;
        }
        if let Some(count) = changes.processing_fail_count {
            self.processing_fail_count = count;
        }
        if let Some(message) = &changes.processing_error_message {
            self.processing_error_message = Some(message.clone());
        }
        self.modified = now;
    }
}

/// Partial update of an outbox record's bookkeeping fields.
///
/// Payload fields (`kind`, `label`, `details`) cannot be changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChanges {
    pub processing_status: Option<ProcessingStatus>,
    pub processing_fail_count: Option<u32>,
    pub processing_error_message: Option<String>,
}

impl RecordChanges {
    pub fn processed() -> Self {
        Self {
            processing_status: Some(ProcessingStatus::Processed),
            ..Default::default()
        }
    }

    pub fn failed(status: ProcessingStatus, fail_count: u32, error: impl Into<String>) -> Self {
        Self {
            processing_status: Some(status),
            processing_fail_count: Some(fail_count),
            processing_error_message: Some(error.into()),
        }
    }
}

/// Record counts per processing status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub new: usize,
    pub retrying: usize,
    pub processed: usize,
    pub dlq: usize,
}

impl OutboxStats {
    pub fn record(&mut self, status: ProcessingStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: ProcessingStatus, count: usize) {
        match status {
            ProcessingStatus::New => self.new += count,
            ProcessingStatus::Retrying => self.retrying += count,
            ProcessingStatus::Processed => self.processed += count,
            ProcessingStatus::Dlq => self.dlq += count,
        }
    }

    pub fn total(&self) -> usize {
        self.new + self.retrying + self.processed + self.dlq
    }
}
