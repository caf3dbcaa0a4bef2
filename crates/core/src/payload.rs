//! Domain event payloads handed to the outbox by producers.
//!
//! Producers pass already-fetched entities; nothing here reads from the
//! relational store. Each payload is serialized verbatim into the outbox
//! record's `details`, so it must carry everything delivery needs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{DomainError, DomainResult};
use crate::id::{SignupId, TaskId, UserId};

/// A freshly registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub created: DateTime<Utc>,
}

/// A user signing up for a project task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSignup {
    pub id: SignupId,
    pub user_id: UserId,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_title: Option<String>,
    pub created: DateTime<Utc>,
}

/// A successful login.
///
/// `last_login` is optional on the wire because upstream handlers build this
/// from a partially populated user row; the outbox rejects it when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLogin {
    pub user_id: UserId,
    pub email: String,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

impl UserLogin {
    /// The login timestamp, required for delivery.
    pub fn login_timestamp(&self) -> DomainResult<DateTime<Utc>> {
        self.last_login
            .ok_or_else(|| DomainError::missing("user login", "last_login"))
    }
}

/// Request to send a templated transactional email.
///
/// Exactly one of `recipient_id` and `email` selects the recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionalEmailRequest {
    pub template_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub properties: Map<String, JsonValue>,
}

impl TransactionalEmailRequest {
    pub fn to_recipient_id(template_name: impl Into<String>, recipient_id: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            recipient_id: Some(recipient_id.into()),
            email: None,
            properties: Map::new(),
        }
    }

    pub fn to_email(template_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            template_name: template_name.into(),
            recipient_id: None,
            email: Some(email.into()),
            properties: Map::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The single recipient selector (id or email).
    pub fn recipient(&self) -> DomainResult<&str> {
        if self.template_name.trim().is_empty() {
            return Err(DomainError::missing("transactional email", "template_name"));
        }
        match (self.recipient_id.as_deref(), self.email.as_deref()) {
            (Some(id), None) => Ok(id),
            (None, Some(email)) => Ok(email),
            (Some(_), Some(_)) => Err(DomainError::Validation(
                "transactional email must not specify both recipient_id and email".to_string(),
            )),
            (None, None) => Err(DomainError::missing(
                "transactional email",
                "recipient_id or email",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_without_timestamp_is_invalid() {
        let login = UserLogin {
            user_id: UserId::new(),
            email: "ada@example.org".to_string(),
            last_login: None,
        };

        assert_eq!(
            login.login_timestamp(),
            Err(DomainError::missing("user login", "last_login"))
        );
    }

    #[test]
    fn login_payload_deserializes_without_timestamp_field() {
        let json = serde_json::json!({
            "user_id": UserId::new(),
            "email": "ada@example.org",
        });

        let login: UserLogin = serde_json::from_value(json).unwrap();
        assert!(login.last_login.is_none());
    }

    #[test]
    fn recipient_selector_requires_exactly_one() {
        let by_id = TransactionalEmailRequest::to_recipient_id("welcome", "u-1");
        assert_eq!(by_id.recipient().unwrap(), "u-1");

        let by_email = TransactionalEmailRequest::to_email("welcome", "ada@example.org");
        assert_eq!(by_email.recipient().unwrap(), "ada@example.org");

        let mut both = by_id.clone();
        both.email = Some("ada@example.org".to_string());
        assert!(matches!(both.recipient(), Err(DomainError::Validation(_))));

        let mut neither = by_id;
        neither.recipient_id = None;
        assert!(neither.recipient().is_err());
    }

    #[test]
    fn blank_template_is_invalid() {
        let req = TransactionalEmailRequest::to_email("  ", "ada@example.org");
        assert!(matches!(
            req.recipient(),
            Err(DomainError::MissingField { field: "template_name", .. })
        ));
    }
}
