//! Delivery collaborator boundary: the external CRM/email system.
//!
//! The dispatcher never talks to a concrete CRM API. It selects a handler from
//! a per-type table and hands it the record's `details`.

use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use super::types::{NotificationType, OutboxRecord};

/// Failure reported by a delivery client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Access credential expired or was revoked.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The external system refused the request.
    #[error("rejected by external system: {0}")]
    Rejected(String),
    /// Network/transport failure or timeout.
    #[error("transport error: {0}")]
    Transport(String),
    /// The stored details could not be turned into a request.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

/// Client for the external system, one delivery function per notification type.
///
/// Implementations own their credential state (behind interior mutability) and
/// are shared by reference across dispatch threads.
pub trait DeliveryClient: Send + Sync {
    /// Create or update the CRM contact for a new user.
    fn upsert_contact(&self, details: &JsonValue) -> Result<(), DeliveryError>;

    /// Record a task signup on the user's timeline.
    fn record_task_signup(&self, details: &JsonValue) -> Result<(), DeliveryError>;

    /// Record a login on the user's timeline.
    fn record_login(&self, details: &JsonValue) -> Result<(), DeliveryError>;

    /// Send a templated transactional email.
    fn send_transactional_email(&self, details: &JsonValue) -> Result<(), DeliveryError>;

    /// Obtain a fresh access credential.
    fn refresh_credentials(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Delivery handler signature.
pub type DeliveryFn<C> = fn(&C, &JsonValue) -> Result<(), DeliveryError>;

/// Handler table: maps each notification type to its delivery function.
pub fn handler_for<C: DeliveryClient>(kind: NotificationType) -> DeliveryFn<C> {
    match kind {
        NotificationType::UserRegistration => C::upsert_contact,
        NotificationType::TaskSignup => C::record_task_signup,
        NotificationType::UserLogin => C::record_login,
        NotificationType::TransactionalEmail => C::send_transactional_email,
    }
}

/// Deliver a record through the handler selected by its type.
pub fn deliver<C: DeliveryClient>(client: &C, record: &OutboxRecord) -> Result<(), DeliveryError> {
    handler_for::<C>(record.kind)(client, &record.details)
}

/// Wraps a client so an expired credential is refreshed and the call retried once.
///
/// Callers only see the final outcome.
#[derive(Debug)]
pub struct Reauthorizing<C> {
    inner: C,
}

impl<C: DeliveryClient> Reauthorizing<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn call(&self, handler: DeliveryFn<C>, details: &JsonValue) -> Result<(), DeliveryError> {
        match handler(&self.inner, details) {
            Err(DeliveryError::Unauthorized(reason)) => {
                debug!(reason = %reason, "delivery unauthorized; refreshing credentials");
                self.inner.refresh_credentials()?;
                handler(&self.inner, details)
            }
            other => other,
        }
    }
}

impl<C: DeliveryClient> DeliveryClient for Reauthorizing<C> {
    fn upsert_contact(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.call(C::upsert_contact, details)
    }

    fn record_task_signup(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.call(C::record_task_signup, details)
    }

    fn record_login(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.call(C::record_login, details)
    }

    fn send_transactional_email(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.call(C::send_transactional_email, details)
    }

    fn refresh_credentials(&self) -> Result<(), DeliveryError> {
        self.inner.refresh_credentials()
    }
}

impl<C: DeliveryClient + ?Sized> DeliveryClient for Arc<C> {
    fn upsert_contact(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        (**self).upsert_contact(details)
    }

    fn record_task_signup(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        (**self).record_task_signup(details)
    }

    fn record_login(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        (**self).record_login(details)
    }

    fn send_transactional_email(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        (**self).send_transactional_email(details)
    }

    fn refresh_credentials(&self) -> Result<(), DeliveryError> {
        (**self).refresh_credentials()
    }
}

/// A client that logs deliveries instead of calling an external system.
///
/// Used for local runs and dry runs; optionally captures lines in a buffer.
#[derive(Debug, Default)]
pub struct LogDeliveryClient {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
}

impl LogDeliveryClient {
    pub fn new() -> Self {
        Self { buffer: None }
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            buffer: Some(buffer),
        }
    }

    fn log(&self, operation: &str, details: &JsonValue) -> Result<(), DeliveryError> {
        if !details.is_object() {
            return Err(DeliveryError::InvalidPayload(format!(
                "{operation} expects a JSON object, got {details}"
            )));
        }
        let line = format!("[DELIVERY] {operation} {details}");
        match &self.buffer {
            Some(buffer) => {
                let mut buffer = buffer.lock().map_err(|_| {
                    warn!("log delivery buffer poisoned");
                    DeliveryError::Transport("log buffer poisoned".to_string())
                })?;
                buffer.push(line);
            }
            None => info!(operation, %details, "delivered notification"),
        }
        Ok(())
    }
}

impl DeliveryClient for LogDeliveryClient {
    fn upsert_contact(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.log("upsert_contact", details)
    }

    fn record_task_signup(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.log("record_task_signup", details)
    }

    fn record_login(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.log("record_login", details)
    }

    fn send_transactional_email(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.log("send_transactional_email", details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::types::NotificationId;

    /// Fails with `Unauthorized` until credentials have been refreshed `needed` times.
    #[derive(Default)]
    struct ExpiringTokenClient {
        refreshes: AtomicUsize,
        needed: usize,
        calls: AtomicUsize,
    }

    impl ExpiringTokenClient {
        fn attempt(&self) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.refreshes.load(Ordering::SeqCst) >= self.needed {
                Ok(())
            } else {
                Err(DeliveryError::Unauthorized("token expired".to_string()))
            }
        }
    }

    impl DeliveryClient for ExpiringTokenClient {
        fn upsert_contact(&self, _: &JsonValue) -> Result<(), DeliveryError> {
            self.attempt()
        }
        fn record_task_signup(&self, _: &JsonValue) -> Result<(), DeliveryError> {
            self.attempt()
        }
        fn record_login(&self, _: &JsonValue) -> Result<(), DeliveryError> {
            self.attempt()
        }
        fn send_transactional_email(&self, _: &JsonValue) -> Result<(), DeliveryError> {
            self.attempt()
        }
        fn refresh_credentials(&self) -> Result<(), DeliveryError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn handler_table_routes_each_type() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let client = LogDeliveryClient::with_buffer(buffer.clone());

        for kind in NotificationType::ALL {
            let record = OutboxRecord::new(
                NotificationId::generate(),
                kind,
                "label",
                serde_json::json!({"kind": kind.as_str()}),
            );
            deliver(&client, &record).unwrap();
        }

        let lines = buffer.lock().unwrap();
        assert!(lines[0].starts_with("[DELIVERY] upsert_contact"));
        assert!(lines[1].starts_with("[DELIVERY] record_task_signup"));
        assert!(lines[2].starts_with("[DELIVERY] record_login"));
        assert!(lines[3].starts_with("[DELIVERY] send_transactional_email"));
    }

    #[test]
    fn reauthorizing_refreshes_once_and_retries() {
        let client = Reauthorizing::new(ExpiringTokenClient {
            needed: 1,
            ..Default::default()
        });

        client.upsert_contact(&serde_json::json!({})).unwrap();

        assert_eq!(client.inner().refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reauthorizing_gives_up_after_one_refresh() {
        let client = Reauthorizing::new(ExpiringTokenClient {
            needed: 2,
            ..Default::default()
        });

        let err = client.record_login(&serde_json::json!({})).unwrap_err();

        assert!(matches!(err, DeliveryError::Unauthorized(_)));
        assert_eq!(client.inner().refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reauthorizing_passes_through_other_failures() {
        struct Down;
        impl DeliveryClient for Down {
            fn upsert_contact(&self, _: &JsonValue) -> Result<(), DeliveryError> {
                Err(DeliveryError::Transport("connection refused".to_string()))
            }
            fn record_task_signup(&self, _: &JsonValue) -> Result<(), DeliveryError> {
                Ok(())
            }
            fn record_login(&self, _: &JsonValue) -> Result<(), DeliveryError> {
                Ok(())
            }
            fn send_transactional_email(&self, _: &JsonValue) -> Result<(), DeliveryError> {
                Ok(())
            }
            fn refresh_credentials(&self) -> Result<(), DeliveryError> {
                panic!("must not refresh on transport errors");
            }
        }

        let err = Reauthorizing::new(Down)
            .upsert_contact(&serde_json::json!({}))
            .unwrap_err();
        assert_eq!(err, DeliveryError::Transport("connection refused".to_string()));
    }

    #[test]
    fn log_client_rejects_non_object_details() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let client = LogDeliveryClient::with_buffer(buffer.clone());

        let err = client.record_login(&serde_json::json!(["not", "an", "object"])).unwrap_err();

        assert!(matches!(err, DeliveryError::InvalidPayload(msg) if msg.starts_with("record_login")));
        assert!(buffer.lock().unwrap().is_empty());
    }
}
