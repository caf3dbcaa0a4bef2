//! End-to-end tests for the outbox pipeline.
//!
//! Tests: Enqueuer → OutboxStore → Dispatcher → GarbageCollector
//!
//! Verifies:
//! - Each notification type is delivered and settles as PROCESSED
//! - Transient failures are retried and recovered
//! - Exhausted records are dead-lettered and retained
//! - Retention cleanup only touches eligible settled records

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use proptest::prelude::*;
use serde_json::Value as JsonValue;

use herald_core::{NewUser, SignupId, TaskId, TaskSignup, TransactionalEmailRequest, UserId, UserLogin};
use herald_outbox::{
    DeliveryClient, DeliveryError, Dispatcher, Enqueuer, GarbageCollector, InMemoryOutboxStore,
    NotificationId, OutboxStore, ProcessingStatus, RecordChanges,
};

/// Delivery client that replays a scripted sequence of outcomes, then succeeds.
#[derive(Default)]
struct ScriptedClient {
    script: Mutex<VecDeque<Result<(), DeliveryError>>>,
    delivered: Mutex<Vec<JsonValue>>,
}

impl ScriptedClient {
    fn failing(times: usize) -> Self {
        let script = (0..times)
            .map(|i| Err(DeliveryError::Transport(format!("timeout #{}", i + 1))))
            .collect();
        Self {
            script: Mutex::new(script),
            delivered: Mutex::new(Vec::new()),
        }
    }

    fn next(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if outcome.is_ok() {
            self.delivered.lock().unwrap().push(details.clone());
        }
        outcome
    }
}

impl DeliveryClient for ScriptedClient {
    fn upsert_contact(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.next(details)
    }
    fn record_task_signup(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.next(details)
    }
    fn record_login(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.next(details)
    }
    fn send_transactional_email(&self, details: &JsonValue) -> Result<(), DeliveryError> {
        self.next(details)
    }
}

fn signup(id: SignupId) -> TaskSignup {
    TaskSignup {
        id,
        user_id: UserId::new(),
        task_id: TaskId::new(),
        project_title: Some("Community garden".to_string()),
        task_title: Some("Watering".to_string()),
        created: Utc::now(),
    }
}

fn backdate(store: &InMemoryOutboxStore, id: &NotificationId, days: i64) {
    let mut record = store.get(id).unwrap().unwrap();
    record.modified = Utc::now() - Duration::days(days);
    store.put(record, true).unwrap();
}

#[test]
fn signup_recovers_after_one_transient_failure() {
    let store = InMemoryOutboxStore::arc();
    let enqueuer = Enqueuer::new(store.clone());
    let record = enqueuer.enqueue_task_signup(&signup(SignupId::new())).unwrap();
    let dispatcher = Dispatcher::new(store.clone(), ScriptedClient::failing(1));

    let first = dispatcher.run_cycle().unwrap();
    assert_eq!(first.retrying, 1);

    let second = dispatcher.run_cycle().unwrap();
    assert_eq!(second.succeeded, 1);

    let stored = store.get(&record.id).unwrap().unwrap();
    assert_eq!(stored.processing_status, ProcessingStatus::Processed);
    assert_eq!(stored.processing_fail_count, 1);
    assert_eq!(stored.processing_error_message.as_deref(), Some("transport error: timeout #1"));
    assert_eq!(stored.details, record.details);
    assert_eq!(dispatcher.client().delivered.lock().unwrap()[0], record.details);
}

#[test]
fn every_type_is_delivered() {
    let store = InMemoryOutboxStore::arc();
    let enqueuer = Enqueuer::new(store.clone());

    let user_id = UserId::new();
    enqueuer
        .enqueue_user_registration(&NewUser {
            id: user_id,
            email: "grace@example.org".to_string(),
            first_name: "Grace".to_string(),
            last_name: "Hopper".to_string(),
            phone_number: Some("+1 555 0100".to_string()),
            created: Utc::now(),
        })
        .unwrap();
    enqueuer.enqueue_task_signup(&signup(SignupId::new())).unwrap();
    enqueuer
        .enqueue_user_login(&UserLogin {
            user_id,
            email: "grace@example.org".to_string(),
            last_login: Some(Utc::now()),
        })
        .unwrap();
    enqueuer
        .enqueue_transactional_email(
            &TransactionalEmailRequest::to_recipient_id("signup_confirmation", user_id.to_string())
                .with_property("task", "Watering"),
        )
        .unwrap();

    let dispatcher = Dispatcher::new(store.clone(), ScriptedClient::default());
    let summary = dispatcher.run_cycle().unwrap();

    assert_eq!(summary.attempted, 4);
    assert_eq!(summary.succeeded, 4);
    let stats = store.count_by_status().unwrap();
    assert_eq!(stats.processed, 4);
    for record in store.query_by_status(&[ProcessingStatus::Processed]).unwrap() {
        assert_eq!(record.processing_fail_count, 0);
    }
}

#[test]
fn exhausted_record_is_dead_lettered_and_never_collected() {
    let store = InMemoryOutboxStore::arc();
    let enqueuer = Enqueuer::new(store.clone());
    let record = enqueuer.enqueue_task_signup(&signup(SignupId::new())).unwrap();
    let dispatcher = Dispatcher::new(store.clone(), ScriptedClient::failing(10));

    let statuses: Vec<_> = (0..3)
        .map(|_| {
            dispatcher.run_cycle().unwrap();
            let r = store.get(&record.id).unwrap().unwrap();
            (r.processing_status, r.processing_fail_count)
        })
        .collect();

    assert_eq!(
        statuses,
        vec![
            (ProcessingStatus::Retrying, 1),
            (ProcessingStatus::Retrying, 2),
            (ProcessingStatus::Dlq, 3),
        ]
    );

    backdate(&store, &record.id, 30);
    let deleted = GarbageCollector::new(store.clone()).run_cycle().unwrap();
    assert!(deleted.is_empty());
    assert!(store.get(&record.id).unwrap().is_some());
}

#[test]
fn collection_respects_age_and_type() {
    let store = InMemoryOutboxStore::arc();
    let enqueuer = Enqueuer::new(store.clone());
    let old = enqueuer.enqueue_task_signup(&signup(SignupId::new())).unwrap();
    let young = enqueuer.enqueue_task_signup(&signup(SignupId::new())).unwrap();
    let mail = enqueuer
        .enqueue_transactional_email(&TransactionalEmailRequest::to_email(
            "password_reset",
            "grace@example.org",
        ))
        .unwrap();

    Dispatcher::new(store.clone(), ScriptedClient::default())
        .run_cycle()
        .unwrap();
    backdate(&store, &old.id, 8);
    backdate(&store, &young.id, 6);
    backdate(&store, &mail.id, 30);

    let deleted = GarbageCollector::new(store.clone()).run_cycle().unwrap();

    let ids: Vec<_> = deleted.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, vec![old.id]);
    assert!(store.get(&young.id).unwrap().is_some());
    assert!(store.get(&mail.id).unwrap().is_some());
}

#[test]
fn shared_store_behind_trait_object() {
    let store: Arc<dyn OutboxStore> = InMemoryOutboxStore::arc();
    let enqueuer = Enqueuer::new(store.clone());
    let record = enqueuer.enqueue_task_signup(&signup(SignupId::new())).unwrap();

    store.update(&record.id, &RecordChanges::processed()).unwrap();

    let dispatcher = Dispatcher::new(store.clone(), ScriptedClient::default());
    assert_eq!(dispatcher.run_cycle().unwrap().attempted, 0);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Property: whatever the failure pattern, the fail count never exceeds
    /// `max_retries + 1`, and once DLQ is reached the record never leaves it.
    #[test]
    fn retry_bookkeeping_is_bounded(
        outcomes in prop::collection::vec(any::<bool>(), 1..12),
        max_retries in 0u32..4,
    ) {
        let store = InMemoryOutboxStore::arc();
        let record = Enqueuer::new(store.clone())
            .enqueue_task_signup(&signup(SignupId::new()))
            .unwrap();
        let script = outcomes
            .iter()
            .map(|ok| if *ok { Ok(()) } else { Err(DeliveryError::Rejected("no".to_string())) })
            .collect();
        let client = ScriptedClient { script: Mutex::new(script), delivered: Mutex::new(Vec::new()) };
        let dispatcher = Dispatcher::new(store.clone(), client).with_max_retries(max_retries);

        let mut seen_dlq = false;
        let mut last_count = 0;
        for _ in 0..outcomes.len() {
            dispatcher.run_cycle().unwrap();
            let r = store.get(&record.id).unwrap().unwrap();

            prop_assert!(r.processing_fail_count <= max_retries + 1);
            prop_assert!(r.processing_fail_count >= last_count);
            if seen_dlq {
                prop_assert_eq!(r.processing_status, ProcessingStatus::Dlq);
            }
            seen_dlq = r.processing_status == ProcessingStatus::Dlq;
            last_count = r.processing_fail_count;
            if r.processing_status == ProcessingStatus::Processed {
                break;
            }
        }
    }
}
