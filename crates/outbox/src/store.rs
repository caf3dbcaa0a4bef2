//! Outbox storage abstraction and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};

use super::types::{NotificationId, OutboxRecord, OutboxStats, ProcessingStatus, RecordChanges};

/// Durable, status-indexed outbox storage.
pub trait OutboxStore: Send + Sync {
    /// Insert a record.
    ///
    /// Fails with `DuplicateKey` when the id exists and `allow_overwrite` is false.
    fn put(&self, record: OutboxRecord, allow_overwrite: bool) -> Result<(), OutboxStoreError>;

    /// Get a record by id.
    fn get(&self, id: &NotificationId) -> Result<Option<OutboxRecord>, OutboxStoreError>;

    /// All records in any of the given statuses, oldest first.
    fn query_by_status(
        &self,
        statuses: &[ProcessingStatus],
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError>;

    /// Records in `status` last modified before `now - age_threshold`, oldest first.
    fn query_by_status_older_than(
        &self,
        status: ProcessingStatus,
        age_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError>;

    /// Partially update bookkeeping fields; always bumps `modified`.
    fn update(
        &self,
        id: &NotificationId,
        changes: &RecordChanges,
    ) -> Result<OutboxRecord, OutboxStoreError>;

    /// Remove a record.
    fn delete(&self, id: &NotificationId) -> Result<(), OutboxStoreError>;

    /// Record counts per status.
    fn count_by_status(&self) -> Result<OutboxStats, OutboxStoreError>;
}

/// Outbox store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("notification already exists: {0}")]
    DuplicateKey(NotificationId),
    #[error("notification not found: {0}")]
    NotFound(NotificationId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// In-memory outbox store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    records: RwLock<HashMap<NotificationId, OutboxRecord>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> OutboxStoreError {
        OutboxStoreError::Storage("lock poisoned".to_string())
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn put(&self, record: OutboxRecord, allow_overwrite: bool) -> Result<(), OutboxStoreError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        if !allow_overwrite && records.contains_key(&record.id) {
            return Err(OutboxStoreError::DuplicateKey(record.id));
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    fn get(&self, id: &NotificationId) -> Result<Option<OutboxRecord>, OutboxStoreError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        Ok(records.get(id).cloned())
    }

    fn query_by_status(
        &self,
        statuses: &[ProcessingStatus],
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| statuses.contains(&r.processing_status))
            .cloned()
            .collect();

        result.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(result)
    }

    fn query_by_status_older_than(
        &self,
        status: ProcessingStatus,
        age_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let cutoff = now - age_threshold;
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = records
            .values()
            .filter(|r| r.processing_status == status && r.settled_at() < cutoff)
            .cloned()
            .collect();

        result.sort_by(|a, b| {
            a.settled_at()
                .cmp(&b.settled_at())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(result)
    }

    fn update(
        &self,
        id: &NotificationId,
        changes: &RecordChanges,
    ) -> Result<OutboxRecord, OutboxStoreError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        let record = records
            .get_mut(id)
            .ok_or_else(|| OutboxStoreError::NotFound(id.clone()))?;
        record.apply(changes, Utc::now());
        Ok(record.clone())
    }

    fn delete(&self, id: &NotificationId) -> Result<(), OutboxStoreError> {
        let mut records = self.records.write().map_err(|_| Self::poisoned())?;
        records
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| OutboxStoreError::NotFound(id.clone()))
    }

    fn count_by_status(&self) -> Result<OutboxStats, OutboxStoreError> {
        let records = self.records.read().map_err(|_| Self::poisoned())?;
        let mut stats = OutboxStats::default();
        for record in records.values() {
            stats.record(record.processing_status);
        }
        Ok(stats)
    }
}

impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    fn put(&self, record: OutboxRecord, allow_overwrite: bool) -> Result<(), OutboxStoreError> {
        (**self).put(record, allow_overwrite)
    }

    fn get(&self, id: &NotificationId) -> Result<Option<OutboxRecord>, OutboxStoreError> {
        (**self).get(id)
    }

    fn query_by_status(
        &self,
        statuses: &[ProcessingStatus],
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        (**self).query_by_status(statuses)
    }

    fn query_by_status_older_than(
        &self,
        status: ProcessingStatus,
        age_threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        (**self).query_by_status_older_than(status, age_threshold, now)
    }

    fn update(
        &self,
        id: &NotificationId,
        changes: &RecordChanges,
    ) -> Result<OutboxRecord, OutboxStoreError> {
        (**self).update(id, changes)
    }

    fn delete(&self, id: &NotificationId) -> Result<(), OutboxStoreError> {
        (**self).delete(id)
    }

    fn count_by_status(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).count_by_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NotificationType;

    fn record(id: &str, kind: NotificationType) -> OutboxRecord {
        OutboxRecord::new(NotificationId::new(id), kind, "label", serde_json::json!({"id": id}))
    }

    fn aged(mut record: OutboxRecord, status: ProcessingStatus, days: i64) -> OutboxRecord {
        let at = Utc::now() - Duration::days(days);
        record.processing_status = status;
        record.created = at;
        record.modified = at;
        record
    }

    #[test]
    fn put_rejects_duplicate_without_overwrite() {
        let store = InMemoryOutboxStore::new();
        store.put(record("a", NotificationType::TaskSignup), false).unwrap();

        let mut replacement = record("a", NotificationType::TaskSignup);
        replacement.label = "other".to_string();
        let err = store.put(replacement.clone(), false).unwrap_err();
        assert_eq!(err, OutboxStoreError::DuplicateKey(NotificationId::new("a")));
        assert_eq!(store.get(&"a".into()).unwrap().unwrap().label, "label");

        store.put(replacement, true).unwrap();
        assert_eq!(store.get(&"a".into()).unwrap().unwrap().label, "other");
    }

    #[test]
    fn get_unknown_is_none() {
        let store = InMemoryOutboxStore::new();
        assert!(store.get(&"missing".into()).unwrap().is_none());
    }

    #[test]
    fn query_by_status_matches_any_given_status() {
        let store = InMemoryOutboxStore::new();
        store.put(record("new", NotificationType::UserLogin), false).unwrap();
        store
            .put(aged(record("retry", NotificationType::UserLogin), ProcessingStatus::Retrying, 1), false)
            .unwrap();
        store
            .put(aged(record("done", NotificationType::UserLogin), ProcessingStatus::Processed, 1), false)
            .unwrap();
        store
            .put(aged(record("dead", NotificationType::UserLogin), ProcessingStatus::Dlq, 1), false)
            .unwrap();

        let pending = store.query_by_status(&ProcessingStatus::PENDING).unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["retry", "new"]);

        let dlq = store.query_by_status(&[ProcessingStatus::Dlq]).unwrap();
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn older_than_filters_by_age_and_orders_oldest_first() {
        let store = InMemoryOutboxStore::new();
        for (id, days) in [("d6", 6), ("d30", 30), ("d8", 8)] {
            store
                .put(aged(record(id, NotificationType::TaskSignup), ProcessingStatus::Processed, days), false)
                .unwrap();
        }
        store
            .put(aged(record("dlq", NotificationType::TaskSignup), ProcessingStatus::Dlq, 30), false)
            .unwrap();

        let old = store
            .query_by_status_older_than(ProcessingStatus::Processed, Duration::days(7), Utc::now())
            .unwrap();
        let ids: Vec<_> = old.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["d30", "d8"]);
    }

    #[test]
    fn update_bumps_modified_and_keeps_details() {
        let store = InMemoryOutboxStore::new();
        let original = aged(record("a", NotificationType::TaskSignup), ProcessingStatus::New, 2);
        store.put(original.clone(), false).unwrap();

        let updated = store.update(&"a".into(), &RecordChanges::processed()).unwrap();
        assert_eq!(updated.processing_status, ProcessingStatus::Processed);
        assert!(updated.modified > original.modified);
        assert_eq!(updated.details, original.details);
        assert_eq!(updated.created, original.created);
    }

    #[test]
    fn update_and_delete_unknown_are_not_found() {
        let store = InMemoryOutboxStore::new();
        assert!(matches!(
            store.update(&"x".into(), &RecordChanges::processed()),
            Err(OutboxStoreError::NotFound(_))
        ));
        assert!(matches!(store.delete(&"x".into()), Err(OutboxStoreError::NotFound(_))));
    }

    #[test]
    fn counts_by_status() {
        let store = InMemoryOutboxStore::arc();
        store.put(record("a", NotificationType::TaskSignup), false).unwrap();
        store.put(record("b", NotificationType::TaskSignup), false).unwrap();
        store
            .put(aged(record("c", NotificationType::TaskSignup), ProcessingStatus::Dlq, 0), false)
            .unwrap();
        store.delete(&"b".into()).unwrap();

        let stats = store.count_by_status().unwrap();
        assert_eq!(stats.new, 1);
        assert_eq!(stats.dlq, 1);
        assert_eq!(stats.total(), 2);
    }
}
