//! Record store: tenant-scoped, append-mostly audit storage plus run leases.
//!
//! The trait is the only surface the controller sees. [`InMemoryRecordStore`]
//! serves tests and single-process embedding; `FsRecordStore` persists the
//! same records as JSON lines.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::core::records::{
    CorrectionRecord, RecordCounts, RunOutcomeRecord, TaskAction, VerificationRecord,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task '{task_id}' already has an active run")]
    LeaseHeld { task_id: String },

    #[error("run lease for task '{task_id}' is no longer held by '{holder}'")]
    LeaseLost { task_id: String, holder: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_verification(&self, record: &VerificationRecord) -> Result<(), StoreError>;

    async fn put_correction(&self, record: &CorrectionRecord) -> Result<(), StoreError>;

    async fn append_action(&self, entry: &TaskAction) -> Result<(), StoreError>;

    async fn put_run_outcome(&self, record: &RunOutcomeRecord) -> Result<(), StoreError>;

    /// Take the exclusive running marker for `task_id`. An expired lease may be
    /// taken over; a live lease held by someone else yields `LeaseHeld`.
    ///
    /// Returns the lease generation: it increases with every grant for the
    /// task, takeovers included, and survives release.
    async fn acquire_run_lease(
        &self,
        task_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError>;

    /// Extend a lease still held by `holder`; otherwise `LeaseLost`.
    async fn renew_run_lease(
        &self,
        task_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Drop the lease if `holder` owns it. Releasing a missing lease is a no-op.
    async fn release_run_lease(&self, task_id: &str, holder: &str) -> Result<(), StoreError>;

    async fn get_counts(
        &self,
        tenant_id: &str,
        task_id: &str,
        step_index: u32,
    ) -> Result<RecordCounts, StoreError>;

    /// Verification records in append order.
    async fn list_verifications(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<VerificationRecord>, StoreError>;

    /// Correction records in append order.
    async fn list_corrections(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<CorrectionRecord>, StoreError>;

    /// Task actions in append order.
    async fn list_actions(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<TaskAction>, StoreError>;

    async fn run_outcome(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Option<RunOutcomeRecord>, StoreError>;
}

type TaskKey = (String, String);

fn task_key(tenant_id: &str, task_id: &str) -> TaskKey {
    (tenant_id.to_string(), task_id.to_string())
}

#[derive(Debug, Default)]
struct TaskRecords {
    verifications: Vec<VerificationRecord>,
    corrections: Vec<CorrectionRecord>,
    actions: Vec<TaskAction>,
    outcome: Option<RunOutcomeRecord>,
}

#[derive(Debug)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// Lease state per task; the generation outlives the active lease.
#[derive(Debug, Default)]
struct LeaseSlot {
    generation: u64,
    active: Option<Lease>,
}

impl LeaseSlot {
    fn held_by(&self, holder: &str) -> bool {
        self.active.as_ref().is_some_and(|l| l.holder == holder)
    }
}

/// In-memory implementation for development and testing.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<TaskKey, TaskRecords>>,
    leases: RwLock<HashMap<String, LeaseSlot>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(
        &self,
        tenant_id: &str,
        task_id: &str,
        f: impl FnOnce(&mut TaskRecords) -> T,
    ) -> Result<T, StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(f(records.entry(task_key(tenant_id, task_id)).or_default()))
    }

    fn read_records<T>(
        &self,
        tenant_id: &str,
        task_id: &str,
        f: impl FnOnce(Option<&TaskRecords>) -> T,
    ) -> Result<T, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(f(records.get(&task_key(tenant_id, task_id))))
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put_verification(&self, record: &VerificationRecord) -> Result<(), StoreError> {
        self.with_records(&record.tenant_id, &record.task_id, |r| {
            r.verifications.push(record.clone());
        })
    }

    async fn put_correction(&self, record: &CorrectionRecord) -> Result<(), StoreError> {
        self.with_records(&record.tenant_id, &record.task_id, |r| {
            r.corrections.push(record.clone());
        })
    }

    async fn append_action(&self, entry: &TaskAction) -> Result<(), StoreError> {
        self.with_records(&entry.tenant_id, &entry.task_id, |r| {
            r.actions.push(entry.clone());
        })
    }

    async fn put_run_outcome(&self, record: &RunOutcomeRecord) -> Result<(), StoreError> {
        self.with_records(&record.tenant_id, &record.task_id, |r| {
            r.outcome = Some(record.clone());
        })
    }

    async fn acquire_run_lease(
        &self,
        task_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let mut leases = self
            .leases
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let now = Instant::now();
        let slot = leases.entry(task_id.to_string()).or_default();
        if let Some(existing) = &slot.active {
            if existing.holder != holder && existing.expires_at > now {
                return Err(StoreError::LeaseHeld {
                    task_id: task_id.to_string(),
                });
            }
        }
        slot.generation += 1;
        slot.active = Some(Lease {
            holder: holder.to_string(),
            expires_at: now + ttl,
        });
        Ok(slot.generation)
    }

    async fn renew_run_lease(
        &self,
        task_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let mut leases = self
            .leases
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        match leases.get_mut(task_id).and_then(|slot| slot.active.as_mut()) {
            Some(lease) if lease.holder == holder => {
                lease.expires_at = Instant::now() + ttl;
                Ok(())
            }
            _ => Err(StoreError::LeaseLost {
                task_id: task_id.to_string(),
                holder: holder.to_string(),
            }),
        }
    }

    async fn release_run_lease(&self, task_id: &str, holder: &str) -> Result<(), StoreError> {
        let mut leases = self
            .leases
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if let Some(slot) = leases.get_mut(task_id) {
            if slot.held_by(holder) {
                slot.active = None;
            }
        }
        Ok(())
    }

    async fn get_counts(
        &self,
        tenant_id: &str,
        task_id: &str,
        step_index: u32,
    ) -> Result<RecordCounts, StoreError> {
        self.read_records(tenant_id, task_id, |records| {
            let Some(records) = records else {
                return RecordCounts::default();
            };
            RecordCounts {
                verifications: records
                    .verifications
                    .iter()
                    .filter(|r| r.step_index == step_index)
                    .count() as u32,
                corrections: records
                    .corrections
                    .iter()
                    .filter(|r| r.step_index == step_index)
                    .count() as u32,
            }
        })
    }

    async fn list_verifications(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<VerificationRecord>, StoreError> {
        self.read_records(tenant_id, task_id, |records| {
            records.map(|r| r.verifications.clone()).unwrap_or_default()
        })
    }

    async fn list_corrections(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<CorrectionRecord>, StoreError> {
        self.read_records(tenant_id, task_id, |records| {
            records.map(|r| r.corrections.clone()).unwrap_or_default()
        })
    }

    async fn list_actions(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<TaskAction>, StoreError> {
        self.read_records(tenant_id, task_id, |records| {
            records.map(|r| r.actions.clone()).unwrap_or_default()
        })
    }

    async fn run_outcome(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Option<RunOutcomeRecord>, StoreError> {
        self.read_records(tenant_id, task_id, |records| {
            records.and_then(|r| r.outcome.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::records::ActionStatus;
    use chrono::Utc;

    fn action(tenant: &str, step_index: u32, action: &str) -> TaskAction {
        TaskAction {
            tenant_id: tenant.to_string(),
            task_id: "task-1".to_string(),
            step_index,
            action: action.to_string(),
            status: ActionStatus::Completed,
            thought: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = InMemoryRecordStore::new();
        let ttl = Duration::from_secs(60);
        store
            .acquire_run_lease("task-1", "a", ttl)
            .await
            .expect("acquire");
        let err = store
            .acquire_run_lease("task-1", "b", ttl)
            .await
            .expect_err("held");
        assert_eq!(
            err,
            StoreError::LeaseHeld {
                task_id: "task-1".to_string()
            }
        );

        store.release_run_lease("task-1", "a").await.expect("release");
        store
            .acquire_run_lease("task-1", "b", ttl)
            .await
            .expect("acquire after release");
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = InMemoryRecordStore::new();
        store
            .acquire_run_lease("task-1", "crashed", Duration::ZERO)
            .await
            .expect("acquire");
        store
            .acquire_run_lease("task-1", "recovery", Duration::from_secs(60))
            .await
            .expect("take over");
        let err = store
            .renew_run_lease("task-1", "crashed", Duration::from_secs(60))
            .await
            .expect_err("lost");
        assert!(matches!(err, StoreError::LeaseLost { .. }));
    }

    /// Verifies generations keep increasing across release and takeover.
    #[tokio::test]
    async fn lease_generation_increases_per_grant() {
        let store = InMemoryRecordStore::new();
        let ttl = Duration::from_secs(60);
        let first = store
            .acquire_run_lease("task-1", "a", ttl)
            .await
            .expect("acquire");
        store.release_run_lease("task-1", "a").await.expect("release");
        let second = store
            .acquire_run_lease("task-1", "b", Duration::ZERO)
            .await
            .expect("acquire again");
        let third = store
            .acquire_run_lease("task-1", "c", ttl)
            .await
            .expect("take over");
        assert_eq!((first, second, third), (1, 2, 3));
        let other = store
            .acquire_run_lease("task-2", "a", ttl)
            .await
            .expect("other task");
        assert_eq!(other, 1);
    }

    #[tokio::test]
    async fn release_by_non_holder_keeps_lease() {
        let store = InMemoryRecordStore::new();
        let ttl = Duration::from_secs(60);
        store
            .acquire_run_lease("task-1", "a", ttl)
            .await
            .expect("acquire");
        store.release_run_lease("task-1", "b").await.expect("no-op");
        assert!(store.acquire_run_lease("task-1", "b", ttl).await.is_err());
    }

    #[tokio::test]
    async fn records_are_scoped_by_tenant_and_ordered() {
        let store = InMemoryRecordStore::new();
        store
            .append_action(&action("t1", 0, "first"))
            .await
            .expect("append");
        store
            .append_action(&action("t1", 1, "second"))
            .await
            .expect("append");
        store
            .append_action(&action("t2", 0, "other tenant"))
            .await
            .expect("append");

        let actions = store.list_actions("t1", "task-1").await.expect("list");
        let names: Vec<&str> = actions.iter().map(|a| a.action.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(
            store
                .list_actions("t3", "task-1")
                .await
                .expect("list")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn counts_default_to_zero() {
        let store = InMemoryRecordStore::new();
        let counts = store.get_counts("t", "task", 4).await.expect("counts");
        assert_eq!(counts, RecordCounts::default());
        assert_eq!(counts.next_attempt_number(), 1);
    }
}
