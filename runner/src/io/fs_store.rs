//! File-backed record store.
//!
//! Layout under the store root:
//!
//! ```text
//! records/<tenant>/<task>/verifications.jsonl
//! records/<tenant>/<task>/corrections.jsonl
//! records/<tenant>/<task>/actions.jsonl
//! records/<tenant>/<task>/outcome.json
//! leases/<task>.json
//! ```
//!
//! Record files are append-only JSON lines; the outcome and lease files are
//! replaced atomically (temp file + rename). File I/O runs on the blocking
//! pool. Writes are serialized within the process; the store is not meant to
//! be shared between processes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::records::{
    CorrectionRecord, RecordCounts, RunOutcomeRecord, TaskAction, VerificationRecord,
};
use crate::io::record_store::{RecordStore, StoreError};

const VERIFICATIONS_FILE: &str = "verifications.jsonl";
const CORRECTIONS_FILE: &str = "corrections.jsonl";
const ACTIONS_FILE: &str = "actions.jsonl";
const OUTCOME_FILE: &str = "outcome.json";

/// Lease file contents. Kept after release so the generation survives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseFile {
    generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active: Option<ActiveLease>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ActiveLease {
    holder: String,
    expires_at: DateTime<Utc>,
}

impl LeaseFile {
    fn held_by(&self, holder: &str) -> bool {
        self.active.as_ref().is_some_and(|l| l.holder == holder)
    }
}

#[derive(Debug, Clone)]
pub struct FsRecordStore {
    inner: Arc<StoreRoot>,
}

#[derive(Debug)]
struct StoreRoot {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsRecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreRoot {
                root: root.into(),
                write_lock: Mutex::new(()),
            }),
        }
    }

    /// Run `op` against the store root on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&StoreRoot) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Internal(format!("store task failed: {e}")))?
    }
}

impl StoreRoot {
    fn task_dir(&self, tenant_id: &str, task_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join("records")
            .join(path_component(tenant_id)?)
            .join(path_component(task_id)?))
    }

    fn lease_path(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        Ok(self
            .root
            .join("leases")
            .join(format!("{}.json", path_component(task_id)?)))
    }

    fn append<T: Serialize>(
        &self,
        tenant_id: &str,
        task_id: &str,
        file: &str,
        record: &T,
    ) -> Result<(), StoreError> {
        let path = self.task_dir(tenant_id, task_id)?.join(file);
        let mut line =
            serde_json::to_string(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push('\n');

        let _guard = self.lock()?;
        create_parent(&path)?;
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error("open", &path, e))?;
        handle
            .write_all(line.as_bytes())
            .map_err(|e| io_error("append", &path, e))?;
        debug!(path = %path.display(), "appended record");
        Ok(())
    }

    fn read_lines<T: DeserializeOwned>(
        &self,
        tenant_id: &str,
        task_id: &str,
        file: &str,
    ) -> Result<Vec<T>, StoreError> {
        let path = self.task_dir(tenant_id, task_id)?.join(file);
        let Some(contents) = read_optional(&path)? else {
            return Ok(Vec::new());
        };
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    StoreError::Serialization(format!("parse {}: {}", path.display(), e))
                })
            })
            .collect()
    }

    fn count_for_step<T>(
        &self,
        tenant_id: &str,
        task_id: &str,
        file: &str,
        step_index: u32,
        index_of: impl Fn(&T) -> u32,
    ) -> Result<u32, StoreError>
    where
        T: DeserializeOwned,
    {
        let records: Vec<T> = self.read_lines(tenant_id, task_id, file)?;
        Ok(records.iter().filter(|r| index_of(r) == step_index).count() as u32)
    }

    fn read_lease(&self, path: &Path) -> Result<LeaseFile, StoreError> {
        let Some(contents) = read_optional(path)? else {
            return Ok(LeaseFile::default());
        };
        serde_json::from_str(&contents)
            .map_err(|e| StoreError::Serialization(format!("parse {}: {}", path.display(), e)))
    }

    fn grant(&self, holder: &str, ttl: Duration) -> Result<ActiveLease, StoreError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(ActiveLease {
            holder: holder.to_string(),
            expires_at: Utc::now() + ttl,
        })
    }

    fn acquire_lease(&self, task_id: &str, holder: &str, ttl: Duration) -> Result<u64, StoreError> {
        let path = self.lease_path(task_id)?;
        let _guard = self.lock()?;
        let mut lease = self.read_lease(&path)?;
        if let Some(existing) = &lease.active {
            if existing.holder != holder && existing.expires_at > Utc::now() {
                return Err(StoreError::LeaseHeld {
                    task_id: task_id.to_string(),
                });
            }
            debug!(task_id, previous = %existing.holder, "taking over run lease");
        }
        lease.generation += 1;
        lease.active = Some(self.grant(holder, ttl)?);
        write_json_atomic(&path, &lease)?;
        Ok(lease.generation)
    }

    fn renew_lease(&self, task_id: &str, holder: &str, ttl: Duration) -> Result<(), StoreError> {
        let path = self.lease_path(task_id)?;
        let _guard = self.lock()?;
        let mut lease = self.read_lease(&path)?;
        if !lease.held_by(holder) {
            return Err(StoreError::LeaseLost {
                task_id: task_id.to_string(),
                holder: holder.to_string(),
            });
        }
        lease.active = Some(self.grant(holder, ttl)?);
        write_json_atomic(&path, &lease)
    }

    fn release_lease(&self, task_id: &str, holder: &str) -> Result<(), StoreError> {
        let path = self.lease_path(task_id)?;
        let _guard = self.lock()?;
        let mut lease = self.read_lease(&path)?;
        if lease.held_by(holder) {
            lease.active = None;
            write_json_atomic(&path, &lease)?;
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }
}

/// Reject ids that would escape the store root.
fn path_component(id: &str) -> Result<&str, StoreError> {
    if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(StoreError::Io(format!("invalid id for path component: '{id}'")));
    }
    Ok(id)
}

fn io_error(op: &str, path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Io(format!("{} {}: {}", op, path.display(), err))
}

fn create_parent(path: &Path) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Io(format!("path missing parent {}", path.display())))?;
    fs::create_dir_all(parent).map_err(|e| io_error("create directory", parent, e))
}

fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error("read", path, err)),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut buf =
        serde_json::to_string_pretty(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    buf.push('\n');
    create_parent(path)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).map_err(|e| io_error("write temp", &tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| io_error("replace", path, e))
}

#[async_trait]
impl RecordStore for FsRecordStore {
    async fn put_verification(&self, record: &VerificationRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |store| {
            store.append(&record.tenant_id, &record.task_id, VERIFICATIONS_FILE, &record)
        })
        .await
    }

    async fn put_correction(&self, record: &CorrectionRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |store| {
            store.append(&record.tenant_id, &record.task_id, CORRECTIONS_FILE, &record)
        })
        .await
    }

    async fn append_action(&self, entry: &TaskAction) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.blocking(move |store| {
            store.append(&entry.tenant_id, &entry.task_id, ACTIONS_FILE, &entry)
        })
        .await
    }

    async fn put_run_outcome(&self, record: &RunOutcomeRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.blocking(move |store| {
            let path = store
                .task_dir(&record.tenant_id, &record.task_id)?
                .join(OUTCOME_FILE);
            let _guard = store.lock()?;
            write_json_atomic(&path, &record)
        })
        .await
    }

    async fn acquire_run_lease(
        &self,
        task_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<u64, StoreError> {
        let (task_id, holder) = (task_id.to_string(), holder.to_string());
        self.blocking(move |store| store.acquire_lease(&task_id, &holder, ttl))
            .await
    }

    async fn renew_run_lease(
        &self,
        task_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let (task_id, holder) = (task_id.to_string(), holder.to_string());
        self.blocking(move |store| store.renew_lease(&task_id, &holder, ttl))
            .await
    }

    async fn release_run_lease(&self, task_id: &str, holder: &str) -> Result<(), StoreError> {
        let (task_id, holder) = (task_id.to_string(), holder.to_string());
        self.blocking(move |store| store.release_lease(&task_id, &holder))
            .await
    }

    async fn get_counts(
        &self,
        tenant_id: &str,
        task_id: &str,
        step_index: u32,
    ) -> Result<RecordCounts, StoreError> {
        let (tenant_id, task_id) = (tenant_id.to_string(), task_id.to_string());
        self.blocking(move |store| {
            Ok(RecordCounts {
                verifications: store.count_for_step(
                    &tenant_id,
                    &task_id,
                    VERIFICATIONS_FILE,
                    step_index,
                    |r: &VerificationRecord| r.step_index,
                )?,
                corrections: store.count_for_step(
                    &tenant_id,
                    &task_id,
                    CORRECTIONS_FILE,
                    step_index,
                    |r: &CorrectionRecord| r.step_index,
                )?,
            })
        })
        .await
    }

    async fn list_verifications(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<VerificationRecord>, StoreError> {
        let (tenant_id, task_id) = (tenant_id.to_string(), task_id.to_string());
        self.blocking(move |store| store.read_lines(&tenant_id, &task_id, VERIFICATIONS_FILE))
            .await
    }

    async fn list_corrections(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<CorrectionRecord>, StoreError> {
        let (tenant_id, task_id) = (tenant_id.to_string(), task_id.to_string());
        self.blocking(move |store| store.read_lines(&tenant_id, &task_id, CORRECTIONS_FILE))
            .await
    }

    async fn list_actions(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Vec<TaskAction>, StoreError> {
        let (tenant_id, task_id) = (tenant_id.to_string(), task_id.to_string());
        self.blocking(move |store| store.read_lines(&tenant_id, &task_id, ACTIONS_FILE))
            .await
    }

    async fn run_outcome(
        &self,
        tenant_id: &str,
        task_id: &str,
    ) -> Result<Option<RunOutcomeRecord>, StoreError> {
        let (tenant_id, task_id) = (tenant_id.to_string(), task_id.to_string());
        self.blocking(move |store| {
            let path = store.task_dir(&tenant_id, &task_id)?.join(OUTCOME_FILE);
            let Some(contents) = read_optional(&path)? else {
                return Ok(None);
            };
            serde_json::from_str(&contents).map(Some).map_err(|e| {
                StoreError::Serialization(format!("parse {}: {}", path.display(), e))
            })
        })
        .await
    }
}
