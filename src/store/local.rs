use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fd_lock::RwLock;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::document::StoreDocument;
use super::{StoreError, TaskFilter, TaskStore};
use crate::coordination::SystemSnapshot;
use crate::tasks::{Claim, ClaimRecord, ReleaseOutcome, Task, TaskEntry};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Task store backed by one JSON document, serialized across processes with
/// an exclusive advisory lock on a sibling `<file>.lock`.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl LocalFileStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seed or replace the pool wholesale. Used by task authoring tools and tests.
    pub async fn put_tasks(&self, tasks: Vec<Task>) -> Result<(), StoreError> {
        self.transact(true, move |doc| {
            doc.available_tasks.items = tasks;
            Ok(())
        })
        .await
    }

    /// Run `operation` against the current document while holding the lock.
    /// With `write`, the mutated document replaces the file before the lock drops.
    async fn transact<R, F>(&self, write: bool, operation: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut StoreDocument) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.transact_blocking(write, operation))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store worker failed: {e}")))?
    }

    fn transact_blocking<R>(
        &self,
        write: bool,
        operation: impl FnOnce(&mut StoreDocument) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        let mut lock = RwLock::new(lock_file);

        let deadline = Instant::now() + self.lock_timeout;
        let _guard = loop {
            match lock.try_write() {
                Ok(guard) => break guard,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(StoreError::Io(err)),
            }
            if Instant::now() >= deadline {
                return Err(StoreError::Unavailable(format!(
                    "could not lock {} within {}ms",
                    self.lock_path.display(),
                    self.lock_timeout.as_millis()
                )));
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        };

        let mut document = self.load()?;
        let result = operation(&mut document)?;
        if write {
            self.save(&document)?;
        }
        Ok(result)
    }

    fn load(&self) -> Result<StoreDocument, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => StoreDocument::from_json(&raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(StoreDocument::default()),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Whole-document rewrite through a temp file so readers never see a partial write.
    fn save(&self, document: &StoreDocument) -> Result<(), StoreError> {
        let json = document.to_json()?;
        let mut tmp_name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        tmp_name.push(format!(".{}.tmp", std::process::id()));
        let tmp_path = self.path.with_file_name(tmp_name);

        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(json.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.sync_all()?;
        drop(tmp);

        fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), bytes = json.len(), "Task store written");
        Ok(())
    }
}

#[async_trait]
impl TaskStore for LocalFileStore {
    async fn list_available(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let filter = filter.clone();
        self.transact(false, move |doc| Ok(doc.available(&filter))).await
    }

    async fn get(&self, task_id: &str) -> Result<TaskEntry, StoreError> {
        let task_id = task_id.to_string();
        self.transact(false, move |doc| {
            doc.find(&task_id).ok_or_else(|| StoreError::task_not_found(task_id))
        })
        .await
    }

    async fn try_claim(&self, task_id: &str, claim: Claim) -> Result<Claim, StoreError> {
        let task_id = task_id.to_string();
        let claim = self
            .transact(true, move |doc| doc.claim(&task_id, claim))
            .await?;
        info!(
            agent_id = %claim.agent_id,
            task_id = %claim.task_id,
            claimed_at = %claim.claimed_at,
            "Claim recorded in local store"
        );
        Ok(claim)
    }

    async fn update_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<Claim, StoreError> {
        let agent_id = agent_id.to_string();
        self.transact(true, move |doc| doc.heartbeat(&agent_id, at)).await
    }

    async fn release(
        &self,
        agent_id: &str,
        outcome: ReleaseOutcome,
        at: DateTime<Utc>,
    ) -> Result<ClaimRecord, StoreError> {
        let agent_id = agent_id.to_string();
        self.transact(true, move |doc| doc.release(&agent_id, outcome, at)).await
    }

    async fn list_active_claims(&self) -> Result<Vec<ClaimRecord>, StoreError> {
        self.transact(false, |doc| Ok(doc.active_claims())).await
    }

    async fn list_terminal_claims(&self) -> Result<Vec<ClaimRecord>, StoreError> {
        self.transact(false, |doc| Ok(doc.terminal_claims())).await
    }

    async fn archive(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let task_id = task_id.to_string();
        self.transact(true, move |doc| doc.archive(&task_id, at).map(|_| ()))
            .await
    }

    async fn archived_count(&self) -> Result<usize, StoreError> {
        self.transact(false, |doc| Ok(doc.archived.items.len())).await
    }

    async fn publish_status(&self, snapshot: &SystemSnapshot) -> Result<(), StoreError> {
        let status =
            serde_json::to_value(snapshot).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.transact(true, move |doc| {
            doc.system_status = Some(status);
            Ok(())
        })
        .await
    }
}
