pub mod document;
pub mod errors;
pub mod ledger;
pub mod local;
pub mod remote;
pub mod retry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ConductorConfig;
use crate::coordination::SystemSnapshot;
use crate::github::GitHubClient;
use crate::tasks::{Claim, ClaimRecord, ReleaseOutcome, Task, TaskEntry};

pub use errors::StoreError;
pub use local::LocalFileStore;
pub use remote::GitHubStore;
pub use retry::RetryPolicy;

/// Persistence for the task pool and its claims.
///
/// Both backends implement the same contract; everything above this trait is
/// backend-agnostic.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Unclaimed tasks in pool order.
    async fn list_available(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    async fn get(&self, task_id: &str) -> Result<TaskEntry, StoreError>;

    /// Atomically make `claim` the task's exclusive owner. Fails with
    /// `ClaimConflict` if another claim holds the task and `ResourceConflict`
    /// if its locked resources overlap a live claim.
    async fn try_claim(&self, task_id: &str, claim: Claim) -> Result<Claim, StoreError>;

    /// `NotFound` means the claim is gone and the agent must stop.
    async fn update_heartbeat(&self, agent_id: &str, at: DateTime<Utc>) -> Result<Claim, StoreError>;

    async fn release(
        &self,
        agent_id: &str,
        outcome: ReleaseOutcome,
        at: DateTime<Utc>,
    ) -> Result<ClaimRecord, StoreError>;

    async fn list_active_claims(&self) -> Result<Vec<ClaimRecord>, StoreError>;

    /// Completed or abandoned claims not yet archived.
    async fn list_terminal_claims(&self) -> Result<Vec<ClaimRecord>, StoreError>;

    async fn archive(&self, task_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn archived_count(&self) -> Result<usize, StoreError>;

    /// Mirror a snapshot into the store's status block. Observational only.
    async fn publish_status(&self, snapshot: &SystemSnapshot) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub include_blocked: bool,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        self.include_blocked || !task.is_blocked()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Local,
    Github,
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" | "file" => Ok(Backend::Local),
            "github" | "remote" => Ok(Backend::Github),
            other => Err(format!("unknown backend '{other}' (expected local or github)")),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => f.write_str("local"),
            Backend::Github => f.write_str("github"),
        }
    }
}

/// Build the backend selected in `config`.
pub async fn open_store(config: &ConductorConfig) -> Result<Arc<dyn TaskStore>, StoreError> {
    match config.store.backend {
        Backend::Local => Ok(Arc::new(LocalFileStore::new(
            &config.store.state_file,
            Duration::from_millis(config.store.lock_timeout_ms),
        ))),
        Backend::Github => {
            let client = GitHubClient::connect(&config.github).await?;
            Ok(Arc::new(GitHubStore::new(
                Arc::new(client),
                config.github.comment_scan_depth,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::BLOCKED_LABEL;

    #[test]
    fn test_filter_hides_blocked_by_default() {
        let blocked = Task::new("1", "waiting", Utc::now()).with_label(BLOCKED_LABEL);
        assert!(!TaskFilter::default().matches(&blocked));
        assert!(TaskFilter {
            include_blocked: true
        }
        .matches(&blocked));
        assert!(TaskFilter::default().matches(&Task::new("2", "ready", Utc::now())));
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("github".parse::<Backend>().unwrap(), Backend::Github);
        assert_eq!("LOCAL".parse::<Backend>().unwrap(), Backend::Local);
        assert!("sqlite".parse::<Backend>().is_err());
    }

    #[tokio::test]
    async fn test_open_store_defaults_to_local() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = ConductorConfig::default();
        config.store.state_file = dir.path().join("state.json");

        let store = open_store(&config).await.unwrap();
        assert!(store.list_available(&TaskFilter::default()).await.unwrap().is_empty());
    }
}
