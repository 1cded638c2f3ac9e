use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::liveness::{LivenessMonitor, StaleClaimView};
use crate::clock::Clock;
use crate::observability::OperationTimer;
use crate::store::{RetryPolicy, StoreError, TaskStore};
use crate::tasks::ReleaseOutcome;

/// Emitted for every claim the sweep takes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimNotice {
    pub agent_id: String,
    pub task_id: String,
    pub task_title: String,
    pub last_activity: Option<DateTime<Utc>>,
    pub reclaimed_at: DateTime<Utc>,
}

/// A stale claim the sweep left alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedReclaim {
    pub agent_id: String,
    pub task_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dry_run: bool,
    pub examined: usize,
    pub stale: Vec<StaleClaimView>,
    pub reclaimed: Vec<ReclaimNotice>,
    pub skipped: Vec<SkippedReclaim>,
}

/// Reclaims claims whose heartbeat exceeded the timeout and returns their
/// tasks to the pool.
pub struct ReclaimProcessor {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    monitor: LivenessMonitor,
    retry: RetryPolicy,
}

impl ReclaimProcessor {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, monitor: LivenessMonitor) -> Self {
        Self {
            store,
            clock,
            monitor,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// One pass over active claims. A claim whose heartbeat advanced after it
    /// was judged stale is skipped, never reclaimed.
    pub async fn sweep(&self, dry_run: bool) -> Result<SweepReport, StoreError> {
        let timer = OperationTimer::new("sweep_stale");
        let claims = self
            .retry
            .run("list_active_claims", || self.store.list_active_claims())
            .await?;
        let now = self.clock.now();
        let liveness = self.monitor.classify(claims, now);

        let mut report = SweepReport {
            dry_run,
            examined: liveness.total(),
            stale: liveness.stale.iter().map(StaleClaimView::from).collect(),
            ..SweepReport::default()
        };

        if dry_run {
            info!(
                stale = report.stale.len(),
                examined = report.examined,
                "Dry run: stale claims left in place"
            );
            timer.finish();
            return Ok(report);
        }

        for assessment in liveness.stale {
            let claim = &assessment.record.claim;
            let outcome = ReleaseOutcome::Reclaimed {
                observed_heartbeat: assessment.last_activity,
            };
            let released = self
                .retry
                .run("reclaim", || self.store.release(&claim.agent_id, outcome, now))
                .await;

            match released {
                Ok(record) => {
                    let notice = ReclaimNotice {
                        agent_id: record.claim.agent_id.clone(),
                        task_id: record.task.id.clone(),
                        task_title: record.task.title.clone(),
                        last_activity: assessment.last_activity,
                        reclaimed_at: now,
                    };
                    info!(
                        agent_id = %notice.agent_id,
                        task_id = %notice.task_id,
                        last_activity = ?notice.last_activity,
                        "Reclaimed stale claim"
                    );
                    report.reclaimed.push(notice);
                }
                Err(err) if err.is_conflict() || matches!(err, StoreError::NotFound { .. }) => {
                    debug!(
                        agent_id = %claim.agent_id,
                        task_id = %claim.task_id,
                        error = %err,
                        "Stale claim changed before reclaim, skipping"
                    );
                    report.skipped.push(SkippedReclaim {
                        agent_id: claim.agent_id.clone(),
                        task_id: claim.task_id.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        timer.finish();
        Ok(report)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub dry_run: bool,
    pub cutoff: DateTime<Utc>,
    pub examined: usize,
    pub archived: Vec<String>,
    /// Tasks kept because a record carries no completion time.
    pub undated: Vec<String>,
}

/// Moves terminal records older than the retention window out of the live
/// collections.
pub struct ArchiveSweeper {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl ArchiveSweeper {
    pub fn new(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>, retention: Duration) -> Self {
        Self {
            store,
            clock,
            retention,
        }
    }

    pub async fn sweep(&self, dry_run: bool) -> Result<ArchiveReport, StoreError> {
        let timer = OperationTimer::new("archive");
        let now = self.clock.now();
        // A retention reaching past the representable range archives nothing.
        let cutoff = now
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let terminal = self.store.list_terminal_claims().await?;

        // Latest completion per task; `None` once any record lacks a time.
        let mut latest: BTreeMap<String, Option<DateTime<Utc>>> = BTreeMap::new();
        for record in &terminal {
            let entry = latest
                .entry(record.task.id.clone())
                .or_insert(record.claim.completed_at);
            *entry = match (*entry, record.claim.completed_at) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
        }

        let mut report = ArchiveReport {
            dry_run,
            cutoff,
            examined: terminal.len(),
            archived: Vec::new(),
            undated: Vec::new(),
        };

        for (task_id, completed_at) in latest {
            match completed_at {
                None => {
                    warn!(task_id = %task_id, "Terminal record has no completion time, keeping it");
                    report.undated.push(task_id);
                }
                Some(at) if at < cutoff => {
                    if !dry_run {
                        self.store.archive(&task_id, now).await?;
                        info!(task_id = %task_id, completed_at = %at, "Archived finished task");
                    }
                    report.archived.push(task_id);
                }
                Some(_) => {}
            }
        }

        timer.finish();
        Ok(report)
    }
}
