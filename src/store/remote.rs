use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ledger::{ClaimMarker, Ledger, LedgerEntry};
use super::{StoreError, TaskFilter, TaskStore};
use crate::coordination::SystemSnapshot;
use crate::github::{GitHubError, IssueQueryState, IssueTracker, TrackerIssue};
use crate::tasks::{
    Claim, ClaimEvent, ClaimRecord, ClaimStatus, Effort, Priority, ReleaseOutcome, Task, TaskEntry,
    TaskState,
};

pub const TASK_LABEL: &str = "conductor:task";
pub const IN_PROGRESS_LABEL: &str = "conductor:in-progress";
pub const ARCHIVED_LABEL: &str = "conductor:archived";
pub const STATUS_LABEL: &str = "conductor:status";
pub const SKILL_PREFIX: &str = "skill:";
pub const EFFORT_PREFIX: &str = "effort:";
pub const LOCK_PREFIX: &str = "lock:";

/// Agent id given to in-progress issues that carry no readable claim.
const ORPHAN_PREFIX: &str = "orphan-";

/// Task store over tracker issues. Claims are assignment plus an in-progress
/// label, with the claim ledger kept in issue comments.
///
/// There is no conditional write on the tracker, so claiming is check, write,
/// then re-read: a claimant that does not win the ledger arbitration backs off.
pub struct GitHubStore {
    tracker: Arc<dyn IssueTracker>,
    scan_depth: usize,
}

impl GitHubStore {
    pub fn new(tracker: Arc<dyn IssueTracker>, scan_depth: usize) -> Self {
        Self {
            tracker,
            scan_depth: scan_depth.max(1),
        }
    }

    async fn issue(&self, task_id: &str) -> Result<TrackerIssue, StoreError> {
        let number = task_id
            .trim_start_matches('#')
            .parse::<u64>()
            .map_err(|_| StoreError::task_not_found(task_id))?;
        let issue = self
            .tracker
            .get_issue(number)
            .await
            .map_err(|e| not_found_as_task(task_id, e))?;
        if !issue.has_label(TASK_LABEL) {
            return Err(StoreError::task_not_found(task_id));
        }
        Ok(issue)
    }

    async fn ledger(&self, number: u64) -> Result<Ledger, StoreError> {
        let comments = self.tracker.list_comments(number).await?;
        Ok(Ledger::from_comments(&comments, self.scan_depth))
    }

    async fn active_record(&self, issue: &TrackerIssue) -> Result<ClaimRecord, StoreError> {
        let task = issue_to_task(issue);
        let claim = self
            .ledger(issue.number)
            .await?
            .active_claim(&task.id)
            .unwrap_or_else(|| orphan_claim(issue, &task));
        Ok(ClaimRecord { claim, task })
    }

    async fn active_records(&self) -> Result<Vec<(u64, ClaimRecord)>, StoreError> {
        let labels = [TASK_LABEL.to_string(), IN_PROGRESS_LABEL.to_string()];
        let issues = self.tracker.list_issues(&labels, IssueQueryState::Open).await?;
        let mut records = Vec::with_capacity(issues.len());
        for issue in issues {
            let record = self.active_record(&issue).await?;
            records.push((issue.number, record));
        }
        Ok(records)
    }

    async fn find_claim(&self, agent_id: &str) -> Result<(u64, ClaimRecord), StoreError> {
        self.active_records()
            .await?
            .into_iter()
            .find(|(_, record)| record.claim.agent_id == agent_id)
            .ok_or_else(|| StoreError::agent_not_found(agent_id))
    }

    async fn post(&self, number: u64, entry: &LedgerEntry) -> Result<DateTime<Utc>, StoreError> {
        let comment = self.tracker.add_comment(number, &entry.render()?).await?;
        Ok(comment.created_at)
    }

    /// Assign, label, post the claim entry, then re-read the ledger to see
    /// who won. Every reader derives the same winner.
    async fn write_claim(&self, number: u64, claim: &Claim) -> Result<Verification, FailedWrite> {
        self.tracker
            .set_assignees(number, &[self.tracker.identity()])
            .await
            .map_err(|e| FailedWrite::before_post(e.into()))?;
        self.tracker
            .add_labels(number, &[IN_PROGRESS_LABEL.to_string()])
            .await
            .map_err(|e| FailedWrite::before_post(e.into()))?;
        // A failed post may still have landed, so treat it as posted.
        let posted_at = self
            .post(number, &LedgerEntry::Claim(ClaimMarker::from(claim)))
            .await
            .map_err(FailedWrite::after_post)?;

        let ledger = self.ledger(number).await.map_err(FailedWrite::after_post)?;
        Ok(match ledger.winner() {
            Some(winner) if winner == claim.agent_id => Verification::Won { posted_at },
            other => Verification::Lost {
                winner: other.map(str::to_string),
            },
        })
    }

    /// Undo a claim that failed part way. The claim entry is withdrawn and the
    /// assignment and label are removed, unless another claimant now holds the
    /// issue or the withdrawal could not be recorded; the stale sweep clears
    /// what is left in those cases. Returns the error to surface.
    async fn roll_back(&self, number: u64, claim: &Claim, posted: bool, error: StoreError) -> StoreError {
        warn!(
            agent_id = %claim.agent_id,
            task_id = %claim.task_id,
            issue = number,
            error = %error,
            "Claim failed part way, rolling back"
        );

        let withdrawn = if posted {
            match self.post(number, &LedgerEntry::withdrawal(&claim.agent_id)).await {
                Ok(_) => true,
                Err(err) => {
                    warn!(agent_id = %claim.agent_id, error = %err, "Failed to record claim withdrawal");
                    false
                }
            }
        } else {
            true
        };

        let held_by_other = match self.ledger(number).await {
            Ok(ledger) => ledger.winner().is_some_and(|winner| winner != claim.agent_id),
            Err(err) => {
                warn!(issue = number, error = %err, "Could not re-read ledger during rollback");
                true
            }
        };

        if withdrawn && !held_by_other {
            let unassigned = self.tracker.set_assignees(number, &[]).await;
            let unlabelled = self.tracker.remove_label(number, IN_PROGRESS_LABEL).await;
            if let Err(err) = unassigned.and(unlabelled) {
                warn!(issue = number, error = %err, "Rollback left the issue marked in progress");
            }
        }

        StoreError::ClaimRolledBack {
            task_id: claim.task_id.clone(),
            reason: error.to_string(),
        }
    }
}

enum Verification {
    Won { posted_at: DateTime<Utc> },
    Lost { winner: Option<String> },
}

/// A claim write that failed after touching the issue.
struct FailedWrite {
    error: StoreError,
    posted: bool,
}

impl FailedWrite {
    fn before_post(error: StoreError) -> Self {
        Self { error, posted: false }
    }

    fn after_post(error: StoreError) -> Self {
        Self { error, posted: true }
    }
}

fn not_found_as_task(task_id: &str, err: GitHubError) -> StoreError {
    if err.is_not_found() {
        StoreError::task_not_found(task_id)
    } else {
        StoreError::GitHub(err)
    }
}

fn issue_to_task(issue: &TrackerIssue) -> Task {
    Task {
        id: issue.number.to_string(),
        title: issue.title.clone(),
        description: issue.body.clone(),
        required_skills: issue.label_values(SKILL_PREFIX).map(str::to_string).collect(),
        estimated_effort: issue
            .label_values(EFFORT_PREFIX)
            .find_map(|value| value.parse::<Effort>().ok())
            .unwrap_or_default(),
        priority: Priority::from_labels(issue.labels.as_slice()),
        created_at: issue.created_at,
        labels: issue.labels.iter().cloned().collect(),
        locked_resources: issue.label_values(LOCK_PREFIX).map(str::to_string).collect(),
        extra: Default::default(),
    }
}

/// In-progress issue whose ledger has no live claim. It has no activity
/// marker, so the next sweep reclaims it.
fn orphan_claim(issue: &TrackerIssue, task: &Task) -> Claim {
    Claim {
        agent_id: format!("{ORPHAN_PREFIX}{}", issue.number),
        role: "unknown".to_string(),
        task_id: task.id.clone(),
        status: ClaimStatus::InProgress,
        claimed_at: issue.created_at,
        heartbeat: None,
        locked_resources: task.locked_resources.clone(),
        host: None,
        completed_at: None,
        abandonment_reason: None,
        extra: Default::default(),
    }
}

fn render_status(snapshot: &SystemSnapshot) -> Result<String, StoreError> {
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(format!(
        "## Conductor status\n\nHealth: **{}** ({:.2})\nUpdated: {}\n\n```json\n{}\n```\n",
        snapshot.health.grade,
        snapshot.health.score,
        snapshot.taken_at.to_rfc3339(),
        json
    ))
}

#[async_trait]
impl TaskStore for GitHubStore {
    async fn list_available(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let issues = self
            .tracker
            .list_issues(&[TASK_LABEL.to_string()], IssueQueryState::Open)
            .await?;
        Ok(issues
            .iter()
            .filter(|issue| !issue.has_label(IN_PROGRESS_LABEL) && !issue.has_label(ARCHIVED_LABEL))
            .filter(|issue| issue.assignees.is_empty())
            .map(issue_to_task)
            .filter(|task| filter.matches(task))
            .collect())
    }

    async fn get(&self, task_id: &str) -> Result<TaskEntry, StoreError> {
        let issue = self.issue(task_id).await?;
        let task = issue_to_task(&issue);

        if !issue.open || issue.has_label(ARCHIVED_LABEL) {
            let claim = self.ledger(issue.number).await?.completed_claim(&task.id);
            return Ok(TaskEntry {
                task,
                state: TaskState::Archived,
                claim,
            });
        }
        if issue.has_label(IN_PROGRESS_LABEL) {
            let record = self.active_record(&issue).await?;
            return Ok(TaskEntry {
                task: record.task,
                state: TaskState::Claimed,
                claim: Some(record.claim),
            });
        }
        Ok(TaskEntry {
            task,
            state: TaskState::Available,
            claim: None,
        })
    }

    async fn try_claim(&self, task_id: &str, claim: Claim) -> Result<Claim, StoreError> {
        let issue = self.issue(task_id).await?;
        if !issue.open || issue.has_label(ARCHIVED_LABEL) {
            return Err(StoreError::task_not_found(task_id));
        }
        if issue.has_label(IN_PROGRESS_LABEL) || !issue.assignees.is_empty() {
            return Err(StoreError::ClaimConflict {
                task_id: task_id.to_string(),
                holder: issue.assignees.first().cloned(),
            });
        }

        let task = issue_to_task(&issue);
        if !task.locked_resources.is_empty() {
            for (_, record) in self.active_records().await? {
                if record.claim.conflicts_with(&task.locked_resources) {
                    return Err(StoreError::ResourceConflict {
                        task_id: task.id.clone(),
                        holder: record.claim.agent_id.clone(),
                        resources: record
                            .claim
                            .locked_resources
                            .intersection(&task.locked_resources)
                            .cloned()
                            .collect(),
                    });
                }
            }
        }

        let mut claim = claim;
        claim.task_id = task.id.clone();
        claim.locked_resources = task.locked_resources.clone();

        let number = issue.number;
        match self.write_claim(number, &claim).await {
            Ok(Verification::Won { posted_at }) => {
                claim.heartbeat = Some(posted_at);
                info!(
                    agent_id = %claim.agent_id,
                    task_id = %claim.task_id,
                    issue = number,
                    claimed_at = %posted_at,
                    "Claim verified on issue"
                );
                Ok(claim)
            }
            Ok(Verification::Lost { winner: Some(winner) }) => {
                warn!(
                    agent_id = %claim.agent_id,
                    task_id = %claim.task_id,
                    winner = %winner,
                    "Lost claim arbitration, backing off"
                );
                if let Err(err) = self.post(number, &LedgerEntry::withdrawal(&claim.agent_id)).await {
                    warn!(agent_id = %claim.agent_id, error = %err, "Failed to record claim withdrawal");
                }
                Err(StoreError::ClaimConflict {
                    task_id: claim.task_id,
                    holder: Some(winner),
                })
            }
            Ok(Verification::Lost { winner: None }) => {
                let error = StoreError::MalformedRecord(format!(
                    "claim entry for {} not visible on issue #{number}",
                    claim.agent_id
                ));
                Err(self.roll_back(number, &claim, true, error).await)
            }
            Err(failed) => Err(self.roll_back(number, &claim, failed.posted, failed.error).await),
        }
    }

    /// The tracker stamps activity with the comment's own time; `at` only
    /// matters to the local backend.
    async fn update_heartbeat(&self, agent_id: &str, _at: DateTime<Utc>) -> Result<Claim, StoreError> {
        let (number, record) = self.find_claim(agent_id).await?;
        let mut claim = record.claim;
        claim.status = claim.status.apply(ClaimEvent::Heartbeat)?;

        let anchor = self.ledger(number).await?.claim_posted_at(agent_id);
        let marker = ClaimMarker::from(&claim).anchored_at(anchor);
        let posted_at = self.post(number, &LedgerEntry::Heartbeat(marker)).await?;
        claim.heartbeat = Some(posted_at);
        debug!(agent_id = %agent_id, issue = number, "Heartbeat posted");
        Ok(claim)
    }

    async fn release(
        &self,
        agent_id: &str,
        outcome: ReleaseOutcome,
        at: DateTime<Utc>,
    ) -> Result<ClaimRecord, StoreError> {
        let (number, mut record) = self.find_claim(agent_id).await?;

        if let ReleaseOutcome::Reclaimed { observed_heartbeat } = outcome {
            if record.claim.heartbeat > observed_heartbeat {
                return Err(StoreError::ClaimConflict {
                    task_id: record.claim.task_id,
                    holder: Some(agent_id.to_string()),
                });
            }
        }

        record.claim.finish(outcome.event(), at)?;
        record.claim.abandonment_reason = outcome.abandon_reason();

        let entry = match outcome.abandon_reason() {
            None => LedgerEntry::Complete {
                agent_id: agent_id.to_string(),
            },
            Some(reason) => LedgerEntry::Release {
                agent_id: agent_id.to_string(),
                reason,
            },
        };
        self.post(number, &entry).await?;
        self.tracker.remove_label(number, IN_PROGRESS_LABEL).await?;

        if matches!(outcome, ReleaseOutcome::Completed) {
            self.tracker.close_issue(number).await?;
        } else {
            self.tracker.set_assignees(number, &[]).await?;
        }
        Ok(record)
    }

    async fn list_active_claims(&self) -> Result<Vec<ClaimRecord>, StoreError> {
        Ok(self
            .active_records()
            .await?
            .into_iter()
            .map(|(_, record)| record)
            .collect())
    }

    async fn list_terminal_claims(&self) -> Result<Vec<ClaimRecord>, StoreError> {
        let issues = self
            .tracker
            .list_issues(&[TASK_LABEL.to_string()], IssueQueryState::Closed)
            .await?;

        let mut records = Vec::new();
        for issue in issues.iter().filter(|issue| !issue.has_label(ARCHIVED_LABEL)) {
            let task = issue_to_task(issue);
            let claim = match self.ledger(issue.number).await?.completed_claim(&task.id) {
                Some(claim) => claim,
                None => {
                    let mut claim = orphan_claim(issue, &task);
                    claim.status = ClaimStatus::Completed;
                    claim.completed_at = issue.closed_at;
                    claim
                }
            };
            records.push(ClaimRecord { claim, task });
        }
        Ok(records)
    }

    async fn archive(&self, task_id: &str, _at: DateTime<Utc>) -> Result<(), StoreError> {
        let issue = self.issue(task_id).await?;
        if issue.open || issue.has_label(ARCHIVED_LABEL) {
            return Err(StoreError::NotFound {
                kind: "terminal record for task",
                id: task_id.to_string(),
            });
        }
        self.tracker
            .add_labels(issue.number, &[ARCHIVED_LABEL.to_string()])
            .await?;
        Ok(())
    }

    async fn archived_count(&self) -> Result<usize, StoreError> {
        let labels = [TASK_LABEL.to_string(), ARCHIVED_LABEL.to_string()];
        Ok(self
            .tracker
            .list_issues(&labels, IssueQueryState::All)
            .await?
            .len())
    }

    async fn publish_status(&self, snapshot: &SystemSnapshot) -> Result<(), StoreError> {
        let issues = self
            .tracker
            .list_issues(&[STATUS_LABEL.to_string()], IssueQueryState::Open)
            .await?;
        match issues.first() {
            Some(issue) => {
                self.tracker
                    .update_body(issue.number, &render_status(snapshot)?)
                    .await?;
                debug!(issue = issue.number, "Status issue updated");
            }
            None => debug!("No open status issue, skipping status publish"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::mocks::InMemoryTracker;
    use crate::tasks::AbandonReason;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn setup() -> (Arc<InMemoryTracker>, GitHubStore) {
        let tracker = Arc::new(InMemoryTracker::new("conductor-bot", t0()));
        let store = GitHubStore::new(tracker.clone(), 20);
        (tracker, store)
    }

    fn claim(agent: &str, task: &Task) -> Claim {
        Claim::new(agent, "security", task, t0())
    }

    #[tokio::test]
    async fn test_labels_map_to_task_fields() {
        let (tracker, store) = setup();
        tracker.create_issue(
            "Audit token handling",
            "Check JWT expiry",
            &[TASK_LABEL, "skill:security", "effort:large", "priority:critical", "lock:src/auth.rs"],
        );

        let tasks = store.list_available(&TaskFilter::default()).await.unwrap();
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.id, "1");
        assert!(task.required_skills.contains("security"));
        assert_eq!(task.estimated_effort, Effort::Large);
        assert_eq!(task.priority, Priority::Critical);
        assert!(task.locked_resources.contains("src/auth.rs"));
    }

    #[tokio::test]
    async fn test_claim_assigns_labels_and_records_ledger() {
        let (tracker, store) = setup();
        let n = tracker.create_issue("Fix login", "", &[TASK_LABEL]);
        let task = store.get("1").await.unwrap().task;

        let claimed = store.try_claim("1", claim("security_aaaa", &task)).await.unwrap();
        assert_eq!(claimed.heartbeat, Some(t0()));

        let issue = tracker.issue(n).unwrap();
        assert!(issue.has_label(IN_PROGRESS_LABEL));
        assert_eq!(issue.assignees, vec!["conductor-bot".to_string()]);
        assert!(store.list_available(&TaskFilter::default()).await.unwrap().is_empty());

        let active = store.list_active_claims().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].claim.agent_id, "security_aaaa");

        let err = store.try_claim("1", claim("security_bbbb", &task)).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_second_writer_loses_verification() {
        let (tracker, store) = setup();
        let n = tracker.create_issue("Fix login", "", &[TASK_LABEL]);
        let task = store.get("1").await.unwrap().task;

        // Another agent's claim landed first but its labels have not been applied yet.
        let rival = LedgerEntry::Claim(ClaimMarker::from(&claim("security_zzzz", &task)));
        tracker.inject_comment(n, "other-bot", &rival.render().unwrap(), t0() - Duration::seconds(1));

        let err = store.try_claim("1", claim("security_aaaa", &task)).await.unwrap_err();
        match err {
            StoreError::ClaimConflict { holder, .. } => assert_eq!(holder.as_deref(), Some("security_zzzz")),
            other => panic!("expected conflict, got {other:?}"),
        }

        // The loser withdraws; the winner keeps the issue
        let last = tracker.comments(n).pop().unwrap();
        assert_eq!(
            LedgerEntry::parse(&last.body),
            Some(LedgerEntry::Release {
                agent_id: "security_aaaa".into(),
                reason: AbandonReason::VerificationLost,
            })
        );
        assert!(tracker.issue(n).unwrap().has_label(IN_PROGRESS_LABEL));
        let active = store.list_active_claims().await.unwrap();
        assert_eq!(active[0].claim.agent_id, "security_zzzz");
    }

    #[tokio::test]
    async fn test_live_claim_outlasts_scan_window() {
        let (tracker, store) = setup();
        let n = tracker.create_issue("Fix login", "", &[TASK_LABEL]);
        let task = store.get("1").await.unwrap().task;
        store.try_claim("1", claim("security_winner", &task)).await.unwrap();

        // A rival whose claim landed a second later and never withdrew
        let rival = LedgerEntry::Claim(ClaimMarker::from(&claim("security_rival", &task)));
        tracker.inject_comment(n, "other-bot", &rival.render().unwrap(), t0() + Duration::seconds(1));

        for _ in 0..25 {
            tracker.advance(Duration::minutes(5));
            let beat = store.update_heartbeat("security_winner", t0()).await.unwrap();
            assert_eq!(beat.heartbeat, Some(tracker.now()));

            let active = store.list_active_claims().await.unwrap();
            assert_eq!(active.len(), 1);
            assert_eq!(active[0].claim.agent_id, "security_winner");
            assert_eq!(active[0].claim.heartbeat, Some(tracker.now()));
        }
        assert!(tracker.comments(n).len() > 20);
    }

    #[tokio::test]
    async fn test_failed_claim_comment_rolls_back_issue() {
        let (tracker, store) = setup();
        let n = tracker.create_issue("Fix login", "", &[TASK_LABEL]);
        let task = store.get("1").await.unwrap().task;

        tracker.fail_next_comment();
        let err = store.try_claim("1", claim("security_aaaa", &task)).await.unwrap_err();
        assert!(matches!(err, StoreError::ClaimRolledBack { .. }));
        assert!(!err.is_transient());

        let issue = tracker.issue(n).unwrap();
        assert!(!issue.has_label(IN_PROGRESS_LABEL));
        assert!(issue.assignees.is_empty());
        assert_eq!(store.get("1").await.unwrap().state, TaskState::Available);
        assert!(store.list_active_claims().await.unwrap().is_empty());

        // The next claimant is not blocked by the failed attempt
        tracker.advance(Duration::minutes(1));
        let again = store.try_claim("1", claim("security_bbbb", &task)).await.unwrap();
        assert_eq!(again.agent_id, "security_bbbb");
    }

    #[tokio::test]
    async fn test_heartbeat_and_complete_close_issue() {
        let (tracker, store) = setup();
        let n = tracker.create_issue("Fix login", "", &[TASK_LABEL]);
        let task = store.get("1").await.unwrap().task;
        store.try_claim("1", claim("security_aaaa", &task)).await.unwrap();

        tracker.advance(Duration::minutes(5));
        let beat = store.update_heartbeat("security_aaaa", t0()).await.unwrap();
        assert_eq!(beat.status, ClaimStatus::InProgress);
        assert_eq!(beat.heartbeat, Some(t0() + Duration::minutes(5)));

        let record = store
            .release("security_aaaa", ReleaseOutcome::Completed, t0() + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(record.claim.status, ClaimStatus::Completed);

        let issue = tracker.issue(n).unwrap();
        assert!(!issue.open);
        assert!(!issue.has_label(IN_PROGRESS_LABEL));

        let terminal = store.list_terminal_claims().await.unwrap();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].claim.agent_id, "security_aaaa");

        store.archive("1", t0()).await.unwrap();
        assert_eq!(store.archived_count().await.unwrap(), 1);
        assert!(store.list_terminal_claims().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_agent_heartbeat_is_not_found() {
        let (_tracker, store) = setup();
        let err = store.update_heartbeat("dev_nobody", t0()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_orphaned_in_progress_issue_is_reclaimable() {
        let (tracker, store) = setup();
        let n = tracker.create_issue("Half done", "", &[TASK_LABEL, IN_PROGRESS_LABEL]);

        let active = store.list_active_claims().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].claim.agent_id, format!("orphan-{n}"));
        assert_eq!(active[0].claim.heartbeat, None);

        store
            .release(
                &format!("orphan-{n}"),
                ReleaseOutcome::Reclaimed {
                    observed_heartbeat: None,
                },
                t0(),
            )
            .await
            .unwrap();
        assert_eq!(store.list_available(&TaskFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_reopens_pool() {
        let (tracker, store) = setup();
        let n = tracker.create_issue("Fix login", "", &[TASK_LABEL]);
        let task = store.get("1").await.unwrap().task;
        store.try_claim("1", claim("security_aaaa", &task)).await.unwrap();

        store
            .release(
                "security_aaaa",
                ReleaseOutcome::Abandoned {
                    reason: AbandonReason::Released,
                },
                t0(),
            )
            .await
            .unwrap();

        let issue = tracker.issue(n).unwrap();
        assert!(issue.open);
        assert!(issue.assignees.is_empty());
        assert_eq!(store.get("1").await.unwrap().state, TaskState::Available);

        // A fresh claim starts a new ledger session
        tracker.advance(Duration::minutes(1));
        let again = store.try_claim("1", claim("security_bbbb", &task)).await.unwrap();
        assert_eq!(again.agent_id, "security_bbbb");
    }

    #[tokio::test]
    async fn test_non_numeric_id_is_not_found() {
        let (_tracker, store) = setup();
        assert!(matches!(store.get("abc").await, Err(StoreError::NotFound { .. })));
        assert!(matches!(store.get("99").await, Err(StoreError::NotFound { .. })));
    }
}
