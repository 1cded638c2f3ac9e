// In-memory issue tracker for exercising the remote task store without GitHub.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::client::IssueTracker;
use super::errors::GitHubError;
use super::types::{IssueQueryState, TrackerComment, TrackerIssue};

#[derive(Debug, Default)]
struct TrackerState {
    issues: BTreeMap<u64, TrackerIssue>,
    comments: BTreeMap<u64, Vec<TrackerComment>>,
    next_issue: u64,
    next_comment: u64,
}

#[derive(Debug)]
pub struct InMemoryTracker {
    identity: String,
    now: Mutex<DateTime<Utc>>,
    state: Mutex<TrackerState>,
    fail_next_comment: AtomicBool,
}

impl InMemoryTracker {
    pub fn new(identity: &str, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.to_string(),
            now: Mutex::new(now),
            state: Mutex::new(TrackerState {
                next_issue: 1,
                next_comment: 1,
                ..TrackerState::default()
            }),
            fail_next_comment: AtomicBool::new(false),
        }
    }

    /// Make the next `add_comment` call fail without posting anything.
    pub fn fail_next_comment(&self) {
        self.fail_next_comment.store(true, Ordering::SeqCst);
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Timestamp stamped on subsequently posted comments.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn create_issue(&self, title: &str, body: &str, labels: &[&str]) -> u64 {
        let created_at = self.now();
        let mut state = self.state();
        let number = state.next_issue;
        state.next_issue += 1;
        state.issues.insert(
            number,
            TrackerIssue {
                number,
                title: title.to_string(),
                body: body.to_string(),
                labels: labels.iter().map(|l| l.to_string()).collect(),
                assignees: Vec::new(),
                open: true,
                created_at,
                closed_at: None,
            },
        );
        number
    }

    pub fn issue(&self, number: u64) -> Option<TrackerIssue> {
        self.state().issues.get(&number).cloned()
    }

    pub fn comments(&self, number: u64) -> Vec<TrackerComment> {
        self.state().comments.get(&number).cloned().unwrap_or_default()
    }

    /// Append a comment as another writer would, with an explicit timestamp.
    pub fn inject_comment(&self, number: u64, author: &str, body: &str, at: DateTime<Utc>) {
        let mut state = self.state();
        let id = state.next_comment;
        state.next_comment += 1;
        state.comments.entry(number).or_default().push(TrackerComment {
            id,
            body: body.to_string(),
            author: author.to_string(),
            created_at: at,
        });
    }

    fn with_issue<R>(
        &self,
        number: u64,
        f: impl FnOnce(&mut TrackerIssue) -> R,
    ) -> Result<R, GitHubError> {
        let mut state = self.state();
        let issue = state
            .issues
            .get_mut(&number)
            .ok_or(GitHubError::IssueNotFound(number))?;
        Ok(f(issue))
    }
}

#[async_trait]
impl IssueTracker for InMemoryTracker {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn list_issues(
        &self,
        labels: &[String],
        state: IssueQueryState,
    ) -> Result<Vec<TrackerIssue>, GitHubError> {
        Ok(self
            .state()
            .issues
            .values()
            .filter(|issue| labels.iter().all(|l| issue.has_label(l)))
            .filter(|issue| match state {
                IssueQueryState::Open => issue.open,
                IssueQueryState::Closed => !issue.open,
                IssueQueryState::All => true,
            })
            .cloned()
            .collect())
    }

    async fn get_issue(&self, number: u64) -> Result<TrackerIssue, GitHubError> {
        self.issue(number).ok_or(GitHubError::IssueNotFound(number))
    }

    async fn set_assignees(&self, number: u64, assignees: &[String]) -> Result<(), GitHubError> {
        self.with_issue(number, |issue| issue.assignees = assignees.to_vec())
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), GitHubError> {
        self.with_issue(number, |issue| {
            for label in labels {
                if !issue.has_label(label) {
                    issue.labels.push(label.clone());
                }
            }
        })
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<(), GitHubError> {
        self.with_issue(number, |issue| issue.labels.retain(|l| l != label))
    }

    async fn close_issue(&self, number: u64) -> Result<(), GitHubError> {
        let now = self.now();
        self.with_issue(number, |issue| {
            issue.open = false;
            issue.closed_at = Some(now);
        })
    }

    async fn update_body(&self, number: u64, body: &str) -> Result<(), GitHubError> {
        self.with_issue(number, |issue| issue.body = body.to_string())
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<TrackerComment, GitHubError> {
        if self.issue(number).is_none() || self.fail_next_comment.swap(false, Ordering::SeqCst) {
            return Err(GitHubError::IssueNotFound(number));
        }
        let at = self.now();
        self.inject_comment(number, &self.identity, body, at);
        self.comments(number)
            .pop()
            .ok_or(GitHubError::IssueNotFound(number))
    }

    async fn list_comments(&self, number: u64) -> Result<Vec<TrackerComment>, GitHubError> {
        if self.issue(number).is_none() {
            return Err(GitHubError::IssueNotFound(number));
        }
        Ok(self.comments(number))
    }
}
