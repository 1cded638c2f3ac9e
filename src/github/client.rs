use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use octocrab::models::issues::{Comment, Issue};
use octocrab::models::IssueState;
use octocrab::params::State;
use octocrab::Octocrab;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::{debug, info};

use super::errors::GitHubError;
use super::types::{IssueQueryState, TrackerComment, TrackerIssue};
use crate::config::GitHubConfig;

/// The issue-tracker operations the remote task store is built on.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Login that claimed issues are assigned to.
    fn identity(&self) -> String;

    /// Issues carrying every label in `labels`. Pull requests are excluded.
    async fn list_issues(
        &self,
        labels: &[String],
        state: IssueQueryState,
    ) -> Result<Vec<TrackerIssue>, GitHubError>;

    async fn get_issue(&self, number: u64) -> Result<TrackerIssue, GitHubError>;

    /// Replace the issue's assignees. An empty slice unassigns everyone.
    async fn set_assignees(&self, number: u64, assignees: &[String]) -> Result<(), GitHubError>;

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), GitHubError>;

    /// Removing a label the issue does not carry is not an error.
    async fn remove_label(&self, number: u64, label: &str) -> Result<(), GitHubError>;

    async fn close_issue(&self, number: u64) -> Result<(), GitHubError>;

    async fn update_body(&self, number: u64, body: &str) -> Result<(), GitHubError>;

    async fn add_comment(&self, number: u64, body: &str) -> Result<TrackerComment, GitHubError>;

    /// Every comment on the issue, oldest first.
    async fn list_comments(&self, number: u64) -> Result<Vec<TrackerComment>, GitHubError>;
}

/// Octocrab-backed tracker with a client-side request rate limit.
#[derive(Debug)]
pub struct GitHubClient {
    octocrab: Octocrab,
    owner: String,
    repo: String,
    identity: String,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl GitHubClient {
    pub async fn connect(config: &GitHubConfig) -> Result<Self, GitHubError> {
        let token = config
            .token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| GitHubError::TokenNotFound("no token configured".to_string()))?;
        let owner = config.owner.clone().filter(|o| !o.is_empty());
        let repo = config.repo.clone().filter(|r| !r.is_empty());
        let (owner, repo) = match (owner, repo) {
            (Some(owner), Some(repo)) => (owner, repo),
            _ => {
                return Err(GitHubError::ConfigNotFound(
                    "owner and repo are required for the github backend".to_string(),
                ))
            }
        };

        let octocrab = Octocrab::builder().personal_token(token).build()?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        let identity = match config.assignee.clone().filter(|a| !a.is_empty()) {
            Some(login) => login,
            None => {
                rate_limiter.until_ready().await;
                octocrab.current().user().await?.login
            }
        };

        info!(owner = %owner, repo = %repo, identity = %identity, "Connected to GitHub");
        Ok(Self {
            octocrab,
            owner,
            repo,
            identity,
            rate_limiter,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    async fn throttle(&self) {
        self.rate_limiter.until_ready().await;
    }
}

fn to_tracker_issue(issue: Issue) -> TrackerIssue {
    TrackerIssue {
        number: issue.number,
        title: issue.title,
        body: issue.body.unwrap_or_default(),
        labels: issue.labels.into_iter().map(|l| l.name).collect(),
        assignees: issue.assignees.into_iter().map(|a| a.login).collect(),
        open: issue.state == IssueState::Open,
        created_at: issue.created_at,
        closed_at: issue.closed_at,
    }
}

fn to_tracker_comment(comment: Comment) -> TrackerComment {
    TrackerComment {
        id: comment.id.0,
        body: comment.body.unwrap_or_default(),
        author: comment.user.login,
        created_at: comment.created_at,
    }
}

fn not_found_as(number: u64, err: GitHubError) -> GitHubError {
    if err.status_code() == Some(404) {
        GitHubError::IssueNotFound(number)
    } else {
        err
    }
}

#[async_trait]
impl IssueTracker for GitHubClient {
    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn list_issues(
        &self,
        labels: &[String],
        state: IssueQueryState,
    ) -> Result<Vec<TrackerIssue>, GitHubError> {
        let state = match state {
            IssueQueryState::Open => State::Open,
            IssueQueryState::Closed => State::Closed,
            IssueQueryState::All => State::All,
        };
        self.throttle().await;
        let first_page = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .list()
            .labels(labels)
            .state(state)
            .per_page(100)
            .send()
            .await?;
        let issues = self.octocrab.all_pages(first_page).await?;
        debug!(count = issues.len(), labels = ?labels, "Fetched issues");

        Ok(issues
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .map(to_tracker_issue)
            .collect())
    }

    async fn get_issue(&self, number: u64) -> Result<TrackerIssue, GitHubError> {
        self.throttle().await;
        let issue = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .get(number)
            .await
            .map_err(|e| not_found_as(number, e.into()))?;
        Ok(to_tracker_issue(issue))
    }

    async fn set_assignees(&self, number: u64, assignees: &[String]) -> Result<(), GitHubError> {
        self.throttle().await;
        self.octocrab
            .issues(&self.owner, &self.repo)
            .update(number)
            .assignees(assignees)
            .send()
            .await
            .map_err(|e| not_found_as(number, e.into()))?;
        Ok(())
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<(), GitHubError> {
        self.throttle().await;
        self.octocrab
            .issues(&self.owner, &self.repo)
            .add_labels(number, labels)
            .await
            .map_err(|e| not_found_as(number, e.into()))?;
        Ok(())
    }

    async fn remove_label(&self, number: u64, label: &str) -> Result<(), GitHubError> {
        self.throttle().await;
        match self
            .octocrab
            .issues(&self.owner, &self.repo)
            .remove_label(number, label)
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = GitHubError::from(err);
                if err.status_code() == Some(404) {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn close_issue(&self, number: u64) -> Result<(), GitHubError> {
        self.throttle().await;
        self.octocrab
            .issues(&self.owner, &self.repo)
            .update(number)
            .state(IssueState::Closed)
            .send()
            .await
            .map_err(|e| not_found_as(number, e.into()))?;
        Ok(())
    }

    async fn update_body(&self, number: u64, body: &str) -> Result<(), GitHubError> {
        self.throttle().await;
        self.octocrab
            .issues(&self.owner, &self.repo)
            .update(number)
            .body(body)
            .send()
            .await
            .map_err(|e| not_found_as(number, e.into()))?;
        Ok(())
    }

    async fn add_comment(&self, number: u64, body: &str) -> Result<TrackerComment, GitHubError> {
        self.throttle().await;
        let comment = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .create_comment(number, body)
            .await
            .map_err(|e| not_found_as(number, e.into()))?;
        Ok(to_tracker_comment(comment))
    }

    async fn list_comments(&self, number: u64) -> Result<Vec<TrackerComment>, GitHubError> {
        self.throttle().await;
        let first_page = self
            .octocrab
            .issues(&self.owner, &self.repo)
            .list_comments(number)
            .per_page(100)
            .send()
            .await
            .map_err(|e| not_found_as(number, e.into()))?;
        let comments = self.octocrab.all_pages(first_page).await?;
        Ok(comments.into_iter().map(to_tracker_comment).collect())
    }
}
