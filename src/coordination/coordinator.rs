use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use super::matcher::{ScoredTask, TaskMatcher};
use crate::clock::Clock;
use crate::store::{RetryPolicy, StoreError, TaskFilter, TaskStore};
use crate::tasks::{
    generate_agent_id, AbandonReason, Claim, ClaimRecord, ReleaseOutcome, Task, TaskState,
};
use crate::telemetry::{create_coordination_span, generate_correlation_id};

/// What a claim request produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed {
        claim: Claim,
        task: Task,
        score: Option<i64>,
    },
    /// Nothing suitable could be claimed. Not an error.
    Idle { message: String },
}

impl ClaimOutcome {
    fn idle(message: impl Into<String>) -> Self {
        ClaimOutcome::Idle {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HeartbeatOutcome {
    Alive { claim: Claim },
    /// The claim is gone; the agent must stop working on the task.
    Lost { agent_id: String, message: String },
}

/// Turns an agent's role into an exclusive claim on the best available task.
pub struct ClaimCoordinator {
    store: Arc<dyn TaskStore>,
    matcher: TaskMatcher,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    max_attempts: u32,
    host: Option<String>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn TaskStore>, matcher: TaskMatcher, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            matcher,
            clock,
            retry: RetryPolicy::default(),
            max_attempts: 3,
            host: local_hostname(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    /// Claim `task_id` if given, otherwise the best match for `role`.
    pub async fn claim(&self, role: &str, task_id: Option<&str>) -> Result<ClaimOutcome, StoreError> {
        let correlation_id = generate_correlation_id();
        let span = create_coordination_span("claim", None, task_id, &correlation_id);
        async {
            match task_id {
                Some(task_id) => self.claim_specific(role, task_id).await,
                None => self.claim_best(role).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn claim_specific(&self, role: &str, task_id: &str) -> Result<ClaimOutcome, StoreError> {
        let entry = self.retry.run("get", || self.store.get(task_id)).await?;
        match entry.state {
            TaskState::Available => {}
            TaskState::Claimed => {
                let holder = entry
                    .claim
                    .map(|c| format!(" by {}", c.agent_id))
                    .unwrap_or_default();
                return Ok(ClaimOutcome::idle(format!("task {task_id} is already claimed{holder}")));
            }
            TaskState::Archived => {
                return Ok(ClaimOutcome::idle(format!("task {task_id} is already finished")));
            }
        }
        if entry.task.is_blocked() {
            return Ok(ClaimOutcome::idle(format!("task {task_id} is blocked")));
        }

        let score = self.matcher.score(role, &entry.task).total();
        match self.attempt(role, &entry.task).await {
            Ok(claim) => Ok(ClaimOutcome::Claimed {
                claim,
                task: entry.task,
                score: Some(score),
            }),
            Err(err) if err.is_conflict() => Ok(ClaimOutcome::idle(err.to_string())),
            Err(err) => Err(err),
        }
    }

    async fn claim_best(&self, role: &str) -> Result<ClaimOutcome, StoreError> {
        let filter = TaskFilter::default();
        let mut tried = HashSet::new();

        for attempt in 1..=self.max_attempts {
            let tasks = self
                .retry
                .run("list_available", || self.store.list_available(&filter))
                .await?;

            let Some(ScoredTask { task, score, .. }) = self.matcher.best(role, &tasks, &tried) else {
                debug!(role, attempt, "No suitable task for role");
                return Ok(ClaimOutcome::idle(format!("no suitable task available for role {role}")));
            };
            tried.insert(task.id.clone());

            match self.attempt(role, &task).await {
                Ok(claim) => {
                    return Ok(ClaimOutcome::Claimed {
                        claim,
                        task,
                        score: Some(score),
                    })
                }
                Err(err) if err.is_conflict() || matches!(err, StoreError::NotFound { .. }) => {
                    warn!(
                        role,
                        attempt,
                        task_id = %task.id,
                        error = %err,
                        "Lost claim race, trying next candidate"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Ok(ClaimOutcome::idle(format!(
            "no task claimed for role {role} after {} attempts",
            self.max_attempts
        )))
    }

    /// One claim write under a freshly generated agent id. Only transient
    /// failures are retried; a store that wrote part of a claim reports
    /// `ClaimRolledBack` instead, which is not.
    async fn attempt(&self, role: &str, task: &Task) -> Result<Claim, StoreError> {
        let claim = Claim::new(generate_agent_id(role), role, task, self.clock.now())
            .with_host(self.host.clone());
        let claimed = self
            .retry
            .run("try_claim", || self.store.try_claim(&task.id, claim.clone()))
            .await?;
        info!(
            agent_id = %claimed.agent_id,
            task_id = %claimed.task_id,
            role,
            "Task claimed"
        );
        Ok(claimed)
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<HeartbeatOutcome, StoreError> {
        let correlation_id = generate_correlation_id();
        let span = create_coordination_span("heartbeat", Some(agent_id), None, &correlation_id);
        async {
            let now = self.clock.now();
            match self
                .retry
                .run("heartbeat", || self.store.update_heartbeat(agent_id, now))
                .await
            {
                Ok(claim) => {
                    debug!(agent_id, task_id = %claim.task_id, "Heartbeat recorded");
                    Ok(HeartbeatOutcome::Alive { claim })
                }
                Err(err @ (StoreError::NotFound { .. } | StoreError::Transition(_))) => {
                    warn!(agent_id, error = %err, "Heartbeat for a claim that no longer exists");
                    Ok(HeartbeatOutcome::Lost {
                        agent_id: agent_id.to_string(),
                        message: err.to_string(),
                    })
                }
                Err(err) => Err(err),
            }
        }
        .instrument(span)
        .await
    }

    /// Give the task back to the pool.
    pub async fn release(&self, agent_id: &str) -> Result<ClaimRecord, StoreError> {
        self.finish(
            "release",
            agent_id,
            ReleaseOutcome::Abandoned {
                reason: AbandonReason::Released,
            },
        )
        .await
    }

    pub async fn complete(&self, agent_id: &str) -> Result<ClaimRecord, StoreError> {
        self.finish("complete", agent_id, ReleaseOutcome::Completed).await
    }

    async fn finish(
        &self,
        operation: &str,
        agent_id: &str,
        outcome: ReleaseOutcome,
    ) -> Result<ClaimRecord, StoreError> {
        let correlation_id = generate_correlation_id();
        let span = create_coordination_span(operation, Some(agent_id), None, &correlation_id);
        async {
            let now = self.clock.now();
            let record = self
                .retry
                .run(operation, || self.store.release(agent_id, outcome, now))
                .await?;
            info!(
                agent_id,
                task_id = %record.task.id,
                status = %record.claim.status,
                "Claim finished"
            );
            Ok(record)
        }
        .instrument(span)
        .await
    }
}

fn local_hostname() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
}
