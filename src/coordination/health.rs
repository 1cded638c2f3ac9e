use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::store::{StoreError, TaskFilter, TaskStore};
use crate::tasks::{ClaimRecord, ClaimStatus, Task};

/// Bucket used in per-skill counts for tasks without required skills.
pub const GENERAL_SKILL: &str = "general";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthGrade {
    Excellent,
    Good,
    Fair,
    NeedsAttention,
}

impl HealthGrade {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            HealthGrade::Excellent
        } else if score >= 0.6 {
            HealthGrade::Good
        } else if score >= 0.4 {
            HealthGrade::Fair
        } else {
            HealthGrade::NeedsAttention
        }
    }
}

impl fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HealthGrade::Excellent => "excellent",
            HealthGrade::Good => "good",
            HealthGrade::Fair => "fair",
            HealthGrade::NeedsAttention => "needs attention",
        };
        f.write_str(label)
    }
}

/// The four equally weighted checks behind the health score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSignals {
    /// At least one task is waiting in the pool.
    pub work_available: bool,
    /// At least one claim is heart-beating within the timeout.
    pub agents_active: bool,
    /// Stale claims stay under the configured share of all claims.
    pub stale_ratio_ok: bool,
    /// Something finished inside the activity window, or is being worked on now.
    pub recent_progress: bool,
}

impl HealthSignals {
    pub fn healthy_count(&self) -> usize {
        [
            self.work_available,
            self.agents_active,
            self.stale_ratio_ok,
            self.recent_progress,
        ]
        .iter()
        .filter(|signal| **signal)
        .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub score: f64,
    pub grade: HealthGrade,
    pub signals: HealthSignals,
}

impl HealthScore {
    pub fn from_signals(signals: HealthSignals) -> Self {
        let score = signals.healthy_count() as f64 / 4.0;
        Self {
            score,
            grade: HealthGrade::from_score(score),
            signals,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: String,
    pub title: String,
    pub blocked_for_hours: i64,
}

/// Point-in-time view of the whole pool. Observational only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub taken_at: DateTime<Utc>,
    pub available: usize,
    pub claimed: usize,
    pub stale_claims: usize,
    pub archived: usize,
    pub completions_in_window: usize,
    pub by_effort: BTreeMap<String, usize>,
    pub by_skill: BTreeMap<String, usize>,
    pub blocked_tasks: Vec<BlockedTask>,
    pub health: HealthScore,
    pub warnings: Vec<String>,
}

impl SystemSnapshot {
    /// Short human-readable report.
    pub fn summary(&self) -> String {
        let mut lines = vec![
            format!(
                "Health: {} ({:.0}%)",
                self.health.grade,
                self.health.score * 100.0
            ),
            format!(
                "Tasks: {} available, {} claimed ({} stale), {} archived",
                self.available, self.claimed, self.stale_claims, self.archived
            ),
            format!("Completed recently: {}", self.completions_in_window),
        ];
        if !self.by_skill.is_empty() {
            let skills: Vec<String> = self
                .by_skill
                .iter()
                .map(|(skill, count)| format!("{skill}={count}"))
                .collect();
            lines.push(format!("By skill: {}", skills.join(", ")));
        }
        for blocked in &self.blocked_tasks {
            lines.push(format!(
                "Blocked {}h: {} {}",
                blocked.blocked_for_hours, blocked.task_id, blocked.title
            ));
        }
        for warning in &self.warnings {
            lines.push(format!("Warning: {warning}"));
        }
        lines.join("\n")
    }
}

/// Computes `SystemSnapshot`s from store listings.
#[derive(Debug, Clone)]
pub struct HealthAggregator {
    config: HealthConfig,
    stale_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(config: HealthConfig, stale_timeout: Duration) -> Self {
        Self {
            config,
            stale_timeout,
        }
    }

    /// Read the store and build a snapshot. Never writes.
    pub async fn collect(
        &self,
        store: &dyn TaskStore,
        clock: &dyn Clock,
    ) -> Result<SystemSnapshot, StoreError> {
        let filter = TaskFilter {
            include_blocked: true,
        };
        let available = store.list_available(&filter).await?;
        let active = store.list_active_claims().await?;
        let terminal = store.list_terminal_claims().await?;
        let archived = store.archived_count().await?;

        let snapshot = self.compute(&available, &active, &terminal, archived, clock.now());
        debug!(
            score = snapshot.health.score,
            grade = %snapshot.health.grade,
            available = snapshot.available,
            claimed = snapshot.claimed,
            "Health snapshot computed"
        );
        Ok(snapshot)
    }

    pub fn compute(
        &self,
        available: &[Task],
        active: &[ClaimRecord],
        terminal: &[ClaimRecord],
        archived: usize,
        now: DateTime<Utc>,
    ) -> SystemSnapshot {
        let stale_claims = active
            .iter()
            .filter(|record| record.claim.is_stale(now, self.stale_timeout))
            .count();

        let window_start = hours_before(now, self.config.activity_window_hours);
        let completions_in_window = terminal
            .iter()
            .filter(|record| record.claim.status == ClaimStatus::Completed)
            .filter(|record| record.claim.completed_at.is_some_and(|at| at >= window_start))
            .count();

        let mut by_effort = BTreeMap::new();
        let mut by_skill = BTreeMap::new();
        for task in available {
            *by_effort.entry(task.estimated_effort.to_string()).or_insert(0) += 1;
            if task.is_general() {
                *by_skill.entry(GENERAL_SKILL.to_string()).or_insert(0) += 1;
            }
            for skill in &task.required_skills {
                *by_skill.entry(skill.clone()).or_insert(0) += 1;
            }
        }

        let blocked_since = hours_before(now, self.config.blocked_threshold_hours);
        let blocked: Vec<BlockedTask> = available
            .iter()
            .filter(|task| task.is_blocked())
            .filter(|task| task.created_at < blocked_since)
            .map(|task| BlockedTask {
                task_id: task.id.clone(),
                title: task.title.clone(),
                blocked_for_hours: (now - task.created_at).num_hours(),
            })
            .collect();

        let stale_ratio_ok = if active.is_empty() {
            true
        } else {
            (stale_claims as f64 / active.len() as f64) < self.config.stale_ratio_threshold
        };

        let signals = HealthSignals {
            work_available: available.iter().any(|task| !task.is_blocked()),
            agents_active: active.len() > stale_claims,
            stale_ratio_ok,
            recent_progress: completions_in_window > 0 || !active.is_empty(),
        };

        let mut warnings = Vec::new();
        if available.len() > self.config.queue_warning_threshold {
            warnings.push(format!(
                "{} tasks queued, above the warning threshold of {}",
                available.len(),
                self.config.queue_warning_threshold
            ));
        }
        if stale_claims > 0 {
            warnings.push(format!("{stale_claims} claims have stale heartbeats"));
        }
        if !blocked.is_empty() {
            warnings.push(format!(
                "{} tasks blocked for more than {}h",
                blocked.len(),
                self.config.blocked_threshold_hours
            ));
        }
        for task in &blocked {
            warn!(
                task_id = %task.task_id,
                blocked_for_hours = task.blocked_for_hours,
                "Task blocked longer than threshold"
            );
        }

        SystemSnapshot {
            taken_at: now,
            available: available.len(),
            claimed: active.len(),
            stale_claims,
            archived,
            completions_in_window,
            by_effort,
            by_skill,
            blocked_tasks: blocked,
            health: HealthScore::from_signals(signals),
            warnings,
        }
    }
}

/// `hours` before `now`, saturating at the earliest representable instant.
fn hours_before(now: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    i64::try_from(hours)
        .ok()
        .and_then(Duration::try_hours)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{Claim, Effort, BLOCKED_LABEL};
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn aggregator() -> HealthAggregator {
        HealthAggregator::new(HealthConfig::default(), Duration::minutes(30))
    }

    fn record(id: &str, heartbeat_minutes_ago: i64) -> ClaimRecord {
        let task = Task::new(id, format!("task {id}"), now() - Duration::days(1));
        let mut claim = Claim::new(format!("dev_{id}"), "dev", &task, now() - Duration::hours(2));
        claim.heartbeat = Some(now() - Duration::minutes(heartbeat_minutes_ago));
        ClaimRecord { claim, task }
    }

    fn completed(id: &str, hours_ago: i64) -> ClaimRecord {
        let mut record = record(id, 0);
        record.claim.status = ClaimStatus::Completed;
        record.claim.completed_at = Some(now() - Duration::hours(hours_ago));
        record
    }

    #[test]
    fn test_score_is_share_of_healthy_signals() {
        let all = HealthSignals {
            work_available: true,
            agents_active: true,
            stale_ratio_ok: true,
            recent_progress: true,
        };
        assert_eq!(HealthScore::from_signals(all).score, 1.0);
        assert_eq!(HealthScore::from_signals(all).grade, HealthGrade::Excellent);

        let none = HealthScore::from_signals(HealthSignals::default());
        assert_eq!(none.score, 0.0);
        assert_eq!(none.grade, HealthGrade::NeedsAttention);
    }

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(HealthGrade::from_score(0.8), HealthGrade::Excellent);
        assert_eq!(HealthGrade::from_score(0.75), HealthGrade::Good);
        assert_eq!(HealthGrade::from_score(0.5), HealthGrade::Fair);
        assert_eq!(HealthGrade::from_score(0.25), HealthGrade::NeedsAttention);
        assert_eq!(HealthGrade::NeedsAttention.to_string(), "needs attention");
    }

    #[test]
    fn test_busy_healthy_pool() {
        let available = vec![
            Task::new("1", "a", now()).with_skills(["security"]),
            Task::new("2", "b", now()).with_effort(Effort::Small),
        ];
        let active = vec![record("3", 5)];
        let terminal = vec![completed("4", 2)];

        let snapshot = aggregator().compute(&available, &active, &terminal, 7, now());
        assert_eq!(snapshot.available, 2);
        assert_eq!(snapshot.claimed, 1);
        assert_eq!(snapshot.archived, 7);
        assert_eq!(snapshot.completions_in_window, 1);
        assert_eq!(snapshot.by_skill.get("security"), Some(&1));
        assert_eq!(snapshot.by_skill.get(GENERAL_SKILL), Some(&1));
        assert_eq!(snapshot.by_effort.get("small"), Some(&1));
        assert_eq!(snapshot.health.score, 1.0);
        assert!(snapshot.warnings.is_empty());
    }

    #[test]
    fn test_stale_claims_degrade_health() {
        let active = vec![record("1", 45), record("2", 5)];
        let snapshot = aggregator().compute(&[], &active, &[], 0, now());

        assert_eq!(snapshot.stale_claims, 1);
        assert!(!snapshot.health.signals.work_available);
        assert!(snapshot.health.signals.agents_active);
        assert!(!snapshot.health.signals.stale_ratio_ok);
        assert!(snapshot.health.signals.recent_progress);
        assert_eq!(snapshot.health.score, 0.5);
        assert_eq!(snapshot.health.grade, HealthGrade::Fair);
    }

    #[test]
    fn test_old_completions_fall_outside_window() {
        let terminal = vec![completed("1", 30)];
        let snapshot = aggregator().compute(&[], &[], &terminal, 0, now());
        assert_eq!(snapshot.completions_in_window, 0);
        assert!(!snapshot.health.signals.recent_progress);
    }

    #[test]
    fn test_long_blocked_tasks_reported() {
        let available = vec![
            Task::new("1", "waiting on vendor", now() - Duration::hours(6)).with_label(BLOCKED_LABEL),
            Task::new("2", "just blocked", now() - Duration::hours(1)).with_label(BLOCKED_LABEL),
        ];
        let snapshot = aggregator().compute(&available, &[], &[], 0, now());
        assert_eq!(snapshot.blocked_tasks.len(), 1);
        assert_eq!(snapshot.blocked_tasks[0].task_id, "1");
        assert_eq!(snapshot.blocked_tasks[0].blocked_for_hours, 6);
    }

    #[test]
    fn test_only_blocked_tasks_is_no_work_available() {
        let available = vec![
            Task::new("1", "waiting on vendor", now() - Duration::hours(1)).with_label(BLOCKED_LABEL),
            Task::new("2", "waiting on design", now()).with_label(BLOCKED_LABEL),
        ];
        let snapshot = aggregator().compute(&available, &[], &[], 0, now());
        assert_eq!(snapshot.available, 2);
        assert!(!snapshot.health.signals.work_available);

        let mut with_open = available.clone();
        with_open.push(Task::new("3", "ready", now()));
        let snapshot = aggregator().compute(&with_open, &[], &[], 0, now());
        assert!(snapshot.health.signals.work_available);
    }

    #[test]
    fn test_huge_windows_do_not_overflow() {
        let config = HealthConfig {
            activity_window_hours: u64::MAX,
            blocked_threshold_hours: u64::MAX,
            ..HealthConfig::default()
        };
        let aggregator = HealthAggregator::new(config, Duration::minutes(30));
        let available =
            vec![Task::new("1", "waiting", now() - Duration::days(400)).with_label(BLOCKED_LABEL)];
        let terminal = vec![completed("1", 5000)];

        let snapshot = aggregator.compute(&available, &[], &terminal, 0, now());
        assert_eq!(snapshot.completions_in_window, 1);
        assert!(snapshot.blocked_tasks.is_empty());
    }

    #[test]
    fn test_queue_warning() {
        let available: Vec<Task> = (0..51).map(|i| Task::new(i.to_string(), "t", now())).collect();
        let snapshot = aggregator().compute(&available, &[], &[], 0, now());
        assert_eq!(snapshot.warnings.len(), 1);
        assert!(snapshot.summary().contains("Warning: 51 tasks queued"));
    }

    proptest! {
        #[test]
        fn prop_score_stays_in_unit_range(
            available in 0usize..20,
            fresh in 0usize..10,
            stale in 0usize..10,
            recent in 0usize..5,
        ) {
            let tasks: Vec<Task> = (0..available).map(|i| Task::new(format!("t{i}"), "t", now())).collect();
            let mut active: Vec<ClaimRecord> = (0..fresh).map(|i| record(&format!("f{i}"), 1)).collect();
            active.extend((0..stale).map(|i| record(&format!("s{i}"), 90)));
            let terminal: Vec<ClaimRecord> = (0..recent).map(|i| completed(&format!("c{i}"), 1)).collect();

            let snapshot = aggregator().compute(&tasks, &active, &terminal, 0, now());
            prop_assert!((0.0..=1.0).contains(&snapshot.health.score));
            prop_assert_eq!(snapshot.health.grade, HealthGrade::from_score(snapshot.health.score));
            prop_assert_eq!(snapshot.stale_claims, stale);
        }
    }
}
