use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::priority::Priority;

/// Label marking urgent bootstrap work every role may pick up.
pub const BOOTSTRAP_LABEL: &str = "conductor:init";
/// Label marking a task that must not be claimed until unblocked.
pub const BLOCKED_LABEL: &str = "conductor:blocked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Small,
    #[default]
    Medium,
    Large,
}

impl Effort {
    /// Matcher bonus. Smaller work scores higher to keep throughput up.
    pub fn bonus(self) -> i64 {
        match self {
            Effort::Small => 15,
            Effort::Medium => 10,
            Effort::Large => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Effort::Small => "small",
            Effort::Medium => "medium",
            Effort::Large => "large",
        }
    }
}

impl FromStr for Effort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(Effort::Small),
            "medium" => Ok(Effort::Medium),
            "large" => Ok(Effort::Large),
            other => Err(format!("unknown effort '{other}'")),
        }
    }
}

impl fmt::Display for Effort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A discrete unit of work in the shared pool.
///
/// Fields this crate does not know about are kept in `extra` so a
/// read/modify/write cycle never drops data written by other tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Empty means "general": any role may claim it.
    #[serde(default)]
    pub required_skills: BTreeSet<String>,
    #[serde(default)]
    pub estimated_effort: Effort,
    #[serde(default)]
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    #[serde(default, alias = "files_locked", skip_serializing_if = "BTreeSet::is_empty")]
    pub locked_resources: BTreeSet<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            required_skills: BTreeSet::new(),
            estimated_effort: Effort::default(),
            priority: Priority::default(),
            created_at,
            labels: BTreeSet::new(),
            locked_resources: BTreeSet::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_effort(mut self, effort: Effort) -> Self {
        self.estimated_effort = effort;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    pub fn with_locked_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locked_resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_general(&self) -> bool {
        self.required_skills.is_empty()
    }

    pub fn is_bootstrap(&self) -> bool {
        self.labels.contains(BOOTSTRAP_LABEL)
    }

    pub fn is_blocked(&self) -> bool {
        self.labels.contains(BLOCKED_LABEL)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Claimed,
    InProgress,
    Completed,
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimEvent {
    Heartbeat,
    Complete,
    Abandon,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("claim is already {from}; {event:?} is not allowed")]
    InvalidTransition { from: ClaimStatus, event: ClaimEvent },
}

impl ClaimStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ClaimStatus::Completed | ClaimStatus::Abandoned)
    }

    /// `claimed -> in_progress -> (completed | abandoned)`; terminal states accept nothing.
    pub fn apply(self, event: ClaimEvent) -> Result<ClaimStatus, TransitionError> {
        match (self, event) {
            (ClaimStatus::Claimed | ClaimStatus::InProgress, ClaimEvent::Heartbeat) => {
                Ok(ClaimStatus::InProgress)
            }
            (ClaimStatus::Claimed | ClaimStatus::InProgress, ClaimEvent::Complete) => {
                Ok(ClaimStatus::Completed)
            }
            (ClaimStatus::Claimed | ClaimStatus::InProgress, ClaimEvent::Abandon) => {
                Ok(ClaimStatus::Abandoned)
            }
            (from, event) => Err(TransitionError::InvalidTransition { from, event }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClaimStatus::Claimed => "claimed",
            ClaimStatus::InProgress => "in_progress",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonReason {
    /// Reclaimed by the sweep after the heartbeat timed out.
    StaleHeartbeat,
    /// The agent gave the task back voluntarily.
    Released,
    /// The agent lost remote arbitration to another claimant.
    VerificationLost,
}

impl AbandonReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AbandonReason::StaleHeartbeat => "stale_heartbeat",
            AbandonReason::Released => "released",
            AbandonReason::VerificationLost => "verification_lost",
        }
    }
}

/// An agent's exclusive, heartbeat-bounded ownership of one task.
///
/// Like [`Task`], unknown fields survive a rewrite through `extra`. A heartbeat
/// that does not parse is kept there verbatim until a real one replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredClaim", into = "StoredClaim")]
pub struct Claim {
    pub agent_id: String,
    pub role: String,
    pub task_id: String,
    pub status: ClaimStatus,
    pub claimed_at: DateTime<Utc>,
    /// `None` when the record carries no usable activity marker.
    pub heartbeat: Option<DateTime<Utc>>,
    pub locked_resources: BTreeSet<String>,
    pub host: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub abandonment_reason: Option<AbandonReason>,
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Serialized shape of [`Claim`], with the heartbeat left as raw JSON.
#[derive(Serialize, Deserialize)]
struct StoredClaim {
    agent_id: String,
    role: String,
    task_id: String,
    status: ClaimStatus,
    claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    heartbeat: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    locked_resources: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    abandonment_reason: Option<AbandonReason>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

const HEARTBEAT_KEY: &str = "heartbeat";

impl From<StoredClaim> for Claim {
    fn from(stored: StoredClaim) -> Self {
        let mut extra = stored.extra;
        let heartbeat = stored
            .heartbeat
            .as_ref()
            .and_then(|raw| raw.as_str())
            .and_then(parse_timestamp);
        if heartbeat.is_none() {
            if let Some(raw) = stored.heartbeat.filter(|raw| !raw.is_null()) {
                extra.insert(HEARTBEAT_KEY.to_string(), raw);
            }
        }
        Self {
            agent_id: stored.agent_id,
            role: stored.role,
            task_id: stored.task_id,
            status: stored.status,
            claimed_at: stored.claimed_at,
            heartbeat,
            locked_resources: stored.locked_resources,
            host: stored.host,
            completed_at: stored.completed_at,
            abandonment_reason: stored.abandonment_reason,
            extra,
        }
    }
}

impl From<Claim> for StoredClaim {
    fn from(claim: Claim) -> Self {
        let mut extra = claim.extra;
        let unparsed = extra.remove(HEARTBEAT_KEY);
        let heartbeat = match claim.heartbeat {
            Some(ts) => Some(serde_json::Value::String(
                ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            )),
            None => unparsed,
        };
        Self {
            agent_id: claim.agent_id,
            role: claim.role,
            task_id: claim.task_id,
            status: claim.status,
            claimed_at: claim.claimed_at,
            heartbeat,
            locked_resources: claim.locked_resources,
            host: claim.host,
            completed_at: claim.completed_at,
            abandonment_reason: claim.abandonment_reason,
            extra,
        }
    }
}

impl Claim {
    /// Fresh claim on `task`, heart-beating as of `now`.
    pub fn new(agent_id: impl Into<String>, role: impl Into<String>, task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            role: role.into(),
            task_id: task.id.clone(),
            status: ClaimStatus::Claimed,
            claimed_at: now,
            heartbeat: Some(now),
            locked_resources: task.locked_resources.clone(),
            host: None,
            completed_at: None,
            abandonment_reason: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_host(mut self, host: Option<String>) -> Self {
        self.host = host;
        self
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Stale iff there is no activity marker, or the last one is older than `timeout`.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.heartbeat {
            Some(last) => now - last > timeout,
            None => true,
        }
    }

    pub fn conflicts_with(&self, resources: &BTreeSet<String>) -> bool {
        !self.locked_resources.is_disjoint(resources)
    }

    pub fn finish(&mut self, event: ClaimEvent, at: DateTime<Utc>) -> Result<(), TransitionError> {
        self.status = self.status.apply(event)?;
        self.completed_at = Some(at);
        Ok(())
    }
}

/// `<role>_<8 hex chars>`, unique per claiming attempt.
pub fn generate_agent_id(role: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", role, &suffix[..8])
}

/// A claim together with the task it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    #[serde(flatten)]
    pub claim: Claim,
    pub task: Task,
}

/// Terminal task/claim pair retained only for history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedRecord {
    pub task: Task,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<Claim>,
    pub archived_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Available,
    Claimed,
    Archived,
}

/// Result of looking a task up by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEntry {
    pub task: Task,
    pub state: TaskState,
    pub claim: Option<Claim>,
}

/// How an agent's claim ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Work finished; the task leaves the pool.
    Completed,
    /// Owner gave up; the task returns to the pool.
    Abandoned { reason: AbandonReason },
    /// Timeout authority reclaiming a stale claim. Rejected with a conflict if
    /// the heartbeat moved past `observed_heartbeat` since the sweep looked.
    Reclaimed { observed_heartbeat: Option<DateTime<Utc>> },
}

impl ReleaseOutcome {
    pub fn event(self) -> ClaimEvent {
        match self {
            ReleaseOutcome::Completed => ClaimEvent::Complete,
            ReleaseOutcome::Abandoned { .. } | ReleaseOutcome::Reclaimed { .. } => ClaimEvent::Abandon,
        }
    }

    pub fn abandon_reason(self) -> Option<AbandonReason> {
        match self {
            ReleaseOutcome::Completed => None,
            ReleaseOutcome::Abandoned { reason } => Some(reason),
            ReleaseOutcome::Reclaimed { .. } => Some(AbandonReason::StaleHeartbeat),
        }
    }
}

/// Accepts RFC 3339 and the zone-less ISO form older state files used.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_claim_status_transitions() {
        assert_eq!(ClaimStatus::Claimed.apply(ClaimEvent::Heartbeat), Ok(ClaimStatus::InProgress));
        assert_eq!(ClaimStatus::InProgress.apply(ClaimEvent::Heartbeat), Ok(ClaimStatus::InProgress));
        assert_eq!(ClaimStatus::Claimed.apply(ClaimEvent::Complete), Ok(ClaimStatus::Completed));
        assert_eq!(ClaimStatus::InProgress.apply(ClaimEvent::Abandon), Ok(ClaimStatus::Abandoned));

        assert!(ClaimStatus::Completed.apply(ClaimEvent::Heartbeat).is_err());
        assert!(ClaimStatus::Abandoned.apply(ClaimEvent::Complete).is_err());
    }

    #[test]
    fn test_claim_staleness_boundary() {
        let task = Task::new("1", "t", at(9, 0));
        let claim = Claim::new("dev_1", "dev", &task, at(10, 0));
        let timeout = Duration::minutes(30);

        assert!(!claim.is_stale(at(10, 30), timeout));
        assert!(claim.is_stale(at(10, 31), timeout));

        let mut silent = claim.clone();
        silent.heartbeat = None;
        assert!(silent.is_stale(at(10, 0), timeout));
    }

    #[test]
    fn test_task_preserves_unknown_fields() {
        let raw = r#"{
            "id": "7",
            "title": "Wire up auth",
            "created_at": "2024-03-01T09:00:00Z",
            "files_locked": ["src/auth.rs"],
            "estimated_hours": 3
        }"#;
        let task: Task = serde_json::from_str(raw).unwrap();
        assert!(task.locked_resources.contains("src/auth.rs"));
        assert_eq!(task.extra.get("estimated_hours"), Some(&serde_json::json!(3)));

        let again: Task = serde_json::from_str(&serde_json::to_string(&task).unwrap()).unwrap();
        assert_eq!(task, again);
    }

    #[test]
    fn test_lenient_heartbeat_parsing() {
        assert_eq!(parse_timestamp("2024-03-01T10:00:00Z"), Some(at(10, 0)));
        assert_eq!(parse_timestamp("2024-03-01T10:00:00.000000"), Some(at(10, 0)));
        assert_eq!(parse_timestamp("yesterday"), None);

        let raw = r#"{"agent_id":"a","role":"dev","task_id":"1","status":"claimed",
                      "claimed_at":"2024-03-01T10:00:00Z","heartbeat":"garbage"}"#;
        let claim: Claim = serde_json::from_str(raw).unwrap();
        assert_eq!(claim.heartbeat, None);
    }

    #[test]
    fn test_claim_keeps_unknown_fields_and_raw_heartbeat() {
        let raw = r#"{"agent_id":"a","role":"dev","task_id":"1","status":"in_progress",
                      "claimed_at":"2024-03-01T10:00:00Z","heartbeat":"garbage",
                      "worktree_path":"/tmp/wt-1"}"#;
        let claim: Claim = serde_json::from_str(raw).unwrap();
        assert_eq!(claim.extra.get("worktree_path"), Some(&serde_json::json!("/tmp/wt-1")));

        let written = serde_json::to_value(&claim).unwrap();
        assert_eq!(written["heartbeat"], "garbage");
        assert_eq!(written["worktree_path"], "/tmp/wt-1");

        // A real heartbeat replaces the unparseable one
        let mut beating = claim;
        beating.heartbeat = Some(at(10, 5));
        let written = serde_json::to_value(&beating).unwrap();
        assert_eq!(written["heartbeat"], "2024-03-01T10:05:00Z");
        let again: Claim = serde_json::from_value(written).unwrap();
        assert_eq!(again.heartbeat, Some(at(10, 5)));
        assert!(!again.extra.contains_key("heartbeat"));
    }

    #[test]
    fn test_generate_agent_id_shape() {
        let id = generate_agent_id("security");
        assert!(id.starts_with("security_"));
        assert_eq!(id.len(), "security_".len() + 8);
        assert_ne!(id, generate_agent_id("security"));
    }
}
