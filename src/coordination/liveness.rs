use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::tasks::ClaimRecord;

/// One active claim judged against the heartbeat timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimAssessment {
    pub record: ClaimRecord,
    /// Last recorded activity; `None` if the record carried no usable heartbeat.
    pub last_activity: Option<DateTime<Utc>>,
    pub idle_for: Option<Duration>,
    pub stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivenessReport {
    pub active: Vec<ClaimAssessment>,
    pub stale: Vec<ClaimAssessment>,
}

impl LivenessReport {
    pub fn total(&self) -> usize {
        self.active.len() + self.stale.len()
    }
}

/// Serializable view of a stale claim for command output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaleClaimView {
    pub agent_id: String,
    pub task_id: String,
    pub last_activity: Option<DateTime<Utc>>,
    pub idle_minutes: Option<i64>,
}

impl From<&ClaimAssessment> for StaleClaimView {
    fn from(assessment: &ClaimAssessment) -> Self {
        Self {
            agent_id: assessment.record.claim.agent_id.clone(),
            task_id: assessment.record.claim.task_id.clone(),
            last_activity: assessment.last_activity,
            idle_minutes: assessment.idle_for.map(|d| d.num_minutes()),
        }
    }
}

/// Judges claims against the heartbeat timeout. Read-only: reclaiming is the
/// sweep's job.
#[derive(Debug, Clone, Copy)]
pub struct LivenessMonitor {
    timeout: Duration,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn assess(&self, record: ClaimRecord, now: DateTime<Utc>) -> ClaimAssessment {
        let last_activity = record.claim.heartbeat;
        ClaimAssessment {
            stale: record.claim.is_stale(now, self.timeout),
            idle_for: last_activity.map(|at| now - at),
            last_activity,
            record,
        }
    }

    /// Split active claims into live and stale. Terminal records are ignored.
    pub fn classify(&self, records: Vec<ClaimRecord>, now: DateTime<Utc>) -> LivenessReport {
        let mut report = LivenessReport::default();
        for record in records.into_iter().filter(|r| r.claim.is_active()) {
            let assessment = self.assess(record, now);
            if assessment.stale {
                report.stale.push(assessment);
            } else {
                report.active.push(assessment);
            }
        }
        report
    }
}
