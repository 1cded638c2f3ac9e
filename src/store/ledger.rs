//! Claim ledger kept in tracker comments.
//!
//! Each coordination comment is a short heading plus a fenced ```json block.
//! Only the block is read back; prose around it is for humans. Activity time
//! is the comment's own timestamp, never a value written by the agent. Heartbeats
//! carry forward the timestamp of the claim comment they descend from, so the
//! arbitration order survives the claim scrolling out of the scan window.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::warn;

use crate::github::TrackerComment;
use crate::store::StoreError;
use crate::tasks::{AbandonReason, Claim, ClaimStatus};

const LEDGER_HEADING: &str = "### 🤖 Conductor";

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```json[ \t]*\r?\n(.*?)\r?\n?```").expect("ledger fence pattern is valid")
});

/// Claim metadata carried by `claim` and `heartbeat` entries. Heartbeats repeat
/// it in full so a reader scanning only recent comments can still rebuild the claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMarker {
    pub agent_id: String,
    pub role: String,
    pub status: ClaimStatus,
    pub claimed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub locked_resources: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Comment time of the agent's `claim` entry. Set on heartbeats only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_posted_at: Option<DateTime<Utc>>,
}

impl ClaimMarker {
    pub fn anchored_at(mut self, claim_posted_at: Option<DateTime<Utc>>) -> Self {
        self.claim_posted_at = claim_posted_at;
        self
    }
}

impl From<&Claim> for ClaimMarker {
    fn from(claim: &Claim) -> Self {
        Self {
            agent_id: claim.agent_id.clone(),
            role: claim.role.clone(),
            status: claim.status,
            claimed_at: claim.claimed_at,
            locked_resources: claim.locked_resources.clone(),
            host: claim.host.clone(),
            claim_posted_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEntry {
    Claim(ClaimMarker),
    Heartbeat(ClaimMarker),
    /// With `verification_lost` the agent withdraws a claim it did not win;
    /// the winner's session continues.
    Release {
        agent_id: String,
        reason: AbandonReason,
    },
    Complete {
        agent_id: String,
    },
}

impl LedgerEntry {
    pub fn agent_id(&self) -> &str {
        match self {
            LedgerEntry::Claim(marker) | LedgerEntry::Heartbeat(marker) => &marker.agent_id,
            LedgerEntry::Release { agent_id, .. } | LedgerEntry::Complete { agent_id } => agent_id,
        }
    }

    fn marker(&self) -> Option<&ClaimMarker> {
        match self {
            LedgerEntry::Claim(marker) | LedgerEntry::Heartbeat(marker) => Some(marker),
            _ => None,
        }
    }

    pub fn withdrawal(agent_id: impl Into<String>) -> Self {
        LedgerEntry::Release {
            agent_id: agent_id.into(),
            reason: AbandonReason::VerificationLost,
        }
    }

    fn is_withdrawal(&self) -> bool {
        matches!(
            self,
            LedgerEntry::Release {
                reason: AbandonReason::VerificationLost,
                ..
            }
        )
    }

    fn ends_session(&self) -> bool {
        match self {
            LedgerEntry::Release { .. } => !self.is_withdrawal(),
            LedgerEntry::Complete { .. } => true,
            _ => false,
        }
    }

    pub fn render(&self) -> Result<String, StoreError> {
        let (kind, summary) = match self {
            LedgerEntry::Claim(m) => ("claim", format!("Claimed by `{}` (role `{}`).", m.agent_id, m.role)),
            LedgerEntry::Heartbeat(m) => ("heartbeat", format!("Heartbeat from `{}`.", m.agent_id)),
            LedgerEntry::Release { agent_id, reason } => (
                "release",
                format!("Released by `{}` ({}).", agent_id, reason.as_str()),
            ),
            LedgerEntry::Complete { agent_id } => ("complete", format!("Completed by `{agent_id}`.")),
        };
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(format!("{LEDGER_HEADING}: {kind}\n\n{summary}\n\n```json\n{json}\n```\n"))
    }

    /// `None` for comments without a fenced block. A block that does not decode
    /// is logged and skipped.
    pub fn parse(body: &str) -> Option<LedgerEntry> {
        let captures = FENCED_JSON.captures(body)?;
        let block = captures.get(1)?.as_str();
        match serde_json::from_str(block) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(error = %err, "Skipping unparseable claim ledger entry");
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEvent {
    pub entry: LedgerEntry,
    pub posted_at: DateTime<Utc>,
}

/// Parsed ledger of one issue, oldest first.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    events: Vec<LedgerEvent>,
}

impl Ledger {
    /// Read the last `depth` comments; older history is ignored.
    pub fn from_comments(comments: &[TrackerComment], depth: usize) -> Self {
        let start = comments.len().saturating_sub(depth);
        let events = comments[start..]
            .iter()
            .filter_map(|comment| {
                LedgerEntry::parse(&comment.body).map(|entry| LedgerEvent {
                    entry,
                    posted_at: comment.created_at,
                })
            })
            .collect();
        Self { events }
    }

    pub fn events(&self) -> &[LedgerEvent] {
        &self.events
    }

    /// Events since the last release or completion.
    fn current_session(&self) -> &[LedgerEvent] {
        let start = self
            .events
            .iter()
            .rposition(|event| event.entry.ends_session())
            .map_or(0, |i| i + 1);
        &self.events[start..]
    }

    /// When each live claimant's claim was posted, as far as the visible
    /// window can tell. Withdrawn agents are left out.
    fn claim_times(&self) -> BTreeMap<&str, DateTime<Utc>> {
        let session = self.current_session();
        let withdrawn: BTreeSet<&str> = session
            .iter()
            .filter(|event| event.entry.is_withdrawal())
            .map(|event| event.entry.agent_id())
            .collect();

        let mut times: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for event in session {
            let (agent_id, at) = match &event.entry {
                LedgerEntry::Claim(marker) => (marker.agent_id.as_str(), event.posted_at),
                LedgerEntry::Heartbeat(marker) => (
                    marker.agent_id.as_str(),
                    marker.claim_posted_at.unwrap_or(event.posted_at),
                ),
                _ => continue,
            };
            if withdrawn.contains(agent_id) {
                continue;
            }
            times
                .entry(agent_id)
                .and_modify(|earliest| *earliest = (*earliest).min(at))
                .or_insert(at);
        }
        times
    }

    /// The claimant every reader agrees on: earliest claim wins, equal
    /// timestamps go to the lexicographically smallest agent id.
    pub fn winner(&self) -> Option<&str> {
        self.claim_times()
            .into_iter()
            .min_by(|(a_id, a_at), (b_id, b_at)| a_at.cmp(b_at).then_with(|| a_id.cmp(b_id)))
            .map(|(agent_id, _)| agent_id)
    }

    /// Claim time that `agent_id`'s heartbeats carry forward.
    pub fn claim_posted_at(&self, agent_id: &str) -> Option<DateTime<Utc>> {
        self.claim_times().get(agent_id).copied()
    }

    /// The live claim on `task_id`, rebuilt from the winner's latest marker.
    pub fn active_claim(&self, task_id: &str) -> Option<Claim> {
        let winner = self.winner()?;
        let (marker, last_seen) = self
            .current_session()
            .iter()
            .filter_map(|event| event.entry.marker().map(|m| (m, event.posted_at)))
            .filter(|(marker, _)| marker.agent_id == winner)
            .last()?;
        Some(claim_from(marker, task_id, last_seen))
    }

    /// The claim closed by the most recent `complete` entry.
    pub fn completed_claim(&self, task_id: &str) -> Option<Claim> {
        let end = self
            .events
            .iter()
            .rposition(|event| matches!(event.entry, LedgerEntry::Complete { .. }))?;
        let completed = &self.events[end];
        let agent_id = completed.entry.agent_id();

        let (marker, last_seen) = self.events[..end]
            .iter()
            .filter_map(|event| event.entry.marker().map(|m| (m, event.posted_at)))
            .filter(|(marker, _)| marker.agent_id == agent_id)
            .last()?;

        let mut claim = claim_from(marker, task_id, last_seen);
        claim.status = ClaimStatus::Completed;
        claim.completed_at = Some(completed.posted_at);
        Some(claim)
    }
}

fn claim_from(marker: &ClaimMarker, task_id: &str, last_seen: DateTime<Utc>) -> Claim {
    Claim {
        agent_id: marker.agent_id.clone(),
        role: marker.role.clone(),
        task_id: task_id.to_string(),
        status: marker.status,
        claimed_at: marker.claimed_at,
        heartbeat: Some(last_seen),
        locked_resources: marker.locked_resources.clone(),
        host: marker.host.clone(),
        completed_at: None,
        abandonment_reason: None,
        extra: Default::default(),
    }
}
