//! In-memory form of the local state file.
//!
//! Every mutation here is pure: the local backend loads a document under the
//! file lock, calls one of these methods, and writes the whole document back.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::warn;

use super::{StoreError, TaskFilter};
use crate::tasks::{
    ArchivedRecord, Claim, ClaimEvent, ClaimRecord, ReleaseOutcome, Task, TaskEntry, TaskState,
};

/// A list whose unparseable entries are kept aside instead of failing the load.
/// They are written back untouched so a rewrite never loses data.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection<T> {
    pub items: Vec<T>,
    malformed: Vec<serde_json::Value>,
}

impl<T> Default for Collection<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            malformed: Vec::new(),
        }
    }
}

impl<T> Collection<T> {
    pub fn malformed_count(&self) -> usize {
        self.malformed.len()
    }
}

impl<T: Serialize> Serialize for Collection<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;
        let mut seq = serializer.serialize_seq(Some(self.items.len() + self.malformed.len()))?;
        for item in &self.items {
            seq.serialize_element(item)?;
        }
        for raw in &self.malformed {
            seq.serialize_element(raw)?;
        }
        seq.end()
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Collection<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
        let mut collection = Collection::default();
        for value in raw {
            match serde_json::from_value::<T>(value.clone()) {
                Ok(item) => collection.items.push(item),
                Err(err) => {
                    warn!(error = %err, "Skipping malformed record in task store");
                    collection.malformed.push(value);
                }
            }
        }
        Ok(collection)
    }
}

/// Active claims keyed by agent id, with the same quarantine behaviour as [`Collection`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimMap {
    pub items: BTreeMap<String, ClaimRecord>,
    malformed: BTreeMap<String, serde_json::Value>,
}

impl Serialize for ClaimMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.items.len() + self.malformed.len()))?;
        for (agent_id, record) in &self.items {
            map.serialize_entry(agent_id, record)?;
        }
        for (agent_id, raw) in &self.malformed {
            map.serialize_entry(agent_id, raw)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ClaimMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut map = ClaimMap::default();
        for (agent_id, value) in raw {
            match serde_json::from_value::<ClaimRecord>(value.clone()) {
                Ok(record) => {
                    map.items.insert(agent_id, record);
                }
                Err(err) => {
                    warn!(agent_id = %agent_id, error = %err, "Skipping malformed active claim");
                    map.malformed.insert(agent_id, value);
                }
            }
        }
        Ok(map)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default)]
    pub available_tasks: Collection<Task>,
    #[serde(default, alias = "active_work")]
    pub active_claims: ClaimMap,
    #[serde(default)]
    pub completed_work: Collection<ClaimRecord>,
    #[serde(default)]
    pub archived: Collection<ArchivedRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_status: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl StoreDocument {
    pub fn from_json(raw: &str) -> Result<Self, StoreError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw).map_err(|e| StoreError::MalformedRecord(format!("state file: {e}")))
    }

    pub fn to_json(&self) -> Result<String, StoreError> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn is_claimed(&self, task_id: &str) -> bool {
        self.active_claims
            .items
            .values()
            .any(|record| record.claim.task_id == task_id)
    }

    pub fn available(&self, filter: &TaskFilter) -> Vec<Task> {
        self.available_tasks
            .items
            .iter()
            .filter(|task| !self.is_claimed(&task.id))
            .filter(|task| filter.matches(task))
            .cloned()
            .collect()
    }

    /// Completed tasks still awaiting the archival sweep are terminal, so they
    /// report as archived.
    pub fn find(&self, task_id: &str) -> Option<TaskEntry> {
        if let Some(record) = self
            .active_claims
            .items
            .values()
            .find(|record| record.claim.task_id == task_id)
        {
            return Some(TaskEntry {
                task: record.task.clone(),
                state: TaskState::Claimed,
                claim: Some(record.claim.clone()),
            });
        }
        if let Some(task) = self.available_tasks.items.iter().find(|t| t.id == task_id) {
            return Some(TaskEntry {
                task: task.clone(),
                state: TaskState::Available,
                claim: None,
            });
        }
        if let Some(record) = self
            .completed_work
            .items
            .iter()
            .rev()
            .find(|record| record.task.id == task_id)
        {
            return Some(TaskEntry {
                task: record.task.clone(),
                state: TaskState::Archived,
                claim: Some(record.claim.clone()),
            });
        }
        self.archived
            .items
            .iter()
            .rev()
            .find(|record| record.task.id == task_id)
            .map(|record| TaskEntry {
                task: record.task.clone(),
                state: TaskState::Archived,
                claim: record.claim.clone(),
            })
    }

    /// Move `task_id` from the pool into `active_claims` under `claim.agent_id`.
    pub fn claim(&mut self, task_id: &str, mut claim: Claim) -> Result<Claim, StoreError> {
        if let Some(holder) = self
            .active_claims
            .items
            .values()
            .find(|record| record.claim.task_id == task_id)
        {
            return Err(StoreError::ClaimConflict {
                task_id: task_id.to_string(),
                holder: Some(holder.claim.agent_id.clone()),
            });
        }
        if self.active_claims.items.contains_key(&claim.agent_id) {
            return Err(StoreError::ClaimConflict {
                task_id: task_id.to_string(),
                holder: Some(claim.agent_id.clone()),
            });
        }

        let index = self
            .available_tasks
            .items
            .iter()
            .position(|task| task.id == task_id)
            .ok_or_else(|| StoreError::task_not_found(task_id))?;

        let resources = &self.available_tasks.items[index].locked_resources;
        if let Some(holder) = self
            .active_claims
            .items
            .values()
            .find(|record| record.claim.conflicts_with(resources))
        {
            return Err(StoreError::ResourceConflict {
                task_id: task_id.to_string(),
                holder: holder.claim.agent_id.clone(),
                resources: holder
                    .claim
                    .locked_resources
                    .intersection(resources)
                    .cloned()
                    .collect(),
            });
        }

        let task = self.available_tasks.items.remove(index);
        claim.task_id = task.id.clone();
        claim.locked_resources = task.locked_resources.clone();
        self.active_claims.items.insert(
            claim.agent_id.clone(),
            ClaimRecord {
                claim: claim.clone(),
                task,
            },
        );
        Ok(claim)
    }

    pub fn heartbeat(&mut self, agent_id: &str, at: DateTime<Utc>) -> Result<Claim, StoreError> {
        let record = self
            .active_claims
            .items
            .get_mut(agent_id)
            .ok_or_else(|| StoreError::agent_not_found(agent_id))?;

        record.claim.status = record.claim.status.apply(ClaimEvent::Heartbeat)?;
        record.claim.heartbeat = Some(at);
        Ok(record.claim.clone())
    }

    /// End `agent_id`'s claim. Completed work leaves the pool; abandoned work
    /// returns to it. Either way the terminal record waits in `completed_work`
    /// for the archival sweep.
    pub fn release(
        &mut self,
        agent_id: &str,
        outcome: ReleaseOutcome,
        at: DateTime<Utc>,
    ) -> Result<ClaimRecord, StoreError> {
        let current = self
            .active_claims
            .items
            .get(agent_id)
            .ok_or_else(|| StoreError::agent_not_found(agent_id))?;

        if let ReleaseOutcome::Reclaimed { observed_heartbeat } = outcome {
            if current.claim.heartbeat > observed_heartbeat {
                return Err(StoreError::ClaimConflict {
                    task_id: current.claim.task_id.clone(),
                    holder: Some(agent_id.to_string()),
                });
            }
        }

        let mut record = self
            .active_claims
            .items
            .remove(agent_id)
            .ok_or_else(|| StoreError::agent_not_found(agent_id))?;
        record.claim.finish(outcome.event(), at)?;
        record.claim.abandonment_reason = outcome.abandon_reason();

        if !matches!(outcome, ReleaseOutcome::Completed) {
            self.available_tasks.items.push(record.task.clone());
        }
        self.completed_work.items.push(record.clone());
        Ok(record)
    }

    pub fn active_claims(&self) -> Vec<ClaimRecord> {
        self.active_claims.items.values().cloned().collect()
    }

    pub fn terminal_claims(&self) -> Vec<ClaimRecord> {
        self.completed_work.items.clone()
    }

    /// Move every terminal record of `task_id` into `archived`.
    pub fn archive(&mut self, task_id: &str, at: DateTime<Utc>) -> Result<usize, StoreError> {
        let (matching, remaining): (Vec<_>, Vec<_>) = std::mem::take(&mut self.completed_work.items)
            .into_iter()
            .partition(|record| record.task.id == task_id);
        self.completed_work.items = remaining;

        if matching.is_empty() {
            return Err(StoreError::NotFound {
                kind: "terminal record for task",
                id: task_id.to_string(),
            });
        }

        let moved = matching.len();
        self.archived
            .items
            .extend(matching.into_iter().map(|record| ArchivedRecord {
                task: record.task,
                claim: Some(record.claim),
                archived_at: at,
                extra: BTreeMap::new(),
            }));
        Ok(moved)
    }
}
