use crate::github::GitHubError;
use crate::tasks::TransitionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or the store lock could not be obtained in time.
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("task {task_id} is already claimed{}", holder.as_deref().map(|h| format!(" by {h}")).unwrap_or_default())]
    ClaimConflict {
        task_id: String,
        holder: Option<String>,
    },

    #[error("task {task_id} locks {resources:?}, already held by {holder}")]
    ResourceConflict {
        task_id: String,
        holder: String,
        resources: Vec<String>,
    },

    /// A remote claim failed after its first write and was undone. Retrying
    /// under the same agent id would never win arbitration.
    #[error("claim on task {task_id} was rolled back: {reason}")]
    ClaimRolledBack { task_id: String, reason: String },

    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    GitHub(#[from] GitHubError),

    #[error("task store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize task store: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn task_not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: "task",
            id: id.into(),
        }
    }

    pub fn agent_not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: "claim for agent",
            id: id.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::GitHub(err) => err.is_transient(),
            StoreError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Conflicts are expected under races and answered with a fresh match.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::ClaimConflict { .. } | StoreError::ResourceConflict { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("lock timeout".into()).is_transient());
        assert!(StoreError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_transient());
        assert!(!StoreError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied)).is_transient());
        assert!(!StoreError::task_not_found("7").is_transient());
        assert!(!StoreError::MalformedRecord("bad".into()).is_transient());
        assert!(!StoreError::ClaimRolledBack {
            task_id: "7".into(),
            reason: "HTTP 502".into(),
        }
        .is_transient());
    }

    #[test]
    fn test_conflict_display_names_holder() {
        let err = StoreError::ClaimConflict {
            task_id: "7".into(),
            holder: Some("dev_1234abcd".into()),
        };
        assert!(err.is_conflict());
        assert_eq!(err.to_string(), "task 7 is already claimed by dev_1234abcd");

        let anonymous = StoreError::ClaimConflict {
            task_id: "7".into(),
            holder: None,
        };
        assert_eq!(anonymous.to_string(), "task 7 is already claimed");
    }
}
