pub mod priority;
pub mod types;

pub use priority::Priority;
pub use types::{
    generate_agent_id, AbandonReason, ArchivedRecord, Claim, ClaimEvent, ClaimRecord, ClaimStatus,
    Effort, ReleaseOutcome, Task, TaskEntry, TaskState, TransitionError, BLOCKED_LABEL,
    BOOTSTRAP_LABEL,
};
