// Task Conductor - exclusive task claims for independent agents
// This exposes the core components for the CLI, tests and embedding

pub mod cli;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod github;
pub mod observability;
pub mod store;
pub mod tasks;
pub mod telemetry;

// Re-export key types for easy access
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ConductorConfig;
pub use coordination::{
    ArchiveSweeper, ClaimCoordinator, ClaimOutcome, HealthAggregator, HeartbeatOutcome,
    LivenessMonitor, ReclaimProcessor, SystemSnapshot, TaskMatcher,
};
pub use github::{GitHubClient, GitHubError, IssueTracker};
pub use observability::OperationTimer;
pub use store::{open_store, Backend, GitHubStore, LocalFileStore, StoreError, TaskFilter, TaskStore};
pub use tasks::{Claim, ClaimRecord, ClaimStatus, Effort, Priority, ReleaseOutcome, Task, TaskState};
pub use telemetry::{create_coordination_span, generate_correlation_id, init_telemetry};
