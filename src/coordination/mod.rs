pub mod coordinator;
pub mod health;
pub mod liveness;
pub mod matcher;
pub mod reclaim;

pub use coordinator::{ClaimCoordinator, ClaimOutcome, HeartbeatOutcome};
pub use health::{HealthAggregator, HealthGrade, HealthScore, HealthSignals, SystemSnapshot};
pub use liveness::{LivenessMonitor, LivenessReport};
pub use matcher::{ScoredTask, TaskMatcher};
pub use reclaim::{ArchiveReport, ArchiveSweeper, ReclaimNotice, ReclaimProcessor, SweepReport};
