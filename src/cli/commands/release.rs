use anyhow::Result;
use serde_json::json;

use super::{CommandContext, CommandOutcome};

/// Ends a claim. Serves both `release` and `complete`.
pub struct ReleaseCommand {
    pub agent_id: String,
    pub abandon: bool,
}

impl ReleaseCommand {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            abandon: false,
        }
    }

    pub fn with_abandon(mut self, abandon: bool) -> Self {
        self.abandon = abandon;
        self
    }

    pub async fn execute(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        let coordinator = ctx.coordinator();
        let record = if self.abandon {
            coordinator.release(&self.agent_id).await?
        } else {
            coordinator.complete(&self.agent_id).await?
        };

        Ok(CommandOutcome::success(json!({
            "status": record.claim.status,
            "agent_id": record.claim.agent_id,
            "task_id": record.task.id,
            "completed_at": record.claim.completed_at,
            "abandonment_reason": record.claim.abandonment_reason,
        })))
    }
}
