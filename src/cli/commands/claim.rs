use anyhow::Result;
use serde_json::json;

use super::{CommandContext, CommandOutcome};
use crate::coordination::ClaimOutcome;

pub struct ClaimCommand {
    pub role: String,
    pub task_id: Option<String>,
}

impl ClaimCommand {
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            task_id: None,
        }
    }

    pub fn with_task_id(mut self, task_id: Option<String>) -> Self {
        self.task_id = task_id;
        self
    }

    pub async fn execute(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        let outcome = ctx
            .coordinator()
            .claim(&self.role, self.task_id.as_deref())
            .await?;

        Ok(match outcome {
            ClaimOutcome::Claimed { claim, task, score } => CommandOutcome::success(json!({
                "status": "claimed",
                "agent_id": claim.agent_id,
                "task_id": task.id,
                "score": score,
                "claimed_at": claim.claimed_at,
                "task": task,
            })),
            ClaimOutcome::Idle { message } => CommandOutcome::success(json!({
                "status": "idle",
                "role": self.role,
                "message": message,
            })),
        })
    }
}
