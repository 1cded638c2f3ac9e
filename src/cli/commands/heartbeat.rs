use anyhow::Result;
use serde_json::json;

use super::{CommandContext, CommandOutcome};
use crate::coordination::HeartbeatOutcome;

pub struct HeartbeatCommand {
    pub agent_id: String,
}

impl HeartbeatCommand {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }

    /// A lost claim is reported as `lost` with a failing exit code so the
    /// agent stops work.
    pub async fn execute(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        Ok(match ctx.coordinator().heartbeat(&self.agent_id).await? {
            HeartbeatOutcome::Alive { claim } => CommandOutcome::success(json!({
                "status": "ok",
                "agent_id": claim.agent_id,
                "task_id": claim.task_id,
                "claim_status": claim.status,
                "heartbeat": claim.heartbeat,
            })),
            HeartbeatOutcome::Lost { agent_id, message } => CommandOutcome::failure(json!({
                "status": "lost",
                "agent_id": agent_id,
                "message": message,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{context, start};
    use super::super::ClaimCommand;
    use super::*;
    use crate::tasks::Task;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_heartbeat_moves_claim_in_progress() {
        let dir = TempDir::new().unwrap();
        let (ctx, clock) = context(&dir, vec![Task::new("1", "Fix login", start())]).await;
        let claimed = ClaimCommand::new("dev").execute(&ctx).await.unwrap();
        let agent_id = claimed.body().unwrap()["agent_id"].as_str().unwrap().to_string();

        clock.advance(chrono::Duration::minutes(5));
        let outcome = HeartbeatCommand::new(&agent_id).execute(&ctx).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.status(), Some("ok"));
        assert_eq!(outcome.body().unwrap()["claim_status"], "in_progress");
    }

    #[tokio::test]
    async fn test_unknown_agent_is_lost() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = context(&dir, Vec::new()).await;

        let outcome = HeartbeatCommand::new("dev_deadbeef").execute(&ctx).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status(), Some("lost"));
    }
}
