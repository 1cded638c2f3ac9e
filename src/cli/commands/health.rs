use anyhow::Result;
use tracing::warn;

use super::{CommandContext, CommandOutcome};
use crate::coordination::HealthAggregator;

pub struct HealthCommand {
    pub json: bool,
}

impl HealthCommand {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub async fn execute(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        let aggregator =
            HealthAggregator::new(ctx.config.health.clone(), ctx.config.stale_timeout()?);
        let snapshot = aggregator
            .collect(ctx.store.as_ref(), ctx.clock.as_ref())
            .await?;

        // The status block is a convenience mirror; failing to write it is not fatal.
        if let Err(err) = ctx.store.publish_status(&snapshot).await {
            warn!(error = %err, "Failed to publish health snapshot");
        }

        if self.json {
            Ok(CommandOutcome::success(serde_json::to_value(&snapshot)?))
        } else {
            Ok(CommandOutcome::text(snapshot.summary()))
        }
    }
}
