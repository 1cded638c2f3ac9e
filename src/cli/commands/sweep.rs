use anyhow::Result;
use serde_json::json;

use super::{with_status, CommandContext, CommandOutcome};
use crate::config;
use crate::coordination::{LivenessMonitor, ReclaimProcessor};

pub struct SweepStaleCommand {
    pub timeout_minutes: Option<u64>,
    pub dry_run: bool,
}

impl SweepStaleCommand {
    pub fn new(dry_run: bool) -> Self {
        Self {
            timeout_minutes: None,
            dry_run,
        }
    }

    pub fn with_timeout_minutes(mut self, minutes: Option<u64>) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub async fn execute(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        let timeout = match self.timeout_minutes {
            Some(minutes) => config::minutes(minutes)?,
            None => ctx.config.stale_timeout()?,
        };

        let processor =
            ReclaimProcessor::new(ctx.store.clone(), ctx.clock.clone(), LivenessMonitor::new(timeout))
                .with_retry(ctx.retry());
        let report = processor.sweep(self.dry_run).await?;

        let mut body = with_status("ok", serde_json::to_value(&report)?);
        body["reclaimed_count"] = json!(report.reclaimed.len());
        body["timeout_minutes"] = json!(timeout.num_minutes());
        Ok(CommandOutcome::success(body))
    }
}
