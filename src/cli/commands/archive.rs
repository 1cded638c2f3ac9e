use anyhow::Result;
use serde_json::json;

use super::{with_status, CommandContext, CommandOutcome};
use crate::config;
use crate::coordination::ArchiveSweeper;

pub struct ArchiveCommand {
    pub max_age_days: Option<u64>,
    pub dry_run: bool,
}

impl ArchiveCommand {
    pub fn new(dry_run: bool) -> Self {
        Self {
            max_age_days: None,
            dry_run,
        }
    }

    pub fn with_max_age_days(mut self, days: Option<u64>) -> Self {
        self.max_age_days = days;
        self
    }

    pub async fn execute(&self, ctx: &CommandContext) -> Result<CommandOutcome> {
        let retention = match self.max_age_days {
            Some(days) => config::days(days)?,
            None => ctx.config.retention()?,
        };

        let report = ArchiveSweeper::new(ctx.store.clone(), ctx.clock.clone(), retention)
            .sweep(self.dry_run)
            .await?;

        let mut body = with_status("ok", serde_json::to_value(&report)?);
        body["archived_count"] = json!(report.archived.len());
        Ok(CommandOutcome::success(body))
    }
}
