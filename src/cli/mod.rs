use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ConductorConfig, MAX_RETENTION_DAYS, MAX_TIMEOUT_MINUTES};
use crate::store::Backend;

pub mod commands;

#[derive(Parser, Debug)]
#[command(name = "conductor", version)]
#[command(about = "Coordinate exclusive task claims across independent agents")]
#[command(long_about = "Conductor hands out tasks from a shared pool to agents by role, tracks \
                       their heartbeats, and returns abandoned work to the pool. Every command \
                       prints one JSON result object on stdout; logs go to stderr.")]
pub struct Cli {
    /// Configuration file (defaults to ./conductor.toml when present)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Task store backend
    #[arg(long, global = true, value_name = "local|github")]
    pub backend: Option<Backend>,

    /// State document for the local backend
    #[arg(long, global = true, value_name = "PATH")]
    pub state_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Claim the best available task for a role
    Claim {
        /// Role of the requesting agent, e.g. frontend, security, dev
        #[arg(long)]
        role: String,
        /// Claim this task instead of matching
        #[arg(long, help = "Claim a specific task id instead of the best match")]
        task_id: Option<String>,
    },
    /// Refresh the liveness timestamp of a claim
    Heartbeat {
        #[arg(long)]
        agent_id: String,
    },
    /// Finish a claim; with --abandon the task returns to the pool
    Release {
        #[arg(long)]
        agent_id: String,
        #[arg(long, help = "Give the task back instead of marking it completed")]
        abandon: bool,
    },
    /// Mark a claim completed
    Complete {
        #[arg(long)]
        agent_id: String,
    },
    /// Reclaim claims whose heartbeat is older than the timeout
    SweepStale {
        /// Staleness timeout in minutes (overrides liveness.stale_timeout_minutes)
        #[arg(long, value_name = "MINUTES",
              value_parser = clap::value_parser!(u64).range(1..=MAX_TIMEOUT_MINUTES))]
        timeout: Option<u64>,
        #[arg(long, help = "Report stale claims without reclaiming them")]
        dry_run: bool,
    },
    /// Report pool health
    Health {
        #[arg(long, help = "Print the full snapshot as JSON")]
        json: bool,
    },
    /// Archive terminal records older than the retention window
    Archive {
        /// Retention in days (overrides archive.retention_days)
        #[arg(long, value_name = "DAYS",
              value_parser = clap::value_parser!(u64).range(1..=MAX_RETENTION_DAYS))]
        max_age: Option<u64>,
        #[arg(long, help = "Show what would be archived without making changes")]
        dry_run: bool,
    },
}

impl Cli {
    /// Fold global flags over the loaded configuration.
    pub fn apply_overrides(&self, config: &mut ConductorConfig) {
        if let Some(backend) = self.backend {
            config.store.backend = backend;
        }
        if let Some(path) = &self.state_file {
            config.store.state_file = path.clone();
        }
    }
}
