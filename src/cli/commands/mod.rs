use serde_json::{json, Value};
use std::fmt::Display;
use std::process::ExitCode;
use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::ConductorConfig;
use crate::coordination::{ClaimCoordinator, TaskMatcher};
use crate::store::{open_store, RetryPolicy, StoreError, TaskStore};

pub mod archive;
pub mod claim;
pub mod health;
pub mod heartbeat;
pub mod release;
pub mod sweep;

pub use archive::ArchiveCommand;
pub use claim::ClaimCommand;
pub use health::HealthCommand;
pub use heartbeat::HeartbeatCommand;
pub use release::ReleaseCommand;
pub use sweep::SweepStaleCommand;

/// Everything a command needs, built once in `main` and passed down.
pub struct CommandContext {
    pub config: ConductorConfig,
    pub store: Arc<dyn TaskStore>,
    pub clock: Arc<dyn Clock>,
}

impl CommandContext {
    pub fn new(config: ConductorConfig, store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    /// Open the configured backend against the system clock.
    pub async fn connect(config: ConductorConfig) -> Result<Self, StoreError> {
        let store = open_store(&config).await?;
        Ok(Self::new(config, store, Arc::new(SystemClock)))
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.retry)
    }

    pub fn coordinator(&self) -> ClaimCoordinator {
        ClaimCoordinator::new(
            self.store.clone(),
            TaskMatcher::new(self.config.claim.generalist_role.clone()),
            self.clock.clone(),
        )
        .with_retry(self.retry())
        .with_max_attempts(self.config.claim.max_attempts)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    Json(Value),
    Text(String),
}

/// Result of one command: what goes to stdout and whether it succeeded.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub output: Rendered,
    pub success: bool,
}

impl CommandOutcome {
    pub fn success(body: Value) -> Self {
        Self {
            output: Rendered::Json(body),
            success: true,
        }
    }

    pub fn failure(body: Value) -> Self {
        Self {
            output: Rendered::Json(body),
            success: false,
        }
    }

    pub fn text(text: String) -> Self {
        Self {
            output: Rendered::Text(text),
            success: true,
        }
    }

    /// Well-formed error object for anything that aborted the command.
    pub fn error(message: impl Display) -> Self {
        Self::failure(json!({
            "status": "error",
            "message": message.to_string(),
        }))
    }

    /// JSON body, if this outcome renders as JSON.
    pub fn body(&self) -> Option<&Value> {
        match &self.output {
            Rendered::Json(value) => Some(value),
            Rendered::Text(_) => None,
        }
    }

    pub fn status(&self) -> Option<&str> {
        self.body()?.get("status")?.as_str()
    }

    /// Print to stdout and hand back the process exit code.
    pub fn emit(&self) -> ExitCode {
        match &self.output {
            Rendered::Json(value) => println!("{value}"),
            Rendered::Text(text) => println!("{text}"),
        }
        if self.success {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

/// Body of a successful command with extra report fields merged in.
pub(crate) fn with_status(status: &str, report: Value) -> Value {
    let mut body = json!({ "status": status });
    if let (Some(target), Value::Object(fields)) = (body.as_object_mut(), report) {
        target.extend(fields);
    }
    body
}
