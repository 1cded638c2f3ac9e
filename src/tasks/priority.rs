use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Urgency of a task in the shared pool.
/// Declared lowest first so the derived ordering reads naturally: `Critical > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// priority:low
    Low,
    /// priority:medium, also the value for unlabeled tasks
    #[default]
    Medium,
    /// priority:high
    High,
    /// priority:critical
    Critical,
}

pub const PRIORITY_LABEL_PREFIX: &str = "priority:";

impl Priority {
    /// Determine priority from tracker labels. The highest `priority:` label wins;
    /// unknown values are ignored.
    pub fn from_labels(labels: &[impl AsRef<str>]) -> Self {
        labels
            .iter()
            .filter_map(|label| label.as_ref().strip_prefix(PRIORITY_LABEL_PREFIX))
            .filter_map(|value| value.parse::<Priority>().ok())
            .max()
            .unwrap_or_default()
    }

    /// Matcher bonus for this priority. Strictly decreasing from critical to low.
    pub fn bonus(self) -> i64 {
        match self {
            Priority::Critical => 40,
            Priority::High => 30,
            Priority::Medium => 20,
            Priority::Low => 10,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    pub fn label(self) -> String {
        format!("{PRIORITY_LABEL_PREFIX}{}", self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        };
        write!(f, "{}", label)
    }
}
