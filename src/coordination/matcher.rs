use serde::Serialize;
use std::collections::{BTreeSet, HashSet};

use crate::tasks::Task;

pub const SKILL_MATCH_BONUS: i64 = 100;
pub const GENERALIST_GENERAL_BONUS: i64 = 50;
pub const SPECIALIST_GENERAL_BONUS: i64 = 10;
pub const AFFINITY_BONUS: i64 = 25;
pub const BOOTSTRAP_BONUS: i64 = 200;

/// Related keywords per role. A hit in a task's skills, title or description
/// earns partial credit when the role is not an exact required skill.
const ROLE_AFFINITY: &[(&str, &[&str])] = &[
    ("frontend", &["ui", "react", "css", "html", "frontend", "component", "vue"]),
    ("backend", &["api", "server", "database", "backend", "endpoint"]),
    ("devops", &["ci", "cd", "docker", "deploy", "infrastructure", "pipeline", "kubernetes"]),
    ("security", &["security", "auth", "vulnerability", "audit", "crypto"]),
    ("dev", &["feature", "bug", "refactor", "implement"]),
    ("ml-engineer", &["ml", "model", "training", "data"]),
    ("ui-designer", &["design", "ux", "ui", "figma"]),
    ("mobile", &["ios", "android", "mobile"]),
    ("data", &["etl", "analytics", "sql"]),
    ("code-reviewer", &["review"]),
];

fn affinity_keywords(role: &str) -> &'static [&'static str] {
    ROLE_AFFINITY
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(role))
        .map(|(_, keywords)| *keywords)
        .unwrap_or(&[])
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

/// Per-signal contributions to a task's score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScoreBreakdown {
    pub skill_match: i64,
    pub general: i64,
    pub affinity: i64,
    pub bootstrap: i64,
    pub priority: i64,
    pub effort: i64,
}

impl ScoreBreakdown {
    /// Signals that say this role should work on the task at all.
    pub fn relevance(&self) -> i64 {
        self.skill_match + self.general + self.affinity + self.bootstrap
    }

    /// Priority and effort only rank tasks that are already relevant.
    pub fn total(&self) -> i64 {
        let relevance = self.relevance();
        if relevance <= 0 {
            return 0;
        }
        relevance + self.priority + self.effort
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredTask {
    pub task: Task,
    pub score: i64,
    pub breakdown: ScoreBreakdown,
}

/// Scores available tasks for a requesting role.
#[derive(Debug, Clone)]
pub struct TaskMatcher {
    generalist_role: String,
}

impl Default for TaskMatcher {
    fn default() -> Self {
        Self::new("dev")
    }
}

impl TaskMatcher {
    pub fn new(generalist_role: impl Into<String>) -> Self {
        Self {
            generalist_role: generalist_role.into(),
        }
    }

    pub fn score(&self, role: &str, task: &Task) -> ScoreBreakdown {
        let mut breakdown = ScoreBreakdown {
            priority: task.priority.bonus(),
            effort: task.estimated_effort.bonus(),
            ..ScoreBreakdown::default()
        };

        let skill_match = task
            .required_skills
            .iter()
            .any(|skill| skill.eq_ignore_ascii_case(role));

        if skill_match {
            breakdown.skill_match = SKILL_MATCH_BONUS;
        } else if task.is_general() {
            breakdown.general = if role.eq_ignore_ascii_case(&self.generalist_role) {
                GENERALIST_GENERAL_BONUS
            } else {
                SPECIALIST_GENERAL_BONUS
            };
        }

        if !skill_match && self.has_affinity(role, task) {
            breakdown.affinity = AFFINITY_BONUS;
        }
        if task.is_bootstrap() {
            breakdown.bootstrap = BOOTSTRAP_BONUS;
        }
        breakdown
    }

    fn has_affinity(&self, role: &str, task: &Task) -> bool {
        let keywords = affinity_keywords(role);
        if keywords.is_empty() {
            return false;
        }
        let vocabulary: BTreeSet<String> = task
            .required_skills
            .iter()
            .map(|s| s.to_lowercase())
            .chain(words(&task.title))
            .chain(words(&task.description))
            .collect();
        keywords.iter().any(|keyword| vocabulary.contains(*keyword))
    }

    /// Candidates best first. Blocked and zero-score tasks are dropped; equal
    /// scores keep their input order.
    pub fn rank(&self, role: &str, tasks: &[Task]) -> Vec<ScoredTask> {
        let mut ranked: Vec<ScoredTask> = tasks
            .iter()
            .filter(|task| !task.is_blocked())
            .filter_map(|task| {
                let breakdown = self.score(role, task);
                let score = breakdown.total();
                (score > 0).then(|| ScoredTask {
                    task: task.clone(),
                    score,
                    breakdown,
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score));
        ranked
    }

    /// Best candidate not in `exclude`, or `None` when nothing suits the role.
    pub fn best(&self, role: &str, tasks: &[Task], exclude: &HashSet<String>) -> Option<ScoredTask> {
        self.rank(role, tasks)
            .into_iter()
            .find(|candidate| !exclude.contains(&candidate.task.id))
    }
}
