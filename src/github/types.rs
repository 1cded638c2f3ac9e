use chrono::{DateTime, Utc};

/// The slice of a tracker issue the task store reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerIssue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub assignees: Vec<String>,
    pub open: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl TrackerIssue {
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Values of every label starting with `prefix`, prefix stripped.
    pub fn label_values<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.labels
            .iter()
            .filter_map(move |label| label.strip_prefix(prefix))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerComment {
    pub id: u64,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueQueryState {
    Open,
    Closed,
    All,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_values_strip_prefix() {
        let issue = TrackerIssue {
            number: 1,
            title: "t".into(),
            body: String::new(),
            labels: vec!["skill:security".into(), "skill: api".into(), "skill:".into(), "bug".into()],
            assignees: vec![],
            open: true,
            created_at: Utc::now(),
            closed_at: None,
        };
        let skills: Vec<_> = issue.label_values("skill:").collect();
        assert_eq!(skills, vec!["security", "api"]);
        assert!(issue.has_label("bug"));
    }
}
