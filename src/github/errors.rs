use octocrab::Error as OctocrabError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHubError {
    #[error("GitHub token not found: {0}. Set GITHUB_TOKEN or github.token in conductor.toml")]
    TokenNotFound(String),

    #[error("GitHub repository not configured: {0}. Set github.owner and github.repo")]
    ConfigNotFound(String),

    #[error("issue #{0} not found")]
    IssueNotFound(u64),

    #[error("GitHub API error: {}", describe(.0))]
    ApiError(#[from] OctocrabError),
}

fn describe(err: &OctocrabError) -> String {
    match err {
        OctocrabError::GitHub { source, .. } => {
            format!("HTTP {}: {}", source.status_code, source.message)
        }
        OctocrabError::Http { .. } => "network connection to the GitHub API failed".to_string(),
        other => other.to_string(),
    }
}

impl GitHubError {
    pub fn status_code(&self) -> Option<u16> {
        match self {
            GitHubError::ApiError(OctocrabError::GitHub { source, .. }) => {
                Some(source.status_code.as_u16())
            }
            _ => None,
        }
    }

    /// Server errors, rate limits and dropped connections are worth another try.
    /// Auth, validation and missing resources are not.
    pub fn is_transient(&self) -> bool {
        match self {
            GitHubError::ApiError(OctocrabError::GitHub { source, .. }) => {
                let code = source.status_code.as_u16();
                let message = source.message.to_lowercase();
                code >= 500 || code == 429 || (code == 403 && message.contains("rate limit"))
            }
            GitHubError::ApiError(OctocrabError::Http { .. }) => true,
            GitHubError::ApiError(other) => {
                let text = other.to_string().to_lowercase();
                text.contains("timed out") || text.contains("timeout") || text.contains("connection")
            }
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, GitHubError::IssueNotFound(_)) || self.status_code() == Some(404)
    }
}
