pub mod client;
pub mod errors;
#[cfg(any(test, feature = "testing"))]
pub mod mocks;
pub mod types;

pub use client::{GitHubClient, IssueTracker};
pub use errors::GitHubError;
pub use types::{IssueQueryState, TrackerComment, TrackerIssue};
