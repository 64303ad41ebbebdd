use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort a review load.
///
/// Parse-level anomalies (malformed refs, stale comment lines) and user
/// cancellation never show up here; they are handled where they occur.
#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("no git repository found")]
    NoRepositoryFound,

    #[error("git {command} failed: {stderr}")]
    GitCommandFailed { command: String, stderr: String },

    #[error("no remote found in {}", root.display())]
    NoRemoteFound { root: PathBuf },

    #[error("no change found for commit {commit}")]
    NoChangeForCommit { commit: String },

    #[error("review service unavailable: {0}")]
    ReviewServiceUnavailable(String),

    #[error("review service url is not configured")]
    ReviewServiceMisconfigured,

    /// The response did not follow the `)]}'` JSON envelope.
    #[error("unexpected review service response: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, ReviewError>;
