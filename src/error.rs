use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures a pipeline stage can report.
///
/// Everything except `Tool` and `Io` maps onto a named class of the run's
/// error taxonomy; `kind()` exposes that name for summaries and audit logs.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("checkout of '{repository}' failed: {reason}")]
    Checkout { repository: String, reason: String },

    #[error("stage '{stage}' failed its quality gate: {reason}")]
    BlockingScan { stage: String, reason: String },

    #[error("image build failed: {0}")]
    Build(String),

    #[error(
        "publishing '{failed_tag}' failed after pushing [{}]: {reason}",
        .pushed.join(", ")
    )]
    Publish {
        pushed: Vec<String>,
        failed_tag: String,
        reason: String,
    },

    #[error("no image reference for '{app}' found in {}", .path.display())]
    ManifestNotFound { path: PathBuf, app: String },

    #[error("push to '{branch}' was rejected: {reason}")]
    GitConflict { branch: String, reason: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("credential '{id}' unavailable: {reason}")]
    Credential { id: String, reason: String },

    #[error("{tool}: {reason}")]
    Tool { tool: String, reason: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        PipelineError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        PipelineError::Tool {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "ConfigError",
            PipelineError::Checkout { .. } => "CheckoutError",
            PipelineError::BlockingScan { .. } => "BlockingScanFailure",
            PipelineError::Build(_) => "BuildError",
            PipelineError::Publish { .. } => "PublishError",
            PipelineError::ManifestNotFound { .. } => "ManifestNotFoundError",
            PipelineError::GitConflict { .. } => "GitConflictError",
            PipelineError::Auth(_) => "AuthError",
            PipelineError::Credential { .. } => "CredentialError",
            PipelineError::Tool { .. } => "ToolError",
            PipelineError::Io { .. } => "IoError",
        }
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_error_lists_pushed_tags() {
        let err = PipelineError::Publish {
            pushed: vec!["asa96/app:42".into()],
            failed_tag: "asa96/app:latest".into(),
            reason: "denied".into(),
        };
        let message = err.to_string();
        assert!(message.contains("asa96/app:42"));
        assert!(message.contains("asa96/app:latest"));
        assert_eq!(err.kind(), "PublishError");
    }
}
