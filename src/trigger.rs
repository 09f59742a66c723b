use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// What started a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Trigger {
    #[default]
    Manual,
    Webhook {
        repository: String,
        branch: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        commit: Option<String>,
    },
}

impl Trigger {
    pub fn repository(&self) -> Option<&str> {
        match self {
            Trigger::Manual => None,
            Trigger::Webhook { repository, .. } => Some(repository),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            Trigger::Manual => None,
            Trigger::Webhook { branch, .. } => Some(branch),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushEvent {
    #[serde(rename = "ref")]
    git_ref: String,
    #[serde(default)]
    after: Option<String>,
    repository: EventRepository,
}

#[derive(Debug, Deserialize)]
struct EventRepository {
    #[serde(default)]
    clone_url: Option<String>,
    #[serde(default)]
    git_http_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

/// Parses a push-event webhook body (GitHub and GitLab shapes).
pub fn parse_webhook(payload: &str) -> Result<Trigger> {
    let event: PushEvent = serde_json::from_str(payload)
        .map_err(|err| PipelineError::Config(format!("invalid webhook payload: {err}")))?;

    let branch = event
        .git_ref
        .strip_prefix("refs/heads/")
        .filter(|branch| !branch.is_empty())
        .ok_or_else(|| {
            PipelineError::Config(format!(
                "webhook ref '{}' is not a branch push",
                event.git_ref
            ))
        })?;
    let repository = event
        .repository
        .clone_url
        .or(event.repository.git_http_url)
        .or(event.repository.url)
        .ok_or_else(|| PipelineError::Config("webhook payload has no repository URL".into()))?;

    Ok(Trigger::Webhook {
        repository,
        branch: branch.to_string(),
        commit: event.after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_push_event_yields_branch_and_repository() {
        let payload = r#"{
            "ref": "refs/heads/main",
            "after": "9f1c2e",
            "repository": {"clone_url": "https://github.com/asa96/netflix-clone.git"}
        }"#;
        let trigger = parse_webhook(payload).unwrap();
        assert_eq!(trigger.branch(), Some("main"));
        assert_eq!(
            trigger.repository(),
            Some("https://github.com/asa96/netflix-clone.git")
        );
    }

    #[test]
    fn tag_pushes_are_rejected() {
        let payload = r#"{"ref": "refs/tags/v1", "repository": {"url": "x"}}"#;
        assert_eq!(parse_webhook(payload).unwrap_err().kind(), "ConfigError");
    }

    #[test]
    fn gitlab_payload_uses_http_url() {
        let payload = r#"{
            "ref": "refs/heads/release/1.2",
            "repository": {"git_http_url": "https://gitlab.com/a/b.git"}
        }"#;
        let trigger = parse_webhook(payload).unwrap();
        assert_eq!(trigger.branch(), Some("release/1.2"));
        assert_eq!(trigger.repository(), Some("https://gitlab.com/a/b.git"));
    }
}
