//! Source checkout and manifest change publication via the `git` CLI.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tracing::{info, instrument};

use crate::credentials::CredentialBindings;
use crate::error::{PipelineError, Result};
use crate::tools::{ToolInvocation, ToolOutput, ToolRunner};

const DEFAULT_REMOTE: &str = "origin";
const DEFAULT_AUTHOR: (&str, &str) = ("shipyard", "shipyard@localhost");
const TOKEN_USERNAME: &str = "git";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitChange {
    pub paths: Vec<PathBuf>,
    pub message: String,
    pub branch: String,
    /// `None` when the paths had nothing to commit.
    pub commit: Option<String>,
}

/// Shallow clone of `branch` into `destination`.
#[instrument(skip(tools))]
pub fn checkout(
    tools: &dyn ToolRunner,
    repository: &str,
    branch: &str,
    destination: &Path,
) -> Result<()> {
    let output = tools
        .run(
            &ToolInvocation::new("git")
                .args(["clone", "--depth", "1", "--branch", branch, repository])
                .arg(destination.to_string_lossy().to_string()),
        )
        .map_err(|err| PipelineError::Checkout {
            repository: repository.to_string(),
            reason: err.to_string(),
        })?;
    if !output.success() {
        return Err(PipelineError::Checkout {
            repository: repository.to_string(),
            reason: output.error_text(),
        });
    }
    info!(repository, branch, "Source checked out");
    Ok(())
}

pub struct ChangePublisher<'a> {
    tools: &'a dyn ToolRunner,
    repo_dir: PathBuf,
    remote: String,
    author: (String, String),
}

impl<'a> ChangePublisher<'a> {
    pub fn new(tools: &'a dyn ToolRunner, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            repo_dir: repo_dir.into(),
            remote: DEFAULT_REMOTE.to_string(),
            author: (DEFAULT_AUTHOR.0.to_string(), DEFAULT_AUTHOR.1.to_string()),
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author = (name.into(), email.into());
        self
    }

    /// Stages `paths`, creates one commit and pushes it to `branch`.
    /// A rejected push is surfaced as a conflict; nothing is merged or retried.
    #[instrument(skip(self, paths, credential), fields(repo = %self.repo_dir.display()))]
    pub fn commit_and_push(
        &self,
        paths: &[PathBuf],
        message: &str,
        branch: &str,
        credential: &CredentialBindings,
    ) -> Result<CommitChange> {
        if paths.is_empty() {
            return Err(PipelineError::Config("no paths to commit".into()));
        }
        let path_args: Vec<String> = paths
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();

        self.git_ok("git add", self.git().args(["add", "--"]).args(path_args.clone()))?;

        let staged = self.git().args(["diff", "--cached", "--quiet", "--"]).args(path_args);
        if self.tools.run(&staged)?.success() {
            info!(branch, "Nothing to commit, manifest already up to date");
            return Ok(CommitChange {
                paths: paths.to_vec(),
                message: message.to_string(),
                branch: branch.to_string(),
                commit: None,
            });
        }

        self.git_ok(
            "git commit",
            self.git()
                .arg("-c")
                .arg(format!("user.name={}", self.author.0))
                .arg("-c")
                .arg(format!("user.email={}", self.author.1))
                .args(["commit", "-m", message]),
        )?;
        let commit = self.git_ok("git rev-parse", self.git().args(["rev-parse", "HEAD"]))?;
        let commit = commit.stdout.trim().to_string();

        let push = self
            .git()
            .args(["push", self.remote.as_str()])
            .arg(format!("HEAD:refs/heads/{branch}"));
        let push = with_auth_header(push, credential)?;
        let output = self.tools.run(&push)?;
        if !output.success() {
            return Err(classify_push_failure(branch, &output));
        }

        info!(branch, commit = %commit, "Manifest change pushed");
        Ok(CommitChange {
            paths: paths.to_vec(),
            message: message.to_string(),
            branch: branch.to_string(),
            commit: Some(commit),
        })
    }

    fn git(&self) -> ToolInvocation {
        ToolInvocation::new("git").current_dir(&self.repo_dir)
    }

    fn git_ok(&self, context: &str, invocation: ToolInvocation) -> Result<ToolOutput> {
        let output = self.tools.run(&invocation)?;
        if !output.success() {
            return Err(PipelineError::tool(context, output.error_text()));
        }
        Ok(output)
    }
}

/// Passes an HTTP basic authorization header through git's environment
/// config so the token stays off the command line and out of the remote URL.
fn with_auth_header(
    invocation: ToolInvocation,
    credential: &CredentialBindings,
) -> Result<ToolInvocation> {
    let secret = credential.secret()?;
    let username = credential
        .username()?
        .unwrap_or_else(|| TOKEN_USERNAME.to_string());
    let token = STANDARD.encode(format!("{username}:{}", secret.expose()));
    Ok(invocation
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_CONFIG_COUNT", "1")
        .env("GIT_CONFIG_KEY_0", "http.extraHeader")
        .env("GIT_CONFIG_VALUE_0", format!("Authorization: Basic {token}")))
}

fn classify_push_failure(branch: &str, output: &ToolOutput) -> PipelineError {
    let text = output.error_text();
    let lowered = text.to_lowercase();
    if ["[rejected]", "non-fast-forward", "fetch first", "[remote rejected]"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        PipelineError::GitConflict {
            branch: branch.to_string(),
            reason: text,
        }
    } else if [
        "authentication failed",
        "could not read username",
        "permission denied",
        "403",
        "401",
    ]
    .iter()
    .any(|marker| lowered.contains(marker))
    {
        PipelineError::Auth(text)
    } else {
        PipelineError::tool("git push", text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{StaticCredentialStore, with_credential};
    use crate::tools::ScriptedRunner;

    fn store() -> StaticCredentialStore {
        StaticCredentialStore::new().with("github", Some("asa96"), "ghp_token")
    }

    fn publish(runner: &ScriptedRunner) -> Result<CommitChange> {
        with_credential(&store(), "github", |credential| {
            ChangePublisher::new(runner, "/work").commit_and_push(
                &[PathBuf::from("Kubernetes/deployment.yml")],
                "Update deployment image to 42",
                "main",
                credential,
            )
        })
    }

    #[test]
    fn commits_and_pushes_with_header_in_env() {
        let runner = ScriptedRunner::new()
            .respond(&["git", "diff"], ToolOutput::failed(1, ""))
            .respond(&["git", "rev-parse"], ToolOutput::ok("abc123\n"));

        let change = publish(&runner).unwrap();
        assert_eq!(change.commit.as_deref(), Some("abc123"));

        let calls = runner.calls();
        let push = calls.last().unwrap();
        assert_eq!(push.command_line(), "git push origin HEAD:refs/heads/main");
        assert!(!push.command_line().contains("ghp_token"));
        let header = push
            .env
            .iter()
            .find(|(key, _)| key == "GIT_CONFIG_VALUE_0")
            .map(|(_, value)| value.clone())
            .unwrap();
        assert_eq!(
            header,
            format!("Authorization: Basic {}", STANDARD.encode("asa96:ghp_token"))
        );
    }

    #[test]
    fn unchanged_paths_skip_commit_and_push() {
        let runner = ScriptedRunner::new();
        let change = publish(&runner).unwrap();
        assert!(change.commit.is_none());
        assert!(!runner.command_lines().iter().any(|line| line.contains("push")));
    }

    #[test]
    fn rejected_push_is_a_conflict() {
        let runner = ScriptedRunner::new()
            .respond(&["git", "diff"], ToolOutput::failed(1, ""))
            .respond(
                &["git", "push"],
                ToolOutput::failed(
                    1,
                    " ! [rejected]        HEAD -> main (fetch first)\nerror: failed to push some refs",
                ),
            );
        let err = publish(&runner).unwrap_err();
        assert_eq!(err.kind(), "GitConflictError");
    }

    #[test]
    fn authentication_failure_is_auth_error() {
        let runner = ScriptedRunner::new()
            .respond(&["git", "diff"], ToolOutput::failed(1, ""))
            .respond(
                &["git", "push"],
                ToolOutput::failed(128, "fatal: Authentication failed for 'https://github.com/x'"),
            );
        assert_eq!(publish(&runner).unwrap_err().kind(), "AuthError");
    }

    #[test]
    fn checkout_failure_is_checkout_error() {
        let runner = ScriptedRunner::new()
            .respond(&["git", "clone"], ToolOutput::failed(128, "repository not found"));
        let err = checkout(&runner, "https://example.com/x.git", "main", Path::new("/w"))
            .unwrap_err();
        assert_eq!(err.kind(), "CheckoutError");
    }
}
