use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::trigger::Trigger;

pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Credential ids for the roles the stages know about. Stage parameters may
/// name a role (`registry`, `source-repo`, `code-quality`, `api-key`) or a
/// literal credential id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl CredentialIds {
    pub fn role(&self, name: &str) -> Option<&str> {
        let id = match name.replace('_', "-").as_str() {
            "code-quality" => &self.code_quality,
            "registry" => &self.registry,
            "source-repo" => &self.source_repo,
            "api-key" => &self.api_key,
            _ => return None,
        };
        id.as_deref()
    }

    pub fn lookup(&self, reference: &str) -> String {
        self.role(reference).unwrap_or(reference).to_string()
    }

    pub fn is_declared(&self, reference: &str) -> bool {
        self.role(reference).is_some()
            || [
                &self.code_quality,
                &self.registry,
                &self.source_repo,
                &self.api_key,
            ]
            .iter()
            .any(|id| id.as_deref() == Some(reference))
    }
}

/// Immutable per-run configuration handed to every stage.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub build_id: String,
    pub app_name: String,
    pub registry_server: String,
    pub registry_account: String,
    pub repository: Option<String>,
    pub branch: String,
    pub workspace: PathBuf,
    pub credentials: CredentialIds,
    pub trigger: Trigger,
}

impl RunConfig {
    /// `account/app`, prefixed with the registry host unless it's Docker Hub.
    pub fn image(&self) -> String {
        if self.registry_server == DEFAULT_REGISTRY {
            format!("{}/{}", self.registry_account, self.app_name)
        } else {
            format!(
                "{}/{}/{}",
                self.registry_server, self.registry_account, self.app_name
            )
        }
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("build id", &self.build_id),
            ("application name", &self.app_name),
            ("registry account", &self.registry_account),
            ("branch", &self.branch),
        ];
        for (label, value) in required {
            if value.trim().is_empty() {
                return Err(PipelineError::Config(format!("{label} is required")));
            }
        }
        if !is_valid_tag(&self.build_id) {
            return Err(PipelineError::Config(format!(
                "build id '{}' is not a valid image tag",
                self.build_id
            )));
        }
        Ok(())
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }

    /// Substitutes `{app}`, `{build_id}`, `{image}`, `{branch}`,
    /// `{registry_account}` and `{workspace}`.
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{app}", &self.app_name)
            .replace("{build_id}", &self.build_id)
            .replace("{image}", &self.image())
            .replace("{branch}", &self.branch)
            .replace("{registry_account}", &self.registry_account)
            .replace("{workspace}", &self.workspace.to_string_lossy())
    }
}

pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[cfg(test)]
pub(crate) fn sample_config(workspace: &Path) -> RunConfig {
    RunConfig {
        build_id: "42".into(),
        app_name: "netflix-clone-app".into(),
        registry_server: DEFAULT_REGISTRY.into(),
        registry_account: "asa96".into(),
        repository: Some("https://github.com/asa96/netflix-clone.git".into()),
        branch: "main".into(),
        workspace: workspace.to_path_buf(),
        credentials: CredentialIds {
            code_quality: Some("sonar-token".into()),
            registry: Some("docker-cred".into()),
            source_repo: Some("github".into()),
            api_key: Some("tmdb-key".into()),
        },
        trigger: Trigger::Manual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_coordinate_depends_on_registry() {
        let mut config = sample_config(Path::new("/tmp/ws"));
        assert_eq!(config.image(), "asa96/netflix-clone-app");
        config.registry_server = "ghcr.io".into();
        assert_eq!(config.image(), "ghcr.io/asa96/netflix-clone-app");
    }

    #[test]
    fn expand_substitutes_placeholders() {
        let config = sample_config(Path::new("/tmp/ws"));
        assert_eq!(
            config.expand("trivy image {image}:{build_id}"),
            "trivy image asa96/netflix-clone-app:42"
        );
    }

    #[test]
    fn credential_roles_resolve_to_ids() {
        let config = sample_config(Path::new("/tmp/ws"));
        assert_eq!(config.credentials.lookup("registry"), "docker-cred");
        assert_eq!(config.credentials.lookup("source_repo"), "github");
        assert_eq!(config.credentials.lookup("other-id"), "other-id");
        assert!(config.credentials.is_declared("tmdb-key"));
        assert!(!config.credentials.is_declared("other-id"));
    }

    #[test]
    fn validate_rejects_missing_inputs() {
        let mut config = sample_config(Path::new("/tmp/ws"));
        config.registry_account.clear();
        assert_eq!(config.validate().unwrap_err().kind(), "ConfigError");

        let mut config = sample_config(Path::new("/tmp/ws"));
        config.build_id = "build 7".into();
        assert!(config.validate().is_err());
    }
}
