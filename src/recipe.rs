use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::{CredentialIds, DEFAULT_REGISTRY, RunConfig};
use crate::pipeline::StageSpec;
use crate::trigger::Trigger;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub version: u32,
    pub application: ApplicationSpec,
    #[serde(default)]
    pub registry: RegistrySpec,
    #[serde(default)]
    pub source: SourceSpec,
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    #[serde(default)]
    pub credentials: CredentialIds,
    pub pipeline: Vec<StageSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify: Option<NotifySpec>,
    /// Directory relative paths in the recipe are resolved against.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySpec {
    #[serde(default = "default_registry")]
    pub server: String,
    #[serde(default)]
    pub account: String,
}

impl Default for RegistrySpec {
    fn default() -> Self {
        Self {
            server: default_registry(),
            account: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            repository: None,
            branch: default_branch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifySpec {
    #[serde(default = "default_notify_command")]
    pub command: Vec<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
    /// Glob patterns relative to the workspace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

/// Per-run values that take precedence over the recipe.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub build_id: Option<String>,
    pub registry_account: Option<String>,
    pub repository: Option<String>,
    pub branch: Option<String>,
    pub workspace: Option<PathBuf>,
    pub trigger: Trigger,
}

impl Recipe {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe file: {}", path.display()))?;
        let mut recipe: Recipe = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse recipe YAML: {}", path.display()))?;
        recipe.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(recipe)
    }

    /// Explicit overrides win over the webhook trigger, which wins over the
    /// recipe's source settings.
    pub fn run_config(&self, overrides: RunOverrides) -> RunConfig {
        let repository = overrides
            .repository
            .or_else(|| overrides.trigger.repository().map(str::to_string))
            .or_else(|| self.source.repository.clone());
        let branch = overrides
            .branch
            .or_else(|| overrides.trigger.branch().map(str::to_string))
            .unwrap_or_else(|| self.source.branch.clone());
        let workspace = overrides
            .workspace
            .unwrap_or_else(|| self.base_dir.join(&self.workspace));

        RunConfig {
            build_id: overrides.build_id.unwrap_or_else(default_build_id),
            app_name: self.application.name.clone(),
            registry_server: self.registry.server.clone(),
            registry_account: overrides
                .registry_account
                .unwrap_or_else(|| self.registry.account.clone()),
            repository,
            branch,
            workspace,
            credentials: self.credentials.clone(),
            trigger: overrides.trigger,
        }
    }
}

/// UTC timestamp, which is always a valid image tag.
pub fn default_build_id() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

fn default_workspace() -> PathBuf {
    PathBuf::from("./workspace")
}

fn default_registry() -> String {
    DEFAULT_REGISTRY.to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_notify_command() -> Vec<String> {
    vec!["sendmail".to_string(), "-t".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::is_valid_tag;
    use std::fs;
    use tempfile::tempdir;

    const RECIPE: &str = r#"
version: 1
application:
  name: netflix-clone-app
registry:
  account: asa96
source:
  repository: https://github.com/asa96/netflix-clone.git
workspace: ./ws
credentials:
  registry: docker-cred
pipeline:
  - stage: clean-workspace
  - stage: scan
    name: trivy-fs
    policy: advisory
    params:
      command: trivy fs .
      report: trivyfs.txt
"#;

    #[test]
    fn load_applies_defaults_and_base_dir() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("recipe.yaml");
        fs::write(&path, RECIPE).unwrap();

        let recipe = Recipe::load(&path).unwrap();
        assert_eq!(recipe.registry.server, "docker.io");
        assert_eq!(recipe.source.branch, "main");
        assert_eq!(recipe.pipeline[1].label(), "trivy-fs");
        assert!(recipe.notify.is_none());

        let config = recipe.run_config(RunOverrides::default());
        assert_eq!(config.workspace, temp.path().join("./ws"));
        assert_eq!(config.image(), "asa96/netflix-clone-app");
        assert!(is_valid_tag(&config.build_id));
    }

    #[test]
    fn overrides_take_precedence() {
        let mut recipe: Recipe = serde_yaml::from_str(RECIPE).unwrap();
        recipe.base_dir = PathBuf::from("/srv");
        let config = recipe.run_config(RunOverrides {
            build_id: Some("7".into()),
            registry_account: Some("someone".into()),
            trigger: Trigger::Webhook {
                repository: "https://example.com/fork.git".into(),
                branch: "release".into(),
                commit: None,
            },
            ..RunOverrides::default()
        });
        assert_eq!(config.build_id, "7");
        assert_eq!(config.registry_account, "someone");
        assert_eq!(config.branch, "release");
        assert_eq!(
            config.repository.as_deref(),
            Some("https://example.com/fork.git")
        );
    }
}
