use anyhow::{Context, Result};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{CredentialIds, DEFAULT_REGISTRY};
use crate::gate::GatePolicy;
use crate::pipeline::StageSpec;
use crate::recipe::{ApplicationSpec, NotifySpec, Recipe, RegistrySpec, SourceSpec};

pub const PRESETS: &[&str] = &["gitops", "build-only"];

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let preset = match name {
        "gitops" => gitops_preset(),
        "build-only" => build_only_preset(),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    };

    let rendered = serde_yaml::to_string(&preset)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write preset recipe: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

/// Checkout, code-quality and filesystem scans, image build, image scan,
/// publish, then the manifest commit back to the source repository.
/// Every scan is advisory; switch a scan to `policy: blocking` to gate on it.
fn gitops_preset() -> Recipe {
    let mut pipeline = vec![stage("clean-workspace", None, None), stage("checkout", None, None)];
    pipeline.push(advisory(stage(
        "scan",
        Some("sonarqube"),
        Some(json!({
            "command": ["sonar-scanner", "-Dsonar.projectName={app}", "-Dsonar.projectKey={app}"],
            "credential": "code-quality",
            "credential_env": "SONAR_TOKEN",
        })),
    )));
    pipeline.push(advisory(stage(
        "scan",
        Some("dependency-check"),
        Some(json!({
            "command": ["dependency-check", "--scan", ".", "--format", "XML"],
        })),
    )));
    pipeline.push(advisory(stage(
        "scan",
        Some("trivy-fs"),
        Some(json!({
            "command": "trivy fs --exit-code 1 .",
            "report": "trivyfs.txt",
        })),
    )));
    pipeline.push(stage(
        "build",
        None,
        Some(json!({
            "secret_args": {"TMDB_V3_API_KEY": "api-key"},
        })),
    ));
    pipeline.push(advisory(stage(
        "scan",
        Some("trivy-image"),
        Some(json!({
            "command": "trivy image --exit-code 1 {image}:{build_id}",
            "report": "trivyimage.txt",
        })),
    )));
    pipeline.push(stage("publish", None, None));
    pipeline.push(stage(
        "update-manifest",
        None,
        Some(json!({"path": "Kubernetes/deployment.yml"})),
    ));
    pipeline.push(stage("push-manifest", None, None));

    Recipe {
        version: 1,
        application: ApplicationSpec {
            name: "netflix-clone-app".into(),
        },
        registry: RegistrySpec {
            server: DEFAULT_REGISTRY.into(),
            account: "your-account".into(),
        },
        source: SourceSpec {
            repository: Some("https://github.com/your-account/netflix-clone.git".into()),
            branch: "main".into(),
        },
        workspace: PathBuf::from("./workspace"),
        credentials: CredentialIds {
            code_quality: Some("sonar-token".into()),
            registry: Some("docker-cred".into()),
            source_repo: Some("github".into()),
            api_key: Some("tmdb-key".into()),
        },
        pipeline,
        notify: Some(NotifySpec {
            command: vec!["sendmail".into(), "-t".into()],
            recipients: vec!["team@example.com".into()],
            attachments: vec!["trivyfs.txt".into(), "trivyimage.txt".into()],
        }),
        base_dir: PathBuf::new(),
    }
}

fn build_only_preset() -> Recipe {
    Recipe {
        version: 1,
        application: ApplicationSpec {
            name: "my-app".into(),
        },
        registry: RegistrySpec {
            server: DEFAULT_REGISTRY.into(),
            account: "your-account".into(),
        },
        source: SourceSpec::default(),
        workspace: PathBuf::from("."),
        credentials: CredentialIds {
            registry: Some("registry-cred".into()),
            ..CredentialIds::default()
        },
        pipeline: vec![stage("build", None, None), stage("publish", None, None)],
        notify: None,
        base_dir: PathBuf::new(),
    }
}

fn stage(kind: &str, name: Option<&str>, params: Option<Value>) -> StageSpec {
    StageSpec {
        name: name.map(str::to_string),
        params: params.and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        }),
        ..StageSpec::new(kind)
    }
}

fn advisory(mut spec: StageSpec) -> StageSpec {
    spec.policy = GatePolicy::Advisory;
    spec
}
