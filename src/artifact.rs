//! Container image build and registry publication.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::credentials::CredentialBindings;
use crate::error::{PipelineError, Result};
use crate::tools::{ToolInvocation, ToolRunner};

pub const LATEST_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub image: String,
    pub tags: Vec<String>,
    pub registry: String,
}

impl Artifact {
    pub fn reference(&self, tag: &str) -> String {
        format!("{}:{}", self.image, tag)
    }

    pub fn references(&self) -> Vec<String> {
        self.tags.iter().map(|tag| self.reference(tag)).collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishedReference {
    pub registry: String,
    pub image: String,
    pub references: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BuildContext {
    pub dir: PathBuf,
    pub dockerfile: Option<PathBuf>,
    /// Build args the Dockerfile cannot do without.
    pub required_args: Vec<String>,
}

pub struct ArtifactBuilder<'a> {
    tools: &'a dyn ToolRunner,
    image: String,
    registry: String,
    build_id: String,
}

impl<'a> ArtifactBuilder<'a> {
    pub fn new(
        tools: &'a dyn ToolRunner,
        image: impl Into<String>,
        registry: impl Into<String>,
        build_id: impl Into<String>,
    ) -> Self {
        Self {
            tools,
            image: image.into(),
            registry: registry.into(),
            build_id: build_id.into(),
        }
    }

    /// Build values travel through the environment and are referenced by
    /// name (`--build-arg NAME`), so they never appear on a command line.
    #[instrument(skip(self, context, build_args), fields(image = %self.image))]
    pub fn build(
        &self,
        context: &BuildContext,
        build_args: &BTreeMap<String, String>,
    ) -> Result<Artifact> {
        let missing: Vec<&str> = context
            .required_args
            .iter()
            .filter(|name| {
                build_args
                    .get(name.as_str())
                    .is_none_or(|value| value.trim().is_empty())
            })
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::Config(format!(
                "missing required build argument(s): {}",
                missing.join(", ")
            )));
        }

        let artifact = Artifact {
            image: self.image.clone(),
            tags: vec![self.build_id.clone(), LATEST_TAG.to_string()],
            registry: self.registry.clone(),
        };

        let mut invocation = ToolInvocation::new("docker").arg("build");
        for (name, value) in build_args {
            invocation = invocation
                .args(["--build-arg", name.as_str()])
                .env(name.clone(), value.clone());
        }
        for reference in artifact.references() {
            invocation = invocation.args(["-t".to_string(), reference]);
        }
        if let Some(dockerfile) = &context.dockerfile {
            invocation = invocation.args([
                "-f".to_string(),
                context.dir.join(dockerfile).to_string_lossy().to_string(),
            ]);
        }
        invocation = invocation.arg(context.dir.to_string_lossy().to_string());

        let output = self.tools.run(&invocation)?;
        if !output.success() {
            return Err(PipelineError::Build(output.error_text()));
        }
        info!(tags = ?artifact.tags, "Image built");
        Ok(artifact)
    }
}

pub struct ArtifactPublisher<'a> {
    tools: &'a dyn ToolRunner,
}

impl<'a> ArtifactPublisher<'a> {
    pub fn new(tools: &'a dyn ToolRunner) -> Self {
        Self { tools }
    }

    /// Pushes each tag on its own. A failed push leaves earlier tags
    /// published and reports them in the error; nothing is rolled back.
    /// Local copies are removed afterwards on every path.
    #[instrument(skip(self, artifact, credential), fields(image = %artifact.image))]
    pub fn publish(
        &self,
        artifact: &Artifact,
        credential: &CredentialBindings,
    ) -> Result<PublishedReference> {
        let result = self.login(artifact, credential).and_then(|()| {
            let mut pushed = Vec::new();
            for reference in artifact.references() {
                let output = self
                    .tools
                    .run(&ToolInvocation::new("docker").args(["push", reference.as_str()]));
                let failure = match output {
                    Ok(output) if output.success() => None,
                    Ok(output) => Some(output.error_text()),
                    Err(err) => Some(err.to_string()),
                };
                if let Some(reason) = failure {
                    if !pushed.is_empty() {
                        warn!(published = ?pushed, failed = %reference, "Partial publish");
                    }
                    return Err(PipelineError::Publish {
                        pushed,
                        failed_tag: reference,
                        reason,
                    });
                }
                info!(reference = %reference, "Pushed");
                pushed.push(reference);
            }
            Ok(PublishedReference {
                registry: artifact.registry.clone(),
                image: artifact.image.clone(),
                references: pushed,
            })
        });

        self.retire(artifact);
        result
    }

    fn login(&self, artifact: &Artifact, credential: &CredentialBindings) -> Result<()> {
        let username = credential.username()?.ok_or_else(|| {
            PipelineError::Auth(format!(
                "credential '{}' has no username for registry login",
                credential.id()
            ))
        })?;
        let secret = credential.secret()?;
        let output = self.tools.run(
            &ToolInvocation::new("docker")
                .args(["login", artifact.registry.as_str(), "--username"])
                .arg(username)
                .arg("--password-stdin")
                .stdin(secret.expose()),
        )?;
        if !output.success() {
            return Err(PipelineError::Auth(format!(
                "registry login to {} failed: {}",
                artifact.registry,
                output.error_text()
            )));
        }
        Ok(())
    }

    /// Removes every local tag of `artifact`; failures are only logged.
    pub(crate) fn retire(&self, artifact: &Artifact) {
        for reference in artifact.references() {
            match self
                .tools
                .run(&ToolInvocation::new("docker").args(["rmi", reference.as_str()]))
            {
                Ok(output) if output.success() => {}
                Ok(output) => warn!(
                    reference = %reference,
                    error = %output.error_text(),
                    "Failed to remove local image"
                ),
                Err(err) => {
                    warn!(reference = %reference, error = %err, "Failed to remove local image")
                }
            }
        }
    }
}
