use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use tracing::info;

use super::{
    auth_failure, ensure_consumed, take_path, take_string, take_string_list, take_string_map,
};
use crate::artifact::{ArtifactBuilder, ArtifactPublisher, BuildContext};
use crate::credentials::{with_credential, with_credentials};
use crate::error::PipelineError;
use crate::git::ChangePublisher;
use crate::manifest;
use crate::pipeline::{Stage, StageContext, StageOutcome, StageParameters};

const DEFAULT_COMMIT_MESSAGE: &str = "Update {app} image to {build_id}";

/// `docker build` of the workspace, tagged with the build id and `latest`.
pub(super) struct BuildStage {
    context: PathBuf,
    dockerfile: Option<PathBuf>,
    required_args: Vec<String>,
    args: BTreeMap<String, String>,
    /// Build arg name to credential role or id.
    secret_args: BTreeMap<String, String>,
}

impl BuildStage {
    pub(super) fn from_params(mut params: StageParameters) -> Result<Self> {
        let context = take_path(&mut params, "context").unwrap_or_else(|| PathBuf::from("."));
        let dockerfile = take_path(&mut params, "dockerfile");
        let required_args = take_string_list(&mut params, "required_args")?.unwrap_or_default();
        let args = take_string_map(&mut params, "args")?;
        let secret_args = take_string_map(&mut params, "secret_args")?;
        ensure_consumed("build", &params)?;
        Ok(Self {
            context,
            dockerfile,
            required_args,
            args,
            secret_args,
        })
    }
}

impl Stage for BuildStage {
    fn name(&self) -> &'static str {
        "build"
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let config = ctx.config;
        let builder = ArtifactBuilder::new(
            ctx.tools,
            config.image(),
            config.registry_server.clone(),
            config.build_id.clone(),
        );
        let mut required_args = self.required_args.clone();
        for name in self.secret_args.keys() {
            if !required_args.contains(name) {
                required_args.push(name.clone());
            }
        }
        let context = BuildContext {
            dir: config.resolve(&self.context),
            dockerfile: self.dockerfile.clone(),
            required_args,
        };

        let ids: Vec<String> = self
            .secret_args
            .values()
            .map(|reference| config.credentials.lookup(reference))
            .collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let artifact = with_credentials(ctx.credentials, &id_refs, |bindings| {
            let mut build_args: BTreeMap<String, String> = self
                .args
                .iter()
                .map(|(name, value)| (name.clone(), config.expand(value)))
                .collect();
            for (name, binding) in self.secret_args.keys().zip(bindings) {
                build_args.insert(name.clone(), binding.secret()?.expose().to_string());
            }
            builder.build(&context, &build_args)
        })
        .map_err(|err| match err {
            PipelineError::Credential { id, reason } => PipelineError::Config(format!(
                "build argument credential '{id}' could not be resolved: {reason}"
            )),
            other => other,
        })?;

        ctx.state.artifact = Some(artifact);
        Ok(StageOutcome::Passed)
    }
}

/// Pushes the artifact from the preceding build stage, then removes it
/// locally. The artifact is consumed whether or not the push succeeds.
pub(super) struct PublishStage {
    credential: String,
}

impl PublishStage {
    pub(super) fn from_params(mut params: StageParameters) -> Result<Self> {
        let credential =
            take_string(&mut params, "credential").unwrap_or_else(|| "registry".into());
        ensure_consumed("publish", &params)?;
        Ok(Self { credential })
    }
}

impl Stage for PublishStage {
    fn name(&self) -> &'static str {
        "publish"
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let artifact = ctx.state.artifact.take().ok_or_else(|| {
            PipelineError::Config("publish requires an image from a preceding build stage".into())
        })?;
        let id = ctx.config.credentials.lookup(&self.credential);
        let publisher = ArtifactPublisher::new(ctx.tools);

        let mut attempted = false;
        let result = with_credential(ctx.credentials, &id, |bindings| {
            attempted = true;
            publisher.publish(&artifact, bindings)
        })
        .map_err(auth_failure);
        if !attempted {
            publisher.retire(&artifact);
        }

        match result {
            Ok(published) => {
                info!(references = ?published.references, "Image published");
                ctx.state.published.extend(published.references);
                Ok(StageOutcome::Passed)
            }
            Err(PipelineError::Publish {
                pushed,
                failed_tag,
                reason,
            }) => {
                ctx.state.published.extend(pushed.iter().cloned());
                Err(PipelineError::Publish {
                    pushed,
                    failed_tag,
                    reason,
                })
            }
            Err(err) => Err(err),
        }
    }
}

pub(super) struct UpdateManifestStage {
    path: PathBuf,
    app: Option<String>,
    tag: Option<String>,
}

impl UpdateManifestStage {
    pub(super) fn from_params(mut params: StageParameters) -> Result<Self> {
        let path = take_path(&mut params, "path")
            .ok_or_else(|| anyhow::anyhow!("update-manifest stage requires a 'path' parameter"))?;
        let app = take_string(&mut params, "app");
        let tag = take_string(&mut params, "tag");
        ensure_consumed("update-manifest", &params)?;
        Ok(Self { path, app, tag })
    }
}

impl Stage for UpdateManifestStage {
    fn name(&self) -> &'static str {
        "update-manifest"
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let config = ctx.config;
        let path = config.resolve(&PathBuf::from(config.expand(&self.path.to_string_lossy())));
        let app = self
            .app
            .as_deref()
            .map_or_else(|| config.app_name.clone(), |app| config.expand(app));
        let tag = self
            .tag
            .as_deref()
            .map_or_else(|| config.build_id.clone(), |tag| config.expand(tag));

        let descriptor = manifest::update(&path, &app, &tag)?;
        info!(
            manifest = %path.display(),
            matched = descriptor.matched_lines.len(),
            changed = descriptor.changed_lines.len(),
            "Manifest updated"
        );
        if !ctx.state.manifests.contains(&path) {
            ctx.state.manifests.push(path);
        }
        Ok(StageOutcome::Passed)
    }
}

/// Commits the updated manifests and pushes them to the source branch.
pub(super) struct PushManifestStage {
    message: String,
    branch: Option<String>,
    credential: String,
    paths: Vec<PathBuf>,
    remote: Option<String>,
    author_name: Option<String>,
    author_email: Option<String>,
}

impl PushManifestStage {
    pub(super) fn from_params(mut params: StageParameters) -> Result<Self> {
        let message =
            take_string(&mut params, "message").unwrap_or_else(|| DEFAULT_COMMIT_MESSAGE.into());
        let branch = take_string(&mut params, "branch");
        let credential =
            take_string(&mut params, "credential").unwrap_or_else(|| "source-repo".into());
        let paths = take_string_list(&mut params, "paths")?
            .unwrap_or_default()
            .into_iter()
            .map(PathBuf::from)
            .collect();
        let remote = take_string(&mut params, "remote");
        let author_name = take_string(&mut params, "author_name");
        let author_email = take_string(&mut params, "author_email");
        ensure_consumed("push-manifest", &params)?;
        Ok(Self {
            message,
            branch,
            credential,
            paths,
            remote,
            author_name,
            author_email,
        })
    }
}

impl Stage for PushManifestStage {
    fn name(&self) -> &'static str {
        "push-manifest"
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let config = ctx.config;
        let paths: Vec<PathBuf> = if self.paths.is_empty() {
            ctx.state.manifests.clone()
        } else {
            self.paths
                .iter()
                .map(|path| config.resolve(&PathBuf::from(config.expand(&path.to_string_lossy()))))
                .collect()
        };
        if paths.is_empty() {
            return Err(PipelineError::Config(
                "push-manifest has no manifest paths; add an update-manifest stage or set 'paths'"
                    .into(),
            ));
        }

        let branch = self
            .branch
            .as_deref()
            .map_or_else(|| config.branch.clone(), |branch| config.expand(branch));
        let message = config.expand(&self.message);

        let mut publisher = ChangePublisher::new(ctx.tools, config.workspace.clone());
        if let Some(remote) = &self.remote {
            publisher = publisher.with_remote(remote.clone());
        }
        if let (Some(name), Some(email)) = (&self.author_name, &self.author_email) {
            publisher = publisher.with_author(name.clone(), email.clone());
        }

        let id = config.credentials.lookup(&self.credential);
        let change = with_credential(ctx.credentials, &id, |bindings| {
            publisher.commit_and_push(&paths, &message, &branch, bindings)
        })
        .map_err(auth_failure)?;

        ctx.state.commit = Some(change);
        Ok(StageOutcome::Passed)
    }
}
