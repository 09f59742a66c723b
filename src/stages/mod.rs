use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Result, anyhow, bail};
use serde_json::Value;
use tracing::info;

use crate::error::PipelineError;
use crate::git;
use crate::pipeline::{Stage, StageContext, StageOutcome, StageParameters, StageRegistry};

mod release;
mod scan;

use release::{BuildStage, PublishStage, PushManifestStage, UpdateManifestStage};
use scan::ScanStage;

pub fn register_defaults(registry: &mut StageRegistry) {
    registry.register("clean-workspace", |params| {
        Ok(Box::new(CleanWorkspaceStage::from_params(params)?))
    });
    registry.register("checkout", |params| {
        Ok(Box::new(CheckoutStage::from_params(params)?))
    });
    registry.register("scan", |params| {
        Ok(Box::new(ScanStage::from_params(params)?))
    });
    registry.register("build", |params| {
        Ok(Box::new(BuildStage::from_params(params)?))
    });
    registry.register("publish", |params| {
        Ok(Box::new(PublishStage::from_params(params)?))
    });
    registry.register("update-manifest", |params| {
        Ok(Box::new(UpdateManifestStage::from_params(params)?))
    });
    registry.register("push-manifest", |params| {
        Ok(Box::new(PushManifestStage::from_params(params)?))
    });
}

struct CleanWorkspaceStage;

impl CleanWorkspaceStage {
    fn from_params(params: StageParameters) -> Result<Self> {
        ensure_consumed("clean-workspace", &params)?;
        Ok(Self)
    }
}

impl Stage for CleanWorkspaceStage {
    fn name(&self) -> &'static str {
        "clean-workspace"
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let workspace = &ctx.config.workspace;
        if workspace.exists() {
            fs::remove_dir_all(workspace).map_err(|err| {
                PipelineError::io(format!("failed to clean {}", workspace.display()), err)
            })?;
        }
        fs::create_dir_all(workspace).map_err(|err| {
            PipelineError::io(format!("failed to create {}", workspace.display()), err)
        })?;
        info!(workspace = %workspace.display(), "Workspace cleaned");
        Ok(StageOutcome::Passed)
    }
}

struct CheckoutStage {
    repository: Option<String>,
    branch: Option<String>,
}

impl CheckoutStage {
    fn from_params(mut params: StageParameters) -> Result<Self> {
        let repository = take_string(&mut params, "repository");
        let branch = take_string(&mut params, "branch");
        ensure_consumed("checkout", &params)?;
        Ok(Self { repository, branch })
    }
}

impl Stage for CheckoutStage {
    fn name(&self) -> &'static str {
        "checkout"
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let repository = self
            .repository
            .clone()
            .or_else(|| ctx.config.repository.clone())
            .ok_or_else(|| {
                PipelineError::Config("checkout requires a source repository".into())
            })?;
        let branch = self
            .branch
            .as_deref()
            .unwrap_or(ctx.config.branch.as_str());
        git::checkout(ctx.tools, &repository, branch, &ctx.config.workspace)?;
        Ok(StageOutcome::Passed)
    }
}

/// Credential resolution failures inside registry or git stages surface as
/// authentication failures.
fn auth_failure(err: PipelineError) -> PipelineError {
    match err {
        PipelineError::Credential { id, reason } => {
            PipelineError::Auth(format!("credential '{id}': {reason}"))
        }
        other => other,
    }
}

fn take_string(params: &mut StageParameters, key: &str) -> Option<String> {
    params.remove(key).and_then(|value| match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    })
}

fn take_path(params: &mut StageParameters, key: &str) -> Option<PathBuf> {
    take_string(params, key).map(PathBuf::from)
}

/// Accepts a list of strings or a single whitespace-separated string.
fn take_string_list(params: &mut StageParameters, key: &str) -> Result<Option<Vec<String>>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.split_whitespace().map(str::to_string).collect())),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(anyhow!("'{key}' entries must be strings, found {other}")),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        Some(other) => bail!("'{key}' must be a list of strings, found {other}"),
    }
}

fn take_string_map(params: &mut StageParameters, key: &str) -> Result<BTreeMap<String, String>> {
    match params.remove(key) {
        None | Some(Value::Null) => Ok(BTreeMap::new()),
        Some(Value::Object(map)) => map
            .into_iter()
            .map(|(name, value)| match value {
                Value::String(s) => Ok((name, s)),
                Value::Number(_) | Value::Bool(_) => Ok((name, value.to_string())),
                other => Err(anyhow!("'{key}.{name}' must be a scalar, found {other}")),
            })
            .collect(),
        Some(other) => bail!("'{key}' must be a mapping, found {other}"),
    }
}

fn ensure_consumed(stage: &str, params: &StageParameters) -> Result<()> {
    if params.is_empty() {
        return Ok(());
    }
    let mut unknown: Vec<&str> = params.keys().map(String::as_str).collect();
    unknown.sort_unstable();
    bail!(
        "{stage} stage does not accept parameter(s): {}",
        unknown.join(", ")
    )
}
