use serde::Serialize;

use crate::pipeline::{StageRegistry, StageSpec};
use crate::recipe::Recipe;

/// Stage kinds that must come after another kind in the pipeline.
const ORDERING: &[(&str, &str)] = &[
    ("publish", "build"),
    ("push-manifest", "update-manifest"),
];

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported recipe version: {}", recipe.version));
    }

    if recipe.application.name.trim().is_empty() {
        report.errors.push("Application name is required".into());
    }
    if recipe.registry.account.trim().is_empty() {
        report.warnings.push(
            "Registry account is empty; set it in the recipe or with --registry-account".into(),
        );
    }

    if recipe.pipeline.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one stage".into());
    }

    let mut labels = std::collections::HashSet::new();
    for (idx, stage) in recipe.pipeline.iter().enumerate() {
        if !labels.insert(stage.label()) {
            report.errors.push(format!(
                "Stage {} reuses the name '{}'",
                idx + 1,
                stage.label()
            ));
        }
        if stage.timeout_secs == Some(0) {
            report.errors.push(format!(
                "Stage {} ('{}') has a zero timeout",
                idx + 1,
                stage.label()
            ));
        }
        report.merge(validate_stage_order(idx, stage, &recipe.pipeline));
        report.merge(validate_credentials(idx, stage, recipe));
        report.merge(validate_stage(idx, stage, registry));
    }

    if recipe.source.repository.is_none()
        && recipe.pipeline.iter().any(|stage| stage.stage == "checkout")
    {
        report.warnings.push(
            "Checkout stage has no source repository; one must come from --repository or a \
             webhook event"
                .into(),
        );
    }

    if let Some(notify) = &recipe.notify {
        if notify.command.is_empty() {
            report.errors.push("Notification command cannot be empty".into());
        }
        for pattern in &notify.attachments {
            if let Err(err) = glob::Pattern::new(pattern) {
                report.errors.push(format!(
                    "Attachment pattern '{pattern}' is not a valid glob: {err}"
                ));
            }
        }
    }

    report
}

fn validate_stage(idx: usize, stage: &StageSpec, registry: &StageRegistry) -> ValidationReport {
    let mut report = ValidationReport::default();

    let params = stage.params.clone().unwrap_or_default();
    if let Err(err) = registry.create(&stage.stage, params) {
        report.errors.push(format!(
            "Stage {} ('{}'): {:#}",
            idx + 1,
            stage.label(),
            err.context("Failed to instantiate stage")
        ));
    }

    report
}

fn validate_stage_order(idx: usize, stage: &StageSpec, pipeline: &[StageSpec]) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (later, earlier) in ORDERING {
        if stage.stage != *later {
            continue;
        }
        if !pipeline[..idx].iter().any(|prev| prev.stage == *earlier) {
            report.errors.push(format!(
                "Stage {} ('{}') requires a {} stage earlier in the pipeline",
                idx + 1,
                stage.label(),
                earlier
            ));
        }
    }
    report
}

/// Credential references that are neither a role nor a declared id are
/// only warned about; the store may still know them.
fn validate_credentials(idx: usize, stage: &StageSpec, recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    let params = stage.params.as_ref();
    let explicit = params
        .and_then(|params| params.get("credential"))
        .and_then(|v| v.as_str());
    let mut references: Vec<&str> = Vec::new();
    match (explicit, stage.stage.as_str()) {
        (Some(reference), _) => references.push(reference),
        (None, "publish") => references.push("registry"),
        (None, "push-manifest") => references.push("source-repo"),
        _ => {}
    }
    if let Some(secret_args) = params
        .and_then(|params| params.get("secret_args"))
        .and_then(|v| v.as_object())
    {
        references.extend(secret_args.values().filter_map(|v| v.as_str()));
    }
    for reference in references {
        if recipe.credentials.role(reference).is_none()
            && !recipe.credentials.is_declared(reference)
        {
            report.warnings.push(format!(
                "Stage {} ('{}') references credential '{}' which is not declared in the recipe",
                idx + 1,
                stage.label(),
                reference
            ));
        }
    }
    report
}
