use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::{Shell, generate};
use serde_json::to_writer_pretty;
use shipyard::credentials::{CredentialStore, EnvCredentialStore, FileCredentialStore};
use shipyard::notify::{CommandNotifier, LogNotifier, Notifier};
use shipyard::observability::log_snapshot;
use shipyard::pipeline::{PipelineRun, RunStatus, StageRegistry, build_pipeline};
use shipyard::presets::generate_preset;
use shipyard::recipe::{Recipe, RunOverrides};
use shipyard::stages;
use shipyard::tools::{ProcessRunner, ScriptedRunner, ToolRunner};
use shipyard::trigger::{Trigger, parse_webhook};
use shipyard::validation::validate_recipe;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

/// Conventional exit status for a run stopped by SIGINT.
const ABORTED_EXIT: u8 = 130;

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run(args) => run_recipe(args),
        Commands::ListStages => {
            list_stages();
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { recipe } => validate_recipe_cmd(recipe).map(|()| ExitCode::SUCCESS),
        Commands::Recipe { action } => recipe_command(action).map(|()| ExitCode::SUCCESS),
        Commands::Completions { shell } => {
            let mut command = Cli::command();
            generate(shell, &mut command, "shipyard", &mut io::stdout());
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

fn run_recipe(args: RunArgs) -> Result<ExitCode> {
    let recipe = Recipe::load(&args.recipe)?;
    let registry = build_registry();

    let report = validate_recipe(&recipe, &registry);
    for warning in &report.warnings {
        warn!(file = %args.recipe.display(), "{warning}");
    }
    if !report.is_ok() {
        for error_msg in &report.errors {
            error!(file = %args.recipe.display(), "{error_msg}");
        }
        bail!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        );
    }

    let trigger = match &args.event {
        Some(path) => {
            let payload = fs::read_to_string(path)
                .with_context(|| format!("Failed to read webhook event: {}", path.display()))?;
            parse_webhook(&payload)?
        }
        None => Trigger::Manual,
    };

    let config = recipe.run_config(RunOverrides {
        build_id: args.build_id,
        registry_account: args.registry_account,
        repository: args.repository,
        branch: args.branch,
        workspace: args.workspace,
        trigger,
    });

    let tools: Arc<dyn ToolRunner> = if args.dry_run {
        info!("Dry run: external commands are logged, not executed");
        Arc::new(ScriptedRunner::dry_run())
    } else {
        Arc::new(ProcessRunner)
    };
    let credentials: Arc<dyn CredentialStore> = match &args.credentials_file {
        Some(path) => Arc::new(FileCredentialStore::load(path)?),
        None => Arc::new(EnvCredentialStore::from_env()),
    };
    let notifier: Arc<dyn Notifier> = match &recipe.notify {
        Some(notify) => Arc::new(
            CommandNotifier::new(
                tools.clone(),
                notify.command.clone(),
                notify.recipients.clone(),
            )
            .with_attachments(notify.attachments.clone(), config.workspace.clone()),
        ),
        None => Arc::new(LogNotifier),
    };

    let executor = build_pipeline(&registry, &recipe.pipeline, tools, credentials, notifier)?;
    let metrics_handle = executor.metrics();
    info!(
        build_id = %config.build_id,
        stages = %executor.stage_labels().join(" -> "),
        "Starting pipeline"
    );

    let cancel = executor.cancel_token();
    ctrlc::set_handler(move || {
        eprintln!("\nCancellation requested, stopping after the current stage...");
        cancel.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    let run = executor.execute(&config);
    print_summary(&run);

    if let Some(path) = &args.summary_json {
        write_json(path, &run, "run summary")?;
    }

    if args.print_metrics || args.metrics_json.is_some() {
        let snapshot = metrics_handle.snapshot();
        if args.print_metrics {
            log_snapshot(&snapshot);
        }
        if let Some(path) = &args.metrics_json {
            write_json(path, &snapshot, "metrics")?;
        }
    }

    Ok(exit_code(run.status))
}

fn print_summary(run: &PipelineRun) {
    println!(
        "{} build {} ({}): {:?}",
        run.app_name, run.build_id, run.image, run.status
    );
    for stage in &run.stages {
        let result = serde_json::to_value(stage.result)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        match &stage.message {
            Some(message) => println!("  {:<8} {} - {}", result, stage.name, message),
            None => println!("  {:<8} {}", result, stage.name),
        }
    }
    for warning in &run.warnings {
        println!("  warning: {warning}");
    }
}

fn exit_code(status: RunStatus) -> ExitCode {
    match status {
        RunStatus::Succeeded => ExitCode::SUCCESS,
        RunStatus::Aborted => ExitCode::from(ABORTED_EXIT),
        _ => ExitCode::FAILURE,
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {what} directory: {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create {what} file: {}", path.display()))?;
    to_writer_pretty(file, value)
        .with_context(|| format!("Failed to write {what} JSON: {}", path.display()))?;
    info!(path = %path.display(), "Wrote {what}");
    Ok(())
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn validate_recipe_cmd(recipe_path: PathBuf) -> Result<()> {
    let recipe = Recipe::load(&recipe_path)?;
    let registry = build_registry();
    let report = validate_recipe(&recipe, &registry);

    for warning in &report.warnings {
        warn!(file = %recipe_path.display(), "{warning}");
    }

    if report.is_ok() {
        info!(file = %recipe_path.display(), "Recipe validation passed");
        Ok(())
    } else {
        for error_msg in &report.errors {
            error!(file = %recipe_path.display(), "{error_msg}");
        }
        Err(anyhow!(
            "Recipe validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn recipe_command(command: RecipeCommands) -> Result<()> {
    match command {
        RecipeCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("recipes/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset recipe generated"
            );
            Ok(())
        }
        RecipeCommands::Lint { recipes } => lint_recipes(&recipes),
    }
}

fn lint_recipes(recipes: &[PathBuf]) -> Result<()> {
    if recipes.is_empty() {
        bail!("No recipe files supplied for linting");
    }

    let registry = build_registry();
    let mut failures = 0usize;

    for recipe_path in recipes {
        match Recipe::load(recipe_path) {
            Ok(recipe) => {
                let report = validate_recipe(&recipe, &registry);
                for warning in &report.warnings {
                    warn!(file = %recipe_path.display(), "{warning}");
                }
                if report.is_ok() {
                    info!(file = %recipe_path.display(), "Lint passed");
                } else {
                    failures += 1;
                    for error_msg in &report.errors {
                        error!(file = %recipe_path.display(), "{error_msg}");
                    }
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %recipe_path.display(), "Failed to load recipe: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} recipe(s)");
    }

    info!("All recipe lint checks passed");
    Ok(())
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "shipyard",
    version,
    about = "Sequential deployment pipeline: scan, build, publish and GitOps manifest updates"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a recipe once.
    Run(RunArgs),
    ListStages,
    Validate {
        #[arg(value_hint = ValueHint::FilePath)]
        recipe: PathBuf,
    },
    Recipe {
        #[command(subcommand)]
        action: RecipeCommands,
    },
    /// Print shell completions to stdout.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    recipe: PathBuf,
    /// Defaults to a UTC timestamp.
    #[arg(long, env = "SHIPYARD_BUILD_ID")]
    build_id: Option<String>,
    #[arg(long, env = "SHIPYARD_REGISTRY_ACCOUNT")]
    registry_account: Option<String>,
    #[arg(long, alias = "repo")]
    repository: Option<String>,
    #[arg(long)]
    branch: Option<String>,
    #[arg(long, value_hint = ValueHint::DirPath)]
    workspace: Option<PathBuf>,
    /// Push-event webhook payload (JSON) that triggered this run.
    #[arg(long, value_hint = ValueHint::FilePath)]
    event: Option<PathBuf>,
    /// YAML credential index; defaults to SHIPYARD_CREDENTIAL_* variables.
    #[arg(long, value_hint = ValueHint::FilePath)]
    credentials_file: Option<PathBuf>,
    /// Log external commands instead of running them.
    #[arg(long)]
    dry_run: bool,
    #[arg(long = "summary-json")]
    summary_json: Option<PathBuf>,
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
}

#[derive(Subcommand)]
enum RecipeCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Lint {
        #[arg(required = true)]
        recipes: Vec<PathBuf>,
    },
}
