use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::artifact::Artifact;
use crate::config::RunConfig;
use crate::credentials::CredentialStore;
use crate::error::PipelineError;
use crate::gate::{GatePolicy, GateRecord, QualityGate};
use crate::git::CommitChange;
use crate::notify::Notifier;
use crate::observability::MetricsCollector;
use crate::tools::{TimedRunner, ToolRunner};
use crate::trigger::Trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
        )
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (
                    RunStatus::Running,
                    RunStatus::Succeeded | RunStatus::Failed | RunStatus::Aborted
                )
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageResult {
    NotRun,
    Running,
    Passed,
    Failed,
    Skipped,
}

impl StageResult {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageResult::Passed | StageResult::Failed | StageResult::Skipped
        )
    }
}

/// What a stage body reports when it ran to completion. Errors are failures
/// too; `Failed` covers checks that ran fine but did not pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Passed,
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub kind: String,
    pub policy: GatePolicy,
    pub always_run: bool,
    pub result: StageResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
}

impl StageRecord {
    fn start(&mut self) {
        if self.result == StageResult::NotRun {
            self.result = StageResult::Running;
        }
    }

    fn finish(
        &mut self,
        result: StageResult,
        message: Option<String>,
        error_kind: Option<&'static str>,
        duration: Option<Duration>,
    ) {
        if self.result.is_terminal() {
            return;
        }
        self.result = result;
        self.message = message;
        self.error_kind = error_kind;
        self.duration_ms = duration.map(|d| d.as_secs_f64() * 1_000.0);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportRef {
    pub stage: String,
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Record of one pipeline execution; serialized as the run summary.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub build_id: String,
    pub app_name: String,
    pub image: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    pub trigger: Trigger,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub stages: Vec<StageRecord>,
    pub warnings: Vec<String>,
    pub gates: Vec<GateRecord>,
    pub reports: Vec<ReportRef>,
    pub published: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    fn new(config: &RunConfig, stages: &[PipelineStage]) -> Self {
        Self {
            build_id: config.build_id.clone(),
            app_name: config.app_name.clone(),
            image: config.image(),
            branch: config.branch.clone(),
            repository: config.repository.clone(),
            trigger: config.trigger.clone(),
            status: RunStatus::Pending,
            error: None,
            stages: stages
                .iter()
                .map(|stage| StageRecord {
                    name: stage.label.clone(),
                    kind: stage.stage.name().to_string(),
                    policy: stage.policy,
                    always_run: stage.always_run,
                    result: StageResult::NotRun,
                    message: None,
                    error_kind: None,
                    duration_ms: None,
                })
                .collect(),
            warnings: Vec::new(),
            gates: Vec::new(),
            reports: Vec::new(),
            published: Vec::new(),
            commit: None,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, next: RunStatus) {
        if !self.status.can_transition_to(next) {
            warn!(from = ?self.status, to = ?next, "Ignoring invalid run status transition");
            return;
        }
        match next {
            RunStatus::Running => self.started_at = Some(Utc::now()),
            status if status.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        self.status = next;
    }

    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    pub fn failed_stage(&self) -> Option<&StageRecord> {
        self.stages.iter().find(|stage| {
            stage.result == StageResult::Failed && stage.policy == GatePolicy::Blocking
        })
    }
}

/// Work products handed from one stage to the next.
#[derive(Debug, Default)]
pub struct RunState {
    pub artifact: Option<Artifact>,
    pub published: Vec<String>,
    pub manifests: Vec<PathBuf>,
    pub commit: Option<CommitChange>,
    pub reports: Vec<ReportRef>,
}

pub struct StageContext<'a> {
    pub stage: &'a str,
    pub policy: GatePolicy,
    pub config: &'a RunConfig,
    pub tools: &'a dyn ToolRunner,
    pub credentials: &'a dyn CredentialStore,
    pub gate: &'a mut QualityGate,
    pub state: &'a mut RunState,
}

pub type StageParameters = Map<String, Value>;

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, PipelineError>;
}

type StageConstructor = Arc<dyn Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync>;

pub struct StageRegistry {
    factories: HashMap<String, StageConstructor>,
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(StageParameters) -> Result<Box<dyn Stage>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(constructor));
    }

    pub fn create(&self, name: &str, params: StageParameters) -> Result<Box<dyn Stage>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown stage '{}'. Available stages: {}",
                name,
                self.known_stages().join(", ")
            )
        })?;
        factory(params)
    }

    pub fn known_stages(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageSpec {
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub policy: GatePolicy,
    /// Boolean form of `policy`; wins when both are given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_on_failure: Option<bool>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub always_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<StageParameters>,
}

impl StageSpec {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            ..Self::default()
        }
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.stage)
    }

    pub fn effective_policy(&self) -> GatePolicy {
        self.abort_on_failure.map_or(self.policy, GatePolicy::from)
    }
}

pub struct PipelineStage {
    pub label: String,
    pub stage: Box<dyn Stage>,
    pub policy: GatePolicy,
    pub always_run: bool,
    pub timeout: Option<Duration>,
}

/// External cancellation, honoured between stages only.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct PipelineExecutor {
    stages: Vec<PipelineStage>,
    tools: Arc<dyn ToolRunner>,
    credentials: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
    metrics: MetricsCollector,
    cancel: CancelToken,
}

impl PipelineExecutor {
    pub fn new(
        stages: Vec<PipelineStage>,
        tools: Arc<dyn ToolRunner>,
        credentials: Arc<dyn CredentialStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            stages,
            tools,
            credentials,
            notifier,
            metrics: MetricsCollector::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    pub fn stage_labels(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.label.as_str()).collect()
    }

    /// Runs every stage in declared order and always notifies once at the end.
    ///
    /// The first failing blocking stage fails the run and skips everything
    /// after it except `always_run` stages. Advisory failures only add
    /// warnings. Cancellation is checked before each stage and aborts the run
    /// the same way.
    #[instrument(skip_all, fields(build_id = %config.build_id, app = %config.app_name))]
    pub fn execute(&self, config: &RunConfig) -> PipelineRun {
        self.metrics.reset();
        let total_start = Instant::now();
        let mut run = PipelineRun::new(config, &self.stages);
        run.transition(RunStatus::Running);
        info!(stages = self.stages.len(), "Pipeline started");

        if let Err(err) = config.validate() {
            error!(error = %err, "Run configuration rejected");
            for record in &mut run.stages {
                record.finish(StageResult::Skipped, None, None, None);
            }
            run.error = Some(err.to_string());
            run.transition(RunStatus::Failed);
            self.deliver(&mut run);
            return run;
        }

        let mut gate = QualityGate::new();
        let mut state = RunState::default();
        let mut halt: Option<RunStatus> = None;

        for (idx, entry) in self.stages.iter().enumerate() {
            if halt.is_none() && self.cancel.is_cancelled() {
                warn!(next_stage = %entry.label, "Cancellation requested, aborting run");
                run.error = Some("run cancelled".into());
                halt = Some(RunStatus::Aborted);
            }
            if halt.is_some() && !entry.always_run {
                info!(stage = %entry.label, "Stage skipped");
                run.stages[idx].finish(StageResult::Skipped, None, None, None);
                continue;
            }

            let result = self.run_stage(idx, entry, config, &mut gate, &mut state, &mut run);
            if result == StageResult::Failed
                && entry.policy == GatePolicy::Blocking
                && halt.is_none()
            {
                run.error = run.stages[idx].message.clone();
                halt = Some(RunStatus::Failed);
            }
        }

        run.gates = gate.into_records();
        run.reports = state.reports;
        run.published = state.published;
        run.commit = state.commit;
        self.metrics.record_gates(&run.gates);
        self.metrics.record_total_duration(total_start.elapsed());

        run.transition(halt.unwrap_or(RunStatus::Succeeded));
        self.deliver(&mut run);
        run
    }

    fn run_stage(
        &self,
        idx: usize,
        entry: &PipelineStage,
        config: &RunConfig,
        gate: &mut QualityGate,
        state: &mut RunState,
        run: &mut PipelineRun,
    ) -> StageResult {
        let span = tracing::span!(tracing::Level::INFO, "stage", stage = %entry.label);
        let _span_guard = span.enter();
        run.stages[idx].start();
        let timer = self.metrics.start_stage(&entry.label);
        let started = Instant::now();

        let deadline = entry.timeout.map(|limit| started + limit);
        let tools = TimedRunner::with_deadline(self.tools.as_ref(), deadline);
        let mut ctx = StageContext {
            stage: &entry.label,
            policy: entry.policy,
            config,
            tools: &tools,
            credentials: self.credentials.as_ref(),
            gate,
            state,
        };

        let (result, message, error_kind) = match entry.stage.run(&mut ctx) {
            Ok(StageOutcome::Passed) => (StageResult::Passed, None, None),
            Ok(StageOutcome::Failed { reason }) => (
                StageResult::Failed,
                Some(reason),
                (entry.policy == GatePolicy::Advisory).then_some("AdvisoryScanFailure"),
            ),
            Err(err) => (StageResult::Failed, Some(err.to_string()), Some(err.kind())),
        };
        timer.finish(result);

        match (result, entry.policy) {
            (StageResult::Failed, GatePolicy::Blocking) => {
                error!(error = message.as_deref().unwrap_or_default(), "Stage failed");
            }
            (StageResult::Failed, GatePolicy::Advisory) => {
                let reason = message.as_deref().unwrap_or("failed");
                warn!(error = reason, "Advisory stage failed, continuing");
                run.warnings.push(format!("{}: {}", entry.label, reason));
            }
            _ => info!("Stage passed"),
        }

        run.stages[idx].finish(result, message, error_kind, Some(started.elapsed()));
        result
    }

    fn deliver(&self, run: &mut PipelineRun) {
        info!(status = ?run.status, "Pipeline finished");
        if let Err(err) = self.notifier.notify(run) {
            warn!(error = %err, "Notification delivery failed");
            run.warnings
                .push(format!("notification delivery failed: {err}"));
        }
    }
}

pub fn build_pipeline(
    stage_registry: &StageRegistry,
    stage_specs: &[StageSpec],
    tools: Arc<dyn ToolRunner>,
    credentials: Arc<dyn CredentialStore>,
    notifier: Arc<dyn Notifier>,
) -> Result<PipelineExecutor> {
    let mut stages = Vec::with_capacity(stage_specs.len());
    for spec in stage_specs {
        let params = spec.params.clone().unwrap_or_default();
        let stage = stage_registry
            .create(&spec.stage, params)
            .map_err(|err| err.context(format!("Stage '{}'", spec.label())))?;
        stages.push(PipelineStage {
            label: spec.label().to_string(),
            stage,
            policy: spec.effective_policy(),
            always_run: spec.always_run,
            timeout: spec.timeout_secs.map(Duration::from_secs),
        });
    }

    Ok(PipelineExecutor::new(stages, tools, credentials, notifier))
}
