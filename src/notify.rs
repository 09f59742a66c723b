//! Terminal run notification.
//!
//! The executor calls the notifier exactly once per run, whatever the final
//! status. Delivery errors are returned to the executor, which logs them and
//! leaves the run status alone.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use glob::glob;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::{PipelineRun, ReportRef, RunStatus, StageResult};
use crate::reports::compute_sha256;
use crate::tools::{ToolInvocation, ToolRunner};

pub trait Notifier: Send + Sync {
    fn notify(&self, run: &PipelineRun) -> Result<()>;
}

/// Writes the outcome to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, run: &PipelineRun) -> Result<()> {
        let failed = run.failed_stage().map(|stage| stage.name.as_str());
        match run.status {
            RunStatus::Succeeded => info!(
                build_id = %run.build_id,
                warnings = run.warnings.len(),
                reports = run.reports.len(),
                "Run succeeded"
            ),
            status => warn!(
                build_id = %run.build_id,
                ?status,
                failed_stage = failed.unwrap_or("-"),
                reports = run.reports.len(),
                "Run did not succeed"
            ),
        }
        Ok(())
    }
}

/// Pipes a rendered mail message into a transport command such as
/// `sendmail -t`.
pub struct CommandNotifier {
    tools: Arc<dyn ToolRunner>,
    command: Vec<String>,
    recipients: Vec<String>,
    attachments: Vec<String>,
    base_dir: PathBuf,
}

impl CommandNotifier {
    pub fn new(tools: Arc<dyn ToolRunner>, command: Vec<String>, recipients: Vec<String>) -> Self {
        Self {
            tools,
            command,
            recipients,
            attachments: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }

    /// Glob patterns, relative to `base_dir`, for extra files to reference.
    pub fn with_attachments(mut self, patterns: Vec<String>, base_dir: impl Into<PathBuf>) -> Self {
        self.attachments = patterns;
        self.base_dir = base_dir.into();
        self
    }

    fn collect_attachments(&self, run: &PipelineRun) -> Vec<ReportRef> {
        let mut refs = run.reports.clone();
        for pattern in &self.attachments {
            let full = self.base_dir.join(pattern);
            let matches = match glob(&full.to_string_lossy()) {
                Ok(matches) => matches,
                Err(err) => {
                    warn!(pattern = %pattern, error = %err, "Invalid attachment pattern");
                    continue;
                }
            };
            for path in matches.flatten() {
                if !path.is_file() || refs.iter().any(|r| same_file(&r.path, &path)) {
                    continue;
                }
                refs.push(ReportRef {
                    stage: "attachment".into(),
                    sha256: compute_sha256(&path).ok(),
                    path,
                });
            }
        }
        refs
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, run: &PipelineRun) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| PipelineError::Config("notification command is empty".into()))?;
        let message = render_message(run, &self.recipients, &self.collect_attachments(run));
        let output = self.tools.run(
            &ToolInvocation::new(program.as_str())
                .args(args.iter().cloned())
                .stdin(message),
        )?;
        if !output.success() {
            return Err(PipelineError::tool(program.as_str(), output.error_text()));
        }
        info!(recipients = self.recipients.len(), "Notification sent");
        Ok(())
    }
}

/// Keeps every run it is handed.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    runs: Arc<Mutex<Vec<PipelineRun>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the run, then reports a delivery failure.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> Vec<PipelineRun> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, run: &PipelineRun) -> Result<()> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(run.clone());
        if self.fail {
            return Err(PipelineError::tool("notifier", "transport unreachable"));
        }
        Ok(())
    }
}

pub fn subject(run: &PipelineRun) -> String {
    format!(
        "[shipyard] {} build {}: {}",
        run.app_name,
        run.build_id,
        status_label(run.status)
    )
}

pub fn render_message(run: &PipelineRun, recipients: &[String], reports: &[ReportRef]) -> String {
    let mut body = String::new();
    if !recipients.is_empty() {
        let _ = writeln!(body, "To: {}", recipients.join(", "));
    }
    let _ = writeln!(body, "Subject: {}", subject(run));
    let _ = writeln!(body);
    let _ = writeln!(
        body,
        "Build {} of {} ({}) finished: {}",
        run.build_id,
        run.app_name,
        run.image,
        status_label(run.status)
    );
    let _ = writeln!(body, "Branch: {}", run.branch);
    if let Some(repository) = &run.repository {
        let _ = writeln!(body, "Repository: {repository}");
    }
    if let (Some(start), Some(end)) = (run.started_at, run.finished_at) {
        let _ = writeln!(body, "Started: {}  Finished: {}", start.to_rfc3339(), end.to_rfc3339());
    }
    if let Some(error) = &run.error {
        let _ = writeln!(body, "Error: {error}");
    }

    let _ = writeln!(body, "\nStages:");
    for stage in &run.stages {
        let _ = write!(body, "  [{}] {}", result_label(stage.result), stage.name);
        if let Some(message) = &stage.message {
            let _ = write!(body, " - {message}");
        }
        let _ = writeln!(body);
    }

    if !run.published.is_empty() {
        let _ = writeln!(body, "\nPublished: {}", run.published.join(", "));
    }
    if !run.warnings.is_empty() {
        let _ = writeln!(body, "\nWarnings:");
        for warning in &run.warnings {
            let _ = writeln!(body, "  - {warning}");
        }
    }
    if !reports.is_empty() {
        let _ = writeln!(body, "\nReports:");
        for report in reports {
            let _ = write!(body, "  {}", report.path.display());
            if let Some(digest) = &report.sha256 {
                let _ = write!(body, " (sha256 {digest})");
            }
            let _ = writeln!(body);
        }
    }
    body
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "PENDING",
        RunStatus::Running => "RUNNING",
        RunStatus::Succeeded => "SUCCESS",
        RunStatus::Failed => "FAILURE",
        RunStatus::Aborted => "ABORTED",
    }
}

fn result_label(result: StageResult) -> &'static str {
    match result {
        StageResult::NotRun => "not run",
        StageResult::Running => "running",
        StageResult::Passed => "passed",
        StageResult::Failed => "failed",
        StageResult::Skipped => "skipped",
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
