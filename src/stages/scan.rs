use std::path::PathBuf;

use anyhow::{Result, anyhow};
use tracing::{info, warn};

use super::{ensure_consumed, take_path, take_string, take_string_list};
use crate::credentials::with_credential;
use crate::error::PipelineError;
use crate::gate::{GateResult, Verdict};
use crate::pipeline::{Stage, StageContext, StageOutcome, StageParameters};
use crate::reports::write_report;
use crate::tools::{ToolInvocation, ToolOutput};

const DEFAULT_CREDENTIAL_ENV: &str = "SCAN_TOKEN";
const DETAIL_LIMIT: usize = 512;

/// Runs a scanner command and feeds its exit status to the quality gate.
///
/// The command is expanded with the run placeholders (`{image}`,
/// `{build_id}`, ...). A zero exit is a pass. Standard output is kept as the
/// stage report when `report` is set.
pub(super) struct ScanStage {
    command: Vec<String>,
    report: Option<PathBuf>,
    credential: Option<String>,
    credential_env: String,
    username_env: Option<String>,
    working_dir: Option<PathBuf>,
}

impl ScanStage {
    pub(super) fn from_params(mut params: StageParameters) -> Result<Self> {
        let command = take_string_list(&mut params, "command")?
            .filter(|command| !command.is_empty())
            .ok_or_else(|| anyhow!("scan stage requires a non-empty 'command' parameter"))?;
        let report = take_path(&mut params, "report");
        let credential = take_string(&mut params, "credential");
        let credential_env = take_string(&mut params, "credential_env")
            .unwrap_or_else(|| DEFAULT_CREDENTIAL_ENV.into());
        let username_env = take_string(&mut params, "username_env");
        let working_dir = take_path(&mut params, "working_dir");
        ensure_consumed("scan", &params)?;
        Ok(Self {
            command,
            report,
            credential,
            credential_env,
            username_env,
            working_dir,
        })
    }

    fn invocation(&self, ctx: &StageContext<'_>) -> ToolInvocation {
        let mut parts = self.command.iter().map(|part| ctx.config.expand(part));
        let program = parts.next().unwrap_or_default();
        let dir = match &self.working_dir {
            Some(dir) => ctx.config.resolve(dir),
            None => ctx.config.workspace.clone(),
        };
        ToolInvocation::new(program).args(parts).current_dir(dir)
    }

    fn scan(&self, ctx: &StageContext<'_>) -> Result<ToolOutput, PipelineError> {
        let invocation = self.invocation(ctx);
        let tools = ctx.tools;
        match &self.credential {
            Some(reference) => {
                let id = ctx.config.credentials.lookup(reference);
                with_credential(ctx.credentials, &id, |bindings| {
                    let mut invocation = invocation;
                    for (key, value) in
                        bindings.env(&self.credential_env, self.username_env.as_deref())?
                    {
                        invocation = invocation.env(key, value);
                    }
                    tools.run(&invocation)
                })
            }
            None => tools.run(&invocation),
        }
    }
}

impl Stage for ScanStage {
    fn name(&self) -> &'static str {
        "scan"
    }

    fn run(&self, ctx: &mut StageContext<'_>) -> Result<StageOutcome, PipelineError> {
        let output = self.scan(ctx)?;

        if let Some(report) = &self.report {
            let expanded = ctx.config.expand(&report.to_string_lossy());
            let path = ctx.config.resolve(&PathBuf::from(expanded));
            let report = write_report(ctx.stage, &path, &output.stdout)?;
            info!(report = %report.path.display(), "Scan report written");
            ctx.state.reports.push(report);
        }

        let (verdict, detail) = if output.success() {
            (Verdict::Passed, None)
        } else {
            let code = output
                .status
                .map_or_else(|| "signal".to_string(), |code| code.to_string());
            let mut detail = format!("scanner exited with {code}");
            let text = output.error_text();
            if let Some(line) = text.lines().rev().find(|line| !line.trim().is_empty()) {
                detail.push_str(": ");
                detail.push_str(truncate(line.trim(), DETAIL_LIMIT));
            }
            (Verdict::Failed, Some(detail))
        };

        match ctx.gate.evaluate(ctx.stage, verdict, ctx.policy, detail.clone()) {
            GateResult::HaltRun => Err(PipelineError::BlockingScan {
                stage: ctx.stage.to_string(),
                reason: detail.unwrap_or_default(),
            }),
            GateResult::Proceed if verdict == Verdict::Failed => {
                let reason = detail.unwrap_or_default();
                warn!(reason = %reason, "Scan reported findings");
                Ok(StageOutcome::Failed { reason })
            }
            GateResult::Proceed => Ok(StageOutcome::Passed),
        }
    }
}

fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
