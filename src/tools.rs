//! External tool invocation.
//!
//! Every collaborator the pipeline drives (scanners, `docker`, `git`, the
//! notification transport) is reached through [`ToolRunner`]. Non-zero exits
//! come back as a [`ToolOutput`]; only spawn failures and timeouts are errors.

use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{PipelineError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Clone, Default)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
    pub stdin: Option<String>,
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program and arguments as a single line. Environment and stdin are
    /// never included since they carry credentials.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolInvocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field(
                "env",
                &self.env.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>(),
            )
            .field("current_dir", &self.current_dir)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Prefers stderr, falls back to stdout if stderr is empty.
    pub fn error_text(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.trim().to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            match self.status {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            }
        }
    }
}

pub trait ToolRunner: Send + Sync {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput>;
}

/// Runs invocations as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        debug!(command = %invocation.command_line(), "Spawning tool");
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| {
            PipelineError::tool(&invocation.program, format!("failed to start: {err}"))
        })?;

        if let (Some(input), Some(mut pipe)) = (&invocation.stdin, child.stdin.take())
            && let Err(err) = pipe.write_all(input.as_bytes())
        {
            drop(pipe);
            let _ = child.kill();
            let _ = child.wait();
            return Err(PipelineError::tool(
                &invocation.program,
                format!("failed to write stdin: {err}"),
            ));
        }

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let started = Instant::now();
        let status = loop {
            let polled = child.try_wait().map_err(|err| {
                PipelineError::tool(&invocation.program, format!("failed to wait: {err}"))
            })?;
            if let Some(status) = polled {
                break status;
            }
            if let Some(limit) = invocation.timeout
                && started.elapsed() >= limit
            {
                let _ = child.kill();
                let _ = child.wait();
                return Err(PipelineError::tool(
                    &invocation.program,
                    format!("timed out after {}s", limit.as_secs_f64()),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        };

        Ok(ToolOutput {
            status: status.code(),
            stdout: stdout.map(join_drain).unwrap_or_default(),
            stderr: stderr.map(join_drain).unwrap_or_default(),
        })
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn join_drain(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

/// Bounds every invocation of one stage by a single shared deadline.
///
/// Each call gets whatever time the stage has left; once the deadline has
/// passed, calls fail without spawning anything.
pub struct TimedRunner<'a> {
    inner: &'a dyn ToolRunner,
    deadline: Option<Instant>,
}

impl<'a> TimedRunner<'a> {
    /// Starts the stage clock now.
    pub fn new(inner: &'a dyn ToolRunner, timeout: Option<Duration>) -> Self {
        Self::with_deadline(inner, timeout.map(|limit| Instant::now() + limit))
    }

    pub fn with_deadline(inner: &'a dyn ToolRunner, deadline: Option<Instant>) -> Self {
        Self { inner, deadline }
    }
}

impl ToolRunner for TimedRunner<'_> {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        let Some(deadline) = self.deadline else {
            return self.inner.run(invocation);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(PipelineError::tool(
                &invocation.program,
                "stage timed out before the command could start",
            ));
        }
        let limit = invocation.timeout.map_or(remaining, |own| own.min(remaining));
        self.inner.run(&invocation.clone().timeout(limit))
    }
}

#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Exit(ToolOutput),
    SpawnError(String),
}

/// Answers invocations from a script instead of spawning processes.
///
/// Rules match on a prefix of `[program, args...]`; the first matching rule
/// wins and unmatched invocations succeed with empty output. Every call is
/// recorded. Backs `--dry-run` and the integration tests.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    rules: Arc<Mutex<Vec<(Vec<String>, ScriptedResponse)>>>,
    calls: Arc<Mutex<Vec<ToolInvocation>>>,
    announce: bool,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs every intercepted command at info level.
    pub fn dry_run() -> Self {
        Self {
            announce: true,
            ..Self::default()
        }
    }

    pub fn respond(self, prefix: &[&str], output: ToolOutput) -> Self {
        self.push_rule(prefix, ScriptedResponse::Exit(output))
    }

    pub fn refuse(self, prefix: &[&str], reason: &str) -> Self {
        self.push_rule(prefix, ScriptedResponse::SpawnError(reason.to_string()))
    }

    fn push_rule(self, prefix: &[&str], response: ScriptedResponse) -> Self {
        self.rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((prefix.iter().map(|s| s.to_string()).collect(), response));
        self
    }

    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(ToolInvocation::command_line).collect()
    }
}

impl ToolRunner for ScriptedRunner {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput> {
        if self.announce {
            info!(command = %invocation.command_line(), "dry-run: skipping external command");
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.clone());

        let tokens: Vec<&str> = std::iter::once(invocation.program.as_str())
            .chain(invocation.args.iter().map(String::as_str))
            .collect();
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let matched = rules.iter().find(|(prefix, _)| {
            prefix.len() <= tokens.len() && prefix.iter().zip(&tokens).all(|(p, t)| p == t)
        });
        match matched {
            Some((_, ScriptedResponse::Exit(output))) => Ok(output.clone()),
            Some((_, ScriptedResponse::SpawnError(reason))) => {
                Err(PipelineError::tool(&invocation.program, reason.clone()))
            }
            None => Ok(ToolOutput::ok("")),
        }
    }
}
