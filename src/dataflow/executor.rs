//! Execution backends.
//!
//! The scheduler hands every ready instance to an [`Executor`] as a [`Job`]
//! and only looks at the outcome: the declared outputs, or a
//! [`TaskExecutionError`].

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::dataflow::channel::SampleKey;
use crate::dataflow::node::{OutputDecl, Resources};
use crate::utils::file::{prepare_work_dir, touch};
use crate::utils::streams::tail_file;

pub const COMMAND_SCRIPT: &str = ".command.sh";
pub const COMMAND_STDOUT: &str = ".command.out";
pub const COMMAND_STDERR: &str = ".command.err";

const STDERR_TAIL_LINES: usize = 20;

pub type Outputs = BTreeMap<String, PathBuf>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskExecutionError {
    #[error("could not build command for {tool}: {error}")]
    Command { tool: String, error: String },

    #[error("failed to spawn {tool}: {error}")]
    Spawn { tool: String, error: String },

    #[error("{tool} exited with {}: {stderr}", code.map(|c| c.to_string()).unwrap_or_else(|| "a signal".to_string()))]
    ExitStatus {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{tool} did not produce declared output {path}")]
    MissingOutput { tool: String, path: String },

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(String),
}

/// An external command, either a single program with arguments or a bash
/// script for stages that pipe tools together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Work-directory-relative file receiving stdout instead of the log.
    pub stdout: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            stdout: None,
        }
    }

    pub fn shell(script: impl Into<String>) -> Self {
        CommandSpec::new("bash").args(["-euo", "pipefail", "-c"]).arg(script)
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

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn stdout_to(mut self, file: impl Into<String>) -> Self {
        self.stdout = Some(file.into());
        self
    }

    /// Shell-readable rendering, written to the work directory for the record.
    pub fn render(&self) -> String {
        let mut parts = vec![shell_quote(&self.program)];
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        let mut line = parts.join(" ");
        if let Some(out) = &self.stdout {
            line.push_str(" > ");
            line.push_str(&shell_quote(out));
        }
        line
    }
}

/// Quotes `s` for a POSIX shell unless it only holds safe characters.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c)) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// One ready task instance, fully rendered.
#[derive(Debug, Clone)]
pub struct Job {
    pub task: String,
    pub tool: String,
    pub key: SampleKey,
    pub resources: Resources,
    pub command: CommandSpec,
    pub work_dir: PathBuf,
    pub outputs: Vec<OutputDecl>,
    pub cancel: CancellationToken,
}

pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    fn execute(&self, job: Job) -> BoxFuture<'static, Result<Outputs, TaskExecutionError>>;
}

/// Checks the declared outputs of a finished job and maps them to absolute
/// paths. Optional outputs that are missing are left out.
pub fn collect_outputs(job: &Job) -> Result<Outputs, TaskExecutionError> {
    let mut outputs = Outputs::new();
    for decl in &job.outputs {
        let relative = decl.resolve(&job.key);
        let path = job.work_dir.join(&relative);
        let exists = if decl.dir { path.is_dir() } else { path.exists() };
        if exists {
            outputs.insert(decl.name.clone(), path);
        } else if !decl.optional {
            return Err(TaskExecutionError::MissingOutput {
                tool: job.tool.clone(),
                path: relative,
            });
        }
    }
    Ok(outputs)
}

fn write_command_script(job: &Job) -> Result<(), TaskExecutionError> {
    let script = format!("#!/usr/bin/env bash\n# {} ({})\n{}\n", job.task, job.key, job.command.render());
    fs::write(job.work_dir.join(COMMAND_SCRIPT), script).map_err(|e| TaskExecutionError::Io(e.to_string()))
}

/// Runs each job as a local external process.
///
/// CPU and memory reservations are taken from two semaphores sized to the
/// host limits, so jobs queue here when aggregate demand exceeds capacity.
pub struct ProcessExecutor {
    cpus: Arc<Semaphore>,
    memory: Arc<Semaphore>,
    max_cpus: usize,
    max_memory_gb: u64,
}

impl ProcessExecutor {
    pub fn new(max_cpus: usize, max_memory_gb: u64) -> Self {
        let max_cpus = max_cpus.max(1);
        let max_memory_gb = max_memory_gb.max(1);
        ProcessExecutor {
            cpus: Arc::new(Semaphore::new(max_cpus)),
            memory: Arc::new(Semaphore::new(max_memory_gb as usize)),
            max_cpus,
            max_memory_gb,
        }
    }

    async fn run(
        job: Job,
        cpus: Arc<Semaphore>,
        memory: Arc<Semaphore>,
        cpu_permits: u32,
        memory_permits: u32,
    ) -> Result<Outputs, TaskExecutionError> {
        let _cpu_permit = tokio::select! {
            _ = job.cancel.cancelled() => return Err(TaskExecutionError::Cancelled),
            permit = cpus.acquire_many_owned(cpu_permits) => permit.map_err(|e| TaskExecutionError::Io(e.to_string()))?,
        };
        let _memory_permit = tokio::select! {
            _ = job.cancel.cancelled() => return Err(TaskExecutionError::Cancelled),
            permit = memory.acquire_many_owned(memory_permits) => permit.map_err(|e| TaskExecutionError::Io(e.to_string()))?,
        };

        prepare_work_dir(&job.work_dir).map_err(|e| TaskExecutionError::Io(e.to_string()))?;
        write_command_script(&job)?;

        let stdout_path = job.work_dir.join(job.command.stdout.as_deref().unwrap_or(COMMAND_STDOUT));
        let stderr_path = job.work_dir.join(COMMAND_STDERR);
        let stdout = fs::File::create(&stdout_path).map_err(|e| TaskExecutionError::Io(e.to_string()))?;
        let stderr = fs::File::create(&stderr_path).map_err(|e| TaskExecutionError::Io(e.to_string()))?;

        debug!("[{} {}] {}", job.task, job.key, job.command.render());
        let mut child = Command::new(&job.command.program)
            .args(&job.command.args)
            .current_dir(&job.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TaskExecutionError::Spawn {
                tool: job.tool.clone(),
                error: e.to_string(),
            })?;

        let status = tokio::select! {
            _ = job.cancel.cancelled() => {
                warn!("[{} {}] cancelling", job.task, job.key);
                let _ = child.kill().await;
                return Err(TaskExecutionError::Cancelled);
            }
            status = child.wait() => status.map_err(|e| TaskExecutionError::Io(e.to_string()))?,
        };

        if !status.success() {
            return Err(TaskExecutionError::ExitStatus {
                tool: job.tool.clone(),
                code: status.code(),
                stderr: tail_file(&stderr_path, STDERR_TAIL_LINES).await,
            });
        }

        collect_outputs(&job)
    }
}

impl Executor for ProcessExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn execute(&self, job: Job) -> BoxFuture<'static, Result<Outputs, TaskExecutionError>> {
        let cpu_permits = job.resources.cpus.clamp(1, self.max_cpus) as u32;
        let memory_permits = job.resources.memory_gb.clamp(1, self.max_memory_gb) as u32;
        let cpus = self.cpus.clone();
        let memory = self.memory.clone();
        Box::pin(Self::run(job, cpus, memory, cpu_permits, memory_permits))
    }
}

/// Renders every command without running it: the command script is written
/// and the declared, non-optional outputs are created empty.
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

impl DryRunExecutor {
    fn run(job: &Job) -> Result<Outputs, TaskExecutionError> {
        if job.cancel.is_cancelled() {
            return Err(TaskExecutionError::Cancelled);
        }
        prepare_work_dir(&job.work_dir).map_err(|e| TaskExecutionError::Io(e.to_string()))?;
        write_command_script(job)?;

        for decl in job.outputs.iter().filter(|d| !d.optional) {
            let path = job.work_dir.join(decl.resolve(&job.key));
            let created = if decl.dir { fs::create_dir_all(&path) } else { touch(&path) };
            created.map_err(|e| TaskExecutionError::Io(e.to_string()))?;
        }
        info!("[dry-run] {} ({}): {}", job.task, job.key, job.command.render());
        collect_outputs(job)
    }
}

impl Executor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn execute(&self, job: Job) -> BoxFuture<'static, Result<Outputs, TaskExecutionError>> {
        Box::pin(async move { Self::run(&job) })
    }
}
