#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use clap::Parser;
use futures::future::BoxFuture;
use tokio::sync::Notify;

use bacass_pipelines::cli::Arguments;
use bacass_pipelines::config::{RunConfig, RunContext};
use bacass_pipelines::dataflow::{DryRunExecutor, Executor, Job, Outputs, TaskExecutionError};

pub const HEADER: &str = "ID\tR1\tR2\tLongFastQ\tFast5\tGenomeSize";

pub fn write_manifest(dir: &Path, rows: &[&str]) -> Result<PathBuf> {
    let path = dir.join("samples.tsv");
    let mut text = String::from(HEADER);
    text.push('\n');
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    fs::write(&path, text)?;
    Ok(path)
}

/// Parses a command line the way the binary does, with fixed resource caps
/// so host detection never runs.
pub fn config(dir: &Path, manifest: &Path, extra: &[&str]) -> Result<RunConfig> {
    let out_dir = dir.join("results");
    let mut argv: Vec<String> = vec![
        "bacass-pipelines".to_string(),
        "-i".to_string(),
        manifest.display().to_string(),
        "-o".to_string(),
        out_dir.display().to_string(),
        "--max-cpus".to_string(),
        "4".to_string(),
        "--max-memory".to_string(),
        "16".to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    let args = Arguments::try_parse_from(argv)?;
    Ok(RunConfig::from_args(&args, dir)?)
}

pub fn context(config: RunConfig) -> Arc<RunContext> {
    Arc::new(RunContext::new(Arc::new(config)))
}

/// Dry-run executor that records every dispatch and fails on request.
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    calls: Arc<Mutex<Vec<(String, String)>>>,
    /// (task, sample); a `None` sample fails every instance of the task.
    failures: Arc<Vec<(String, Option<String>)>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(rules: &[(&str, Option<&str>)]) -> Self {
        RecordingExecutor {
            calls: Arc::default(),
            failures: Arc::new(
                rules
                    .iter()
                    .map(|(task, sample)| (task.to_string(), sample.map(str::to_string)))
                    .collect(),
            ),
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        let mut calls = self.calls.lock().unwrap().clone();
        calls.sort();
        calls
    }

    pub fn samples_for(&self, task: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(t, _)| t == task)
            .map(|(_, sample)| sample)
            .collect()
    }
}

impl Executor for RecordingExecutor {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn execute(&self, job: Job) -> BoxFuture<'static, Result<Outputs, TaskExecutionError>> {
        self.calls
            .lock()
            .unwrap()
            .push((job.task.clone(), job.key.label().to_string()));
        let fail = self
            .failures
            .iter()
            .any(|(task, sample)| task == &job.task && sample.as_deref().is_none_or(|s| s == job.key.label()));
        if fail {
            let tool = job.tool.clone();
            return Box::pin(async move {
                Err(TaskExecutionError::ExitStatus {
                    tool,
                    code: Some(1),
                    stderr: "simulated failure".to_string(),
                })
            });
        }
        DryRunExecutor.execute(job)
    }
}

/// Holds instances of one task until they are cancelled; everything else
/// behaves like a dry run.
#[derive(Clone)]
pub struct BlockingExecutor {
    pub task: String,
    pub started: Arc<Notify>,
}

impl BlockingExecutor {
    pub fn new(task: &str) -> Self {
        BlockingExecutor {
            task: task.to_string(),
            started: Arc::new(Notify::new()),
        }
    }
}

impl Executor for BlockingExecutor {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn execute(&self, job: Job) -> BoxFuture<'static, Result<Outputs, TaskExecutionError>> {
        if job.task != self.task {
            return DryRunExecutor.execute(job);
        }
        let started = self.started.clone();
        Box::pin(async move {
            started.notify_one();
            job.cancel.cancelled().await;
            Err(TaskExecutionError::Cancelled)
        })
    }
}
