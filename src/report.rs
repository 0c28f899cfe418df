//! Run report aggregation.
//!
//! Once every instance is terminal the report channels are flattened into
//! fragments and written to `<outdir>/pipeline_info/`. The two TSV files carry
//! no timestamps so that re-running the same inputs reproduces them byte for
//! byte; timing lives in the JSON and text renderings only.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use log::{info, warn};
use serde::Serialize;

use crate::config::defs::{
    EXECUTION_SUMMARY_TSV, PIPELINE_INFO_DIR, PIPELINE_NAME, REPORT_FRAGMENTS_TSV, REPORT_JSON, RUN_SUMMARY_TXT,
};
use crate::config::{PipelineError, RunContext};
use crate::dataflow::scheduler::{InstanceState, RunOutcome};
use crate::utils::file::relative_to;

/// One file delivered to the report.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fragment {
    pub channel: String,
    pub sample: String,
    pub task: String,
    pub output: String,
    /// Relative to the output directory.
    pub path: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceRow {
    pub task: String,
    pub sample: String,
    pub tool: String,
    pub state: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
struct InstanceDetail {
    #[serde(flatten)]
    row: InstanceRow,
    work_dir: Option<String>,
    error: Option<String>,
    elapsed_secs: Option<f64>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MismatchRow {
    pub join: String,
    pub sample: String,
    pub policy: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pipeline: String,
    version: String,
    run_name: String,
    pub status: RunStatus,
    failure: Option<String>,
    started_at: String,
    finished_at: String,
    duration_secs: f64,
    parameters: BTreeMap<String, String>,
    versions: BTreeMap<String, String>,
    pub fragments: Vec<Fragment>,
    pub mismatches: Vec<MismatchRow>,
    /// Report channels that received nothing.
    pub warnings: Vec<String>,
    instances: Vec<InstanceDetail>,
    #[serde(skip)]
    finished: DateTime<Local>,
}

impl RunReport {
    /// Builds the report from a finished run.
    ///
    /// # Arguments
    /// * `ctx` - Run context; supplies the parameter snapshot and start time.
    /// * `outcome` - What the scheduler produced.
    /// * `versions` - Tool versions probed at start.
    pub fn aggregate(ctx: &RunContext, outcome: &RunOutcome, versions: BTreeMap<String, String>) -> Self {
        let out_dir = &ctx.config.out_dir;

        let mut fragments = Vec::new();
        let mut warnings = Vec::new();
        for input in &outcome.report_inputs {
            let before = fragments.len();
            for datum in &input.items {
                let sample = datum.sample_id().unwrap_or("all").to_string();
                for (output, path) in &datum.files {
                    fragments.push(Fragment {
                        channel: input.channel.clone(),
                        sample: sample.clone(),
                        task: input.task.clone(),
                        output: output.clone(),
                        path: relative_to(path, out_dir).display().to_string(),
                    });
                }
            }
            if fragments.len() == before {
                let warning = PipelineError::AggregationIncomplete(input.channel.clone()).to_string();
                warn!("{}", warning);
                warnings.push(warning);
            }
        }
        fragments.sort();

        let instances = outcome
            .instances
            .iter()
            .map(|record| InstanceDetail {
                row: InstanceRow {
                    task: record.task.clone(),
                    sample: record.key.label().to_string(),
                    tool: record.tool.clone(),
                    state: record.state.label().to_string(),
                    reason: record.state.skip_reason().map(|r| r.to_string()).unwrap_or_default(),
                },
                work_dir: record
                    .work_dir
                    .as_ref()
                    .map(|dir| relative_to(dir, out_dir).display().to_string()),
                error: record.error.clone(),
                elapsed_secs: record.elapsed.map(|d| d.as_secs_f64()),
            })
            .collect();

        let mismatches = outcome
            .join_mismatches
            .iter()
            .map(|m| MismatchRow {
                join: m.join.clone(),
                sample: m.sample.clone(),
                policy: m.policy.to_string(),
            })
            .collect();

        let status = match &outcome.failure {
            None => RunStatus::Succeeded,
            Some(PipelineError::Cancelled) => RunStatus::Cancelled,
            Some(_) => RunStatus::Failed,
        };

        let finished = Local::now();
        let duration = finished.signed_duration_since(ctx.started_at);
        RunReport {
            pipeline: PIPELINE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            run_name: ctx.run_name.clone(),
            status,
            failure: outcome.failure.as_ref().map(|e| e.to_string()),
            started_at: ctx.started_at.to_rfc3339(),
            finished_at: finished.to_rfc3339(),
            duration_secs: duration.num_milliseconds() as f64 / 1000.0,
            parameters: (*ctx.summary).clone(),
            versions,
            fragments,
            mismatches,
            warnings,
            instances,
            finished,
        }
    }

    pub fn instance_rows(&self) -> impl Iterator<Item = &InstanceRow> {
        self.instances.iter().map(|detail| &detail.row)
    }

    pub fn count_state(&self, state: InstanceState) -> usize {
        self.instance_rows().filter(|row| row.state == state.label()).count()
    }

    /// Writes every report file.
    ///
    /// # Returns
    /// The `pipeline_info` directory.
    pub fn write(&self, out_dir: &Path) -> Result<PathBuf, PipelineError> {
        let info_dir = out_dir.join(PIPELINE_INFO_DIR);
        fs::create_dir_all(&info_dir)?;

        write_tsv(&info_dir.join(REPORT_FRAGMENTS_TSV), &self.fragments)?;

        let mut rows: Vec<&InstanceRow> = self.instance_rows().collect();
        rows.sort_by(|a, b| (&a.task, &a.sample).cmp(&(&b.task, &b.sample)));
        write_tsv(&info_dir.join(EXECUTION_SUMMARY_TSV), rows)?;

        let json = File::create(info_dir.join(REPORT_JSON))?;
        let mut writer = BufWriter::new(json);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| PipelineError::IOError(format!("Failed to serialize run report: {}", e)))?;
        writer.flush()?;

        fs::write(info_dir.join(RUN_SUMMARY_TXT), self.summary_text())?;
        info!("Run report written to {}", info_dir.display());
        Ok(info_dir)
    }

    pub fn subject(&self) -> String {
        let status = match self.status {
            RunStatus::Succeeded => "Successful",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "Cancelled",
        };
        format!("[{}] {}: {}", PIPELINE_NAME, status, self.run_name)
    }

    /// Plain-text rendering used for `run_summary.txt` and the e-mail body.
    pub fn summary_text(&self) -> String {
        let mut text = String::new();
        text.push_str(&format!("{} v{}\n", self.pipeline, self.version));
        text.push_str(&format!("Run name:   {}\n", self.run_name));
        text.push_str(&format!("Status:     {:?}\n", self.status));
        if let Some(failure) = &self.failure {
            text.push_str(&format!("Failure:    {}\n", failure));
        }
        text.push_str(&format!("Started:    {}\n", self.started_at));
        text.push_str(&format!("Finished:   {}\n", self.finished.format("%Y-%m-%d %H:%M:%S")));
        text.push_str(&format!("Duration:   {:.1}s\n", self.duration_secs));

        text.push_str("\nParameters\n");
        for (key, value) in &self.parameters {
            text.push_str(&format!("  {:<18} {}\n", key, value));
        }

        text.push_str("\nInstances\n");
        for state in [InstanceState::Succeeded, InstanceState::Failed] {
            text.push_str(&format!("  {:<18} {}\n", state.label(), self.count_state(state)));
        }
        let skipped = self.instance_rows().filter(|r| r.state == "skipped").count();
        text.push_str(&format!("  {:<18} {}\n", "skipped", skipped));
        for row in self.instance_rows().filter(|r| r.state == "failed") {
            text.push_str(&format!("  failed: {} ({})\n", row.task, row.sample));
        }

        if !self.mismatches.is_empty() {
            text.push_str("\nJoin mismatches\n");
            for m in &self.mismatches {
                text.push_str(&format!("  {} {} ({})\n", m.join, m.sample, m.policy));
            }
        }

        if !self.warnings.is_empty() {
            text.push_str("\nWarnings\n");
            for w in &self.warnings {
                text.push_str(&format!("  {}\n", w));
            }
        }

        if !self.versions.is_empty() {
            text.push_str("\nSoftware versions\n");
            for (tool, version) in &self.versions {
                text.push_str(&format!("  {:<18} {}\n", tool, version));
            }
        }
        text
    }
}

fn write_tsv<I, T>(path: &Path, rows: I) -> Result<(), PipelineError>
where
    I: IntoIterator<Item = T>,
    T: Serialize,
{
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .map_err(|e| PipelineError::IOError(format!("Failed to create {}: {}", path.display(), e)))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| PipelineError::IOError(format!("Failed to write {}: {}", path.display(), e)))?;
    }
    writer.flush()?;
    Ok(())
}
