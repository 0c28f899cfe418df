//! Sample manifest loading.
//!
//! The manifest is a delimited table with the header
//! `ID, R1, R2, LongFastQ, Fast5, GenomeSize`, one row per sample. Tab and
//! comma delimiters are both accepted; the delimiter is picked from the
//! header line. Empty cells and `NA` mean "not provided".

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::Deserialize;

use crate::config::defs::{PipelineError, RunConfig};
use crate::utils::file::resolve_path;

pub const MANIFEST_COLUMNS: [&str; 6] = ["ID", "R1", "R2", "LongFastQ", "Fast5", "GenomeSize"];

const ABSENT_MARKER: &str = "NA";

/// One row of the manifest. Created once at load time and shared, never
/// mutated, by every task instance keyed on `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub id: String,
    pub short_reads_1: Option<PathBuf>,
    pub short_reads_2: Option<PathBuf>,
    pub long_reads: Option<PathBuf>,
    pub fast5_dir: Option<PathBuf>,
    pub genome_size: Option<String>,
}

impl SampleRecord {
    pub fn new(id: impl Into<String>) -> Self {
        SampleRecord {
            id: id.into(),
            short_reads_1: None,
            short_reads_2: None,
            long_reads: None,
            fast5_dir: None,
            genome_size: None,
        }
    }

    pub fn with_short_reads(mut self, r1: impl Into<PathBuf>, r2: impl Into<PathBuf>) -> Self {
        self.short_reads_1 = Some(r1.into());
        self.short_reads_2 = Some(r2.into());
        self
    }

    pub fn with_long_reads(mut self, reads: impl Into<PathBuf>) -> Self {
        self.long_reads = Some(reads.into());
        self
    }

    pub fn with_fast5(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fast5_dir = Some(dir.into());
        self
    }

    pub fn with_genome_size(mut self, size: impl Into<String>) -> Self {
        self.genome_size = Some(size.into());
        self
    }

    pub fn has_short_reads(&self) -> bool {
        self.short_reads_1.is_some() && self.short_reads_2.is_some()
    }

    pub fn has_long_reads(&self) -> bool {
        self.long_reads.is_some()
    }

    pub fn has_fast5(&self) -> bool {
        self.fast5_dir.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct ManifestRow {
    #[serde(rename = "ID")]
    id: Option<String>,
    #[serde(rename = "R1")]
    r1: Option<String>,
    #[serde(rename = "R2")]
    r2: Option<String>,
    #[serde(rename = "LongFastQ")]
    long_fastq: Option<String>,
    #[serde(rename = "Fast5")]
    fast5: Option<String>,
    #[serde(rename = "GenomeSize")]
    genome_size: Option<String>,
}

fn cell(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != ABSENT_MARKER)
}

fn malformed(line: u64, reason: impl Into<String>) -> PipelineError {
    PipelineError::MalformedManifest {
        line,
        reason: reason.into(),
    }
}

/// Loads the manifest named by the run configuration.
pub fn load_from_config(config: &RunConfig) -> Result<Vec<SampleRecord>, PipelineError> {
    load_manifest(&config.manifest, &config.cwd, config.fast5_dir.as_deref())
}

/// Reads and validates a manifest file.
///
/// # Arguments
/// * `path` - Manifest file.
/// * `cwd` - Base for relative read paths.
/// * `fast5_base` - Optional base for relative Fast5 directories.
///
/// # Returns
/// Sample records in manifest order, or PipelineError::MalformedManifest.
pub fn load_manifest(path: &Path, cwd: &Path, fast5_base: Option<&Path>) -> Result<Vec<SampleRecord>, PipelineError> {
    let text = fs::read_to_string(path)
        .map_err(|e| PipelineError::IOError(format!("Cannot read manifest {}: {}", path.display(), e)))?;
    parse_manifest(&text, cwd, fast5_base)
}

pub fn parse_manifest(text: &str, cwd: &Path, fast5_base: Option<&Path>) -> Result<Vec<SampleRecord>, PipelineError> {
    let header_line = text
        .lines()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| malformed(1, "manifest is empty, expected a header row"))?;
    let delimiter = if header_line.contains('\t') { b'\t' } else { b',' };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| malformed(1, format!("unreadable header: {}", e)))?
        .clone();

    if !headers.iter().any(|h| h == MANIFEST_COLUMNS[0]) {
        return Err(malformed(1, format!(
            "header row is absent, expected columns {}",
            MANIFEST_COLUMNS.join(",")
        )));
    }
    for column in MANIFEST_COLUMNS {
        if !headers.iter().any(|h| h == column) {
            return Err(malformed(1, format!("missing column {}", column)));
        }
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut samples = Vec::new();

    for result in reader.records() {
        let record = result.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            malformed(line, e.to_string())
        })?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }

        let row: ManifestRow = record
            .deserialize(Some(&headers))
            .map_err(|e| malformed(line, e.to_string()))?;

        let id = cell(row.id).ok_or_else(|| malformed(line, "missing ID"))?;
        if !seen.insert(id.clone()) {
            return Err(malformed(line, format!("duplicate ID {}", id)));
        }

        let r1 = cell(row.r1);
        let r2 = cell(row.r2);
        if r1.is_some() != r2.is_some() {
            return Err(malformed(line, format!("sample {} must provide both R1 and R2 or neither", id)));
        }

        let fast5_root = fast5_base.unwrap_or(cwd);
        let sample = SampleRecord {
            short_reads_1: r1.map(|p| resolve_path(Path::new(&p), cwd)),
            short_reads_2: r2.map(|p| resolve_path(Path::new(&p), cwd)),
            long_reads: cell(row.long_fastq).map(|p| resolve_path(Path::new(&p), cwd)),
            fast5_dir: cell(row.fast5).map(|p| resolve_path(Path::new(&p), fast5_root)),
            genome_size: cell(row.genome_size),
            id,
        };

        if !sample.has_short_reads() && !sample.has_long_reads() {
            warn!("Sample {} has neither short nor long reads; no assembly will be produced for it", sample.id);
        }
        debug!("Loaded sample {:?}", sample);
        samples.push(sample);
    }

    Ok(samples)
}
