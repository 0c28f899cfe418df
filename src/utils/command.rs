/// Functions for probing external tools and shaping their command lines

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;

use anyhow::{anyhow, Result};
use futures::future::join_all;
use lazy_static::lazy_static;
use log::{debug, warn};
use tokio::process::Command;

use crate::config::defs::{
    BANDAGE_TAG, CANU_TAG, FASTQC_TAG, KRAKEN2_TAG, MEDAKA_TAG, MINIASM_TAG, MINIMAP2_TAG, MULTIQC_TAG,
    NANOPLOT_TAG, NANOPOLISH_TAG, PORECHOP_TAG, PROKKA_TAG, PYCOQC_TAG, QUAST_TAG, RACON_TAG, SAMTOOLS_TAG,
    SKEWER_TAG, UNICYCLER_TAG,
};
use crate::utils::streams::{read_child_output_to_vec, ChildStream};

pub const UNAVAILABLE: &str = "unavailable";

/// How to ask a tool for its version: the flag, and which whitespace token of
/// the first output line holds the version (`None` means the last one).
#[derive(Debug, Clone, Copy)]
pub struct VersionProbe {
    pub flag: &'static str,
    pub token: Option<usize>,
}

lazy_static! {
    pub static ref VERSION_PROBES: HashMap<&'static str, VersionProbe> = {
        let mut m = HashMap::new();
        m.insert(FASTQC_TAG, VersionProbe { flag: "--version", token: Some(1) });
        m.insert(SKEWER_TAG, VersionProbe { flag: "--version", token: None });
        m.insert(PORECHOP_TAG, VersionProbe { flag: "--version", token: Some(0) });
        m.insert(NANOPLOT_TAG, VersionProbe { flag: "--version", token: None });
        m.insert(PYCOQC_TAG, VersionProbe { flag: "--version", token: None });
        m.insert(UNICYCLER_TAG, VersionProbe { flag: "--version", token: None });
        m.insert(CANU_TAG, VersionProbe { flag: "--version", token: None });
        m.insert(MINIASM_TAG, VersionProbe { flag: "-V", token: Some(0) });
        m.insert(MINIMAP2_TAG, VersionProbe { flag: "--version", token: Some(0) });
        m.insert(RACON_TAG, VersionProbe { flag: "--version", token: Some(0) });
        m.insert(MEDAKA_TAG, VersionProbe { flag: "--version", token: None });
        m.insert(NANOPOLISH_TAG, VersionProbe { flag: "--version", token: Some(2) });
        m.insert(SAMTOOLS_TAG, VersionProbe { flag: "--version", token: Some(1) });
        m.insert(KRAKEN2_TAG, VersionProbe { flag: "--version", token: Some(2) });
        m.insert(QUAST_TAG, VersionProbe { flag: "--version", token: Some(1) });
        m.insert(PROKKA_TAG, VersionProbe { flag: "--version", token: Some(1) });
        m.insert(BANDAGE_TAG, VersionProbe { flag: "--version", token: None });
        m.insert(MULTIQC_TAG, VersionProbe { flag: "--version", token: None });
        m
    };
}

/// Splits an opaque pass-through argument string on whitespace.
pub fn split_extra_args(extra: &str) -> Vec<String> {
    extra.split_whitespace().map(str::to_string).collect()
}

/// Picks the version token out of a tool's first line of output.
pub fn parse_version_line(line: &str, probe: &VersionProbe) -> Option<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let token = match probe.token {
        Some(i) => tokens.get(i).copied(),
        None => tokens.last().copied(),
    }?;
    let version = token.trim_start_matches('v').trim_end_matches(',').to_string();
    if version.is_empty() { None } else { Some(version) }
}

/// Runs the tool's version flag and returns the reported version.
///
/// # Arguments
/// * `tool` - Tool tag from config::defs.
///
/// # Returns
/// The version string, or an error when the tool is unknown, missing or
/// prints nothing usable.
pub async fn check_version(tool: &str) -> Result<String> {
    let probe = VERSION_PROBES
        .get(tool)
        .ok_or_else(|| anyhow!("Unknown tool: {}", tool))?;

    let mut child = Command::new(tool)
        .arg(probe.flag)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", tool, e, tool))?;

    let mut lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
    if lines.iter().all(|l| l.trim().is_empty()) {
        lines = read_child_output_to_vec(&mut child, ChildStream::Stderr).await?;
    }
    let _ = child.wait().await;

    let first_line = lines
        .iter()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("No output from {} {}", tool, probe.flag))?;
    parse_version_line(first_line, probe)
        .ok_or_else(|| anyhow!("Invalid {} {} output: {}", tool, probe.flag, first_line))
}

/// Probes every tool concurrently. Missing tools are recorded as
/// `unavailable` rather than failing, since an execution backend may provide
/// them in its own environment.
pub async fn check_versions(tools: &[&str]) -> BTreeMap<String, String> {
    let probes = tools.iter().map(|tool| async move { (tool.to_string(), check_version(tool).await) });
    let mut versions = BTreeMap::new();
    for (tool, result) in join_all(probes).await {
        match result {
            Ok(version) => {
                debug!("{} version {}", tool, version);
                versions.insert(tool, version);
            }
            Err(e) => {
                warn!("Could not determine {} version: {}", tool, e);
                versions.insert(tool, UNAVAILABLE.to_string());
            }
        }
    }
    versions
}
