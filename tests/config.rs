mod common;

use std::fs;

use anyhow::Result;
use clap::Parser;

use bacass_pipelines::cli::{Arguments, Assembler, AssemblyType};
use bacass_pipelines::config::{PipelineError, RunConfig, RunContext};
use bacass_pipelines::dataflow::{ResourceClass, Resources};

use common::{config, write_manifest};

fn configuration_error(result: Result<RunConfig>) -> String {
    match result.map_err(|e| e.downcast::<PipelineError>()) {
        Err(Ok(PipelineError::Configuration(msg))) => msg,
        Err(Ok(other)) => panic!("expected a configuration error, got {}", other),
        Err(Err(other)) => panic!("expected a configuration error, got {}", other),
        Ok(_) => panic!("expected a configuration error, got a valid configuration"),
    }
}

#[test]
fn test_defaults() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = write_manifest(tmp.path(), &[])?;
    let config = config(tmp.path(), &manifest, &["--skip-kraken2"])?;

    assert_eq!(config.assembler, Assembler::Unicycler);
    assert_eq!(config.assembly_type, AssemblyType::Short);
    assert!(!config.long_reads_enabled());
    assert!(!config.dry_run);
    assert_eq!(config.out_dir, tmp.path().join("results"));
    assert_eq!(config.manifest, manifest);
    Ok(())
}

#[test]
fn test_canu_requires_genome_size() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = write_manifest(tmp.path(), &[])?;

    let msg = configuration_error(config(
        tmp.path(),
        &manifest,
        &["--skip-kraken2", "--assembler", "canu", "--assembly-type", "long"],
    ));
    assert!(msg.contains("--genome-size"));

    let ok = config(
        tmp.path(),
        &manifest,
        &["--skip-kraken2", "--assembler", "canu", "--assembly-type", "long", "--genome-size", "4.6m"],
    )?;
    assert_eq!(ok.genome_size.as_deref(), Some("4.6m"));
    Ok(())
}

#[test]
fn test_long_read_assemblers_require_long_mode() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = write_manifest(tmp.path(), &[])?;
    let msg = configuration_error(config(
        tmp.path(),
        &manifest,
        &["--skip-kraken2", "--assembler", "miniasm", "--assembly-type", "hybrid"],
    ));
    assert!(msg.contains("miniasm"));
    Ok(())
}

#[test]
fn test_kraken2_database_checked() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = write_manifest(tmp.path(), &[])?;

    let msg = configuration_error(config(tmp.path(), &manifest, &[]));
    assert!(msg.contains("--kraken2-db"));

    let msg = configuration_error(config(tmp.path(), &manifest, &["-k", "missing_db"]));
    assert!(msg.contains("does not exist"));

    fs::create_dir_all(tmp.path().join("db"))?;
    let ok = config(tmp.path(), &manifest, &["-k", "db"])?;
    assert_eq!(ok.kraken2_db, Some(tmp.path().join("db")));
    Ok(())
}

#[test]
fn test_missing_manifest_is_rejected() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let msg = configuration_error(config(tmp.path(), &tmp.path().join("absent.tsv"), &["--skip-kraken2"]));
    assert!(msg.contains("Manifest"));
    Ok(())
}

#[test]
fn test_resources_capped_by_run_limits() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = write_manifest(tmp.path(), &[])?;
    let config = config(tmp.path(), &manifest, &["--skip-kraken2"])?;

    assert_eq!(config.resources(ResourceClass::Large), Resources { cpus: 4, memory_gb: 16 });
    assert!(config.resources(ResourceClass::Small).cpus <= 4);
    Ok(())
}

#[test]
fn test_extra_tool_arguments_split() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = write_manifest(tmp.path(), &[])?;
    let config = config(
        tmp.path(),
        &manifest,
        &["--skip-kraken2", "--unicycler-args", "--mode bold", "--prokka-args", "--kingdom Bacteria"],
    )?;
    assert_eq!(config.unicycler_args, vec!["--mode", "bold"]);
    assert_eq!(config.prokka_args, vec!["--kingdom", "Bacteria"]);
    Ok(())
}

#[test]
fn test_context_snapshot() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let manifest = write_manifest(tmp.path(), &[])?;
    let args = Arguments::try_parse_from([
        "bacass-pipelines",
        "-i",
        manifest.to_str().unwrap_or_default(),
        "--skip-kraken2",
        "--assembly-type",
        "hybrid",
        "--max-cpus",
        "2",
        "--max-memory",
        "8",
        "--email",
        "lab@example.org",
    ])?;
    let config = RunConfig::from_args(&args, tmp.path())?;
    let ctx = RunContext::new(config.into());

    assert!(ctx.run_name.starts_with("bacass_"));
    assert_eq!(ctx.summary.get("run_name"), Some(&ctx.run_name));
    assert_eq!(ctx.summary.get("assembly_type").map(String::as_str), Some("hybrid"));
    assert_eq!(ctx.summary.get("email").map(String::as_str), Some("lab@example.org"));
    assert_eq!(ctx.summary.get("max_memory").map(String::as_str), Some("8 GB"));
    assert!(ctx.summary.contains_key("polish_method"));
    assert!(!ctx.is_cancelled());
    Ok(())
}
