//! Bacterial assembly pipeline: read QC and trimming, assembly with the
//! configured assembler, optional long-read polishing, classification,
//! annotation and a consolidated QC report.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{info, warn};

use crate::cli::{Assembler, AssemblyType, PolishMethod};
use crate::config::defs::{
    BANDAGE_TAG, CANU_TAG, FAST5, FASTQC_TAG, KRAKEN2_TAG, LONG_READS, MEDAKA_TAG, MINIASM_TAG, MINIMAP2_TAG,
    MULTIQC_TAG, NANOPLOT_TAG, NANOPOLISH_TAG, PORECHOP_TAG, PROKKA_TAG, PYCOQC_TAG, QUAST_TAG, RACON_TAG,
    SAMTOOLS_TAG, SHORT_READS_1, SHORT_READS_2, SKEWER_TAG, UNICYCLER_TAG,
};
use crate::config::{PipelineError, RunConfig, RunContext};
use crate::dataflow::executor::{shell_quote, CommandSpec, DryRunExecutor, Executor, ProcessExecutor};
use crate::dataflow::channel::Payload;
use crate::dataflow::graph::{DataflowGraph, GraphBuilder};
use crate::dataflow::node::{Invocation, ResourceClass, TaskNode};
use crate::dataflow::scheduler::Scheduler;
use crate::report::RunReport;
use crate::utils::command::check_versions;
use crate::utils::manifest::{load_from_config, SampleRecord};
use crate::utils::notify::send_completion_email;

// Files passed between stages
pub const FASTQC_DIR: &str = "fastqc";
pub const TRIMMED_1: &str = "trimmed_1";
pub const TRIMMED_2: &str = "trimmed_2";
pub const TRIM_LOG: &str = "trim_log";
pub const TRIMMED_LONG: &str = "trimmed_long";
pub const NANOPLOT_DIR: &str = "nanoplot";
pub const PYCOQC_HTML: &str = "pycoqc";
pub const SEQUENCING_SUMMARY: &str = "sequencing_summary";
pub const ASSEMBLY: &str = "assembly";
pub const UNPOLISHED: &str = "unpolished";
pub const GRAPH: &str = "graph";
pub const GRAPH_IMAGE: &str = "graph_image";
pub const KRAKEN2_REPORT: &str = "kraken2_report";
pub const ANNOTATION_DIR: &str = "annotation";
pub const QUAST_DIR: &str = "quast";
pub const MULTIQC_REPORT: &str = "multiqc_report";

/// Every external tool a run may call, probed once for the report.
pub const TOOLS: [&str; 18] = [
    FASTQC_TAG,
    SKEWER_TAG,
    PORECHOP_TAG,
    NANOPLOT_TAG,
    PYCOQC_TAG,
    UNICYCLER_TAG,
    CANU_TAG,
    MINIASM_TAG,
    MINIMAP2_TAG,
    RACON_TAG,
    MEDAKA_TAG,
    NANOPOLISH_TAG,
    SAMTOOLS_TAG,
    KRAKEN2_TAG,
    QUAST_TAG,
    PROKKA_TAG,
    BANDAGE_TAG,
    MULTIQC_TAG,
];

fn q(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

fn polishing(config: &RunConfig, method: PolishMethod) -> bool {
    config.assembly_type == AssemblyType::Long && !config.skip_polish && config.polish_method == method
}

/// Genome size for canu: the sample's own value wins over the run default.
fn genome_size(inv: &Invocation<'_>) -> Result<String> {
    inv.sample()
        .and_then(|s| s.genome_size.clone())
        .or_else(|| inv.config().genome_size.clone())
        .ok_or_else(|| anyhow!("no genome size for {}", inv.key))
}

/// Every file delivered on any input, item or collected, in input order.
fn every_file<'a>(inv: &'a Invocation<'_>) -> Vec<&'a Path> {
    let mut files = Vec::new();
    for payload in inv.inputs {
        match payload {
            Payload::Item(datum) => files.extend(datum.files.values().map(PathBuf::as_path)),
            Payload::Collected(items) => {
                for datum in items.iter() {
                    files.extend(datum.files.values().map(PathBuf::as_path));
                }
            }
        }
    }
    files
}

fn fastqc(inv: &Invocation<'_>) -> Result<CommandSpec> {
    Ok(CommandSpec::shell(format!(
        "mkdir -p {dir} && {tool} --quiet --threads {cpus} --outdir {dir} {r1} {r2}",
        dir = FASTQC_DIR,
        tool = FASTQC_TAG,
        cpus = inv.cpus(),
        r1 = q(inv.file(SHORT_READS_1)?),
        r2 = q(inv.file(SHORT_READS_2)?),
    )))
}

fn skewer(inv: &Invocation<'_>) -> Result<CommandSpec> {
    Ok(CommandSpec::new(SKEWER_TAG)
        .args(["--quiet", "-m", "pe", "-q", "3", "-n"])
        .arg("-t")
        .arg(inv.cpus())
        .args(["-o", inv.label()])
        .path(inv.file(SHORT_READS_1)?)
        .path(inv.file(SHORT_READS_2)?))
}

fn porechop(inv: &Invocation<'_>) -> Result<CommandSpec> {
    Ok(CommandSpec::new(PORECHOP_TAG)
        .arg("-i")
        .path(inv.file(LONG_READS)?)
        .arg("-t")
        .arg(inv.cpus())
        .arg("-o")
        .arg(format!("{}.trimmed.fastq", inv.label())))
}

fn nanoplot(inv: &Invocation<'_>) -> Result<CommandSpec> {
    Ok(CommandSpec::new(NANOPLOT_TAG)
        .arg("-t")
        .arg(inv.cpus())
        .arg("--fastq")
        .path(inv.file(TRIMMED_LONG)?)
        .args(["-o", NANOPLOT_DIR]))
}

fn pycoqc(inv: &Invocation<'_>) -> Result<CommandSpec> {
    Ok(CommandSpec::shell(format!(
        "Fast5_to_seq_summary -f {fast5} -t {cpus} -s sequencing_summary.txt --verbose_level 2 && {tool} -f sequencing_summary.txt -o pycoqc.html",
        fast5 = q(inv.file(FAST5)?),
        cpus = inv.cpus(),
        tool = PYCOQC_TAG,
    )))
}

fn unicycler(inv: &Invocation<'_>) -> Result<CommandSpec> {
    let short = inv.find_file(TRIMMED_1).zip(inv.find_file(TRIMMED_2));
    let long = inv.find_file(TRIMMED_LONG);
    if short.is_none() && long.is_none() {
        return Err(anyhow!("no reads to assemble for {}", inv.key));
    }
    let mut spec = CommandSpec::new(UNICYCLER_TAG).arg("-t").arg(inv.cpus());
    if let Some((r1, r2)) = short {
        spec = spec.arg("-1").path(r1).arg("-2").path(r2);
    }
    if let Some(long) = long {
        spec = spec.arg("-l").path(long);
    }
    Ok(spec.args(["-o", "unicycler"]).args(inv.config().unicycler_args.iter().cloned()))
}

fn canu(inv: &Invocation<'_>) -> Result<CommandSpec> {
    Ok(CommandSpec::new(CANU_TAG)
        .args(["-p", inv.label(), "-d", "canu"])
        .arg(format!("genomeSize={}", genome_size(inv)?))
        .arg(format!("maxThreads={}", inv.cpus()))
        .arg("-nanopore")
        .path(inv.file(TRIMMED_LONG)?))
}

fn miniasm(inv: &Invocation<'_>) -> Result<CommandSpec> {
    let reads = q(inv.file(TRIMMED_LONG)?);
    let sample = shell_quote(inv.label());
    Ok(CommandSpec::shell(format!(
        "{minimap2} -x ava-ont -t {cpus} {reads} {reads} > overlaps.paf && \
         {miniasm} -f {reads} overlaps.paf > {sample}.gfa && \
         awk '/^S/{{print \">\"$2\"\\n\"$3}}' {sample}.gfa > {sample}.unpolished.fasta",
        minimap2 = MINIMAP2_TAG,
        miniasm = MINIASM_TAG,
        cpus = inv.cpus(),
        reads = reads,
        sample = sample,
    )))
}

fn racon(inv: &Invocation<'_>) -> Result<CommandSpec> {
    let reads = q(inv.file(TRIMMED_LONG)?);
    let draft = q(inv.file(UNPOLISHED)?);
    Ok(CommandSpec::shell(format!(
        "{minimap2} -x map-ont -t {cpus} {draft} {reads} > mapped.paf && \
         {racon} -t {cpus} {reads} mapped.paf {draft} > {sample}.racon.fasta",
        minimap2 = MINIMAP2_TAG,
        racon = RACON_TAG,
        cpus = inv.cpus(),
        reads = reads,
        draft = draft,
        sample = shell_quote(inv.label()),
    )))
}

fn medaka(inv: &Invocation<'_>) -> Result<CommandSpec> {
    Ok(CommandSpec::new("medaka_consensus")
        .arg("-i")
        .path(inv.file(TRIMMED_LONG)?)
        .arg("-d")
        .path(inv.file(ASSEMBLY)?)
        .args(["-o", "medaka", "-t"])
        .arg(inv.cpus()))
}

fn nanopolish(inv: &Invocation<'_>) -> Result<CommandSpec> {
    let reads = q(inv.file(TRIMMED_LONG)?);
    let draft = q(inv.file(ASSEMBLY)?);
    let fast5 = inv
        .sample()
        .and_then(|s| s.fast5_dir.as_deref())
        .ok_or_else(|| anyhow!("no Fast5 directory for {}", inv.key))?;
    let fast5 = q(fast5);
    Ok(CommandSpec::shell(format!(
        "{np} index -d {fast5} {reads} && \
         {minimap2} -ax map-ont -t {cpus} {draft} {reads} | {samtools} sort -@ {cpus} -o reads.sorted.bam - && \
         {samtools} index reads.sorted.bam && \
         {np} variants --consensus -o polished.vcf -r {reads} -b reads.sorted.bam -g {draft} -t {cpus} && \
         {np} vcf2fasta --skip-checks -g {draft} polished.vcf > {sample}.polished.fasta",
        np = NANOPOLISH_TAG,
        minimap2 = MINIMAP2_TAG,
        samtools = SAMTOOLS_TAG,
        cpus = inv.cpus(),
        fast5 = fast5,
        reads = reads,
        draft = draft,
        sample = shell_quote(inv.label()),
    )))
}

fn bandage(inv: &Invocation<'_>) -> Result<CommandSpec> {
    Ok(CommandSpec::new(BANDAGE_TAG)
        .arg("image")
        .path(inv.file(GRAPH)?)
        .arg(format!("{}.graph.svg", inv.label())))
}

fn kraken2(inv: &Invocation<'_>) -> Result<CommandSpec> {
    let db = inv
        .config()
        .kraken2_db
        .clone()
        .ok_or_else(|| anyhow!("kraken2 database not configured"))?;
    let spec = CommandSpec::new(KRAKEN2_TAG)
        .arg("--db")
        .path(&db)
        .arg("--threads")
        .arg(inv.cpus())
        .arg("--report")
        .arg(format!("{}.kraken2.report.txt", inv.label()))
        .args(["--output", "/dev/null"]);
    match (inv.find_file(TRIMMED_1), inv.find_file(TRIMMED_2)) {
        (Some(r1), Some(r2)) => Ok(spec.arg("--paired").path(r1).path(r2)),
        _ => Ok(spec.path(inv.file(TRIMMED_LONG)?)),
    }
}

fn prokka(inv: &Invocation<'_>) -> Result<CommandSpec> {
    Ok(CommandSpec::new(PROKKA_TAG)
        .arg("--cpus")
        .arg(inv.cpus())
        .args(["--prefix", inv.label()])
        .args(["--outdir", ANNOTATION_DIR])
        .args(inv.config().prokka_args.iter().cloned())
        .path(inv.file(ASSEMBLY)?))
}

fn quast(inv: &Invocation<'_>) -> Result<CommandSpec> {
    let assemblies = inv.collected(0)?;
    let mut labels = Vec::new();
    let mut files = Vec::new();
    for datum in assemblies {
        let path = datum
            .file(ASSEMBLY)
            .ok_or_else(|| anyhow!("collected item without an assembly"))?;
        labels.push(datum.sample_id().unwrap_or("unknown").to_string());
        files.push(path.display().to_string());
    }
    Ok(CommandSpec::new(QUAST_TAG)
        .arg("-t")
        .arg(inv.cpus())
        .args(["-o", QUAST_DIR])
        .arg("--labels")
        .arg(labels.join(","))
        .args(files))
}

fn multiqc(inv: &Invocation<'_>) -> Result<CommandSpec> {
    let mut inputs: Vec<String> = every_file(inv).iter().map(|p| p.display().to_string()).collect();
    inputs.sort();
    inputs.dedup();
    Ok(CommandSpec::new(MULTIQC_TAG)
        .args(["-f", "-n", "multiqc_report.html"])
        .args(inputs))
}

fn source_files(pairs: &[(&str, &Option<PathBuf>)]) -> Option<BTreeMap<String, PathBuf>> {
    pairs
        .iter()
        .map(|&(name, path)| path.clone().map(|p| (name.to_string(), p)))
        .collect()
}

/// Wires the pipeline for one run configuration.
///
/// Stages the configuration turns off stay in the graph (their instances
/// are reported as disabled); only the assembler's input wiring depends on
/// the assembly type.
pub fn build_graph(config: &RunConfig) -> Result<DataflowGraph, PipelineError> {
    let mut g = GraphBuilder::new();

    let short_reads = g.source("short_reads", |s: &SampleRecord| {
        source_files(&[(SHORT_READS_1, &s.short_reads_1), (SHORT_READS_2, &s.short_reads_2)])
    })?;
    let long_reads = g.source("long_reads", |s: &SampleRecord| source_files(&[(LONG_READS, &s.long_reads)]))?;
    let fast5 = g.source("fast5", |s: &SampleRecord| {
        source_files(&[(LONG_READS, &s.long_reads), (FAST5, &s.fast5_dir)])
    })?;

    // QC and trimming
    let fastqc_out = g.task(
        TaskNode::new("fastqc", FASTQC_TAG)
            .input(short_reads)
            .dir_output(FASTQC_DIR, FASTQC_DIR)
            .resources(ResourceClass::Small)
            .command(fastqc),
    )?;
    let skewer_out = g.task(
        TaskNode::new("skewer", SKEWER_TAG)
            .input(short_reads)
            .output(TRIMMED_1, "{sample}-trimmed-pair1.fastq")
            .output(TRIMMED_2, "{sample}-trimmed-pair2.fastq")
            .output(TRIM_LOG, "{sample}-trimmed.log")
            .resources(ResourceClass::Medium)
            .command(skewer),
    )?;
    let porechop_out = g.task(
        TaskNode::new("porechop", PORECHOP_TAG)
            .input(long_reads)
            .output(TRIMMED_LONG, "{sample}.trimmed.fastq")
            .when(RunConfig::long_reads_enabled)
            .resources(ResourceClass::Medium)
            .command(porechop),
    )?;
    let nanoplot_out = g.task(
        TaskNode::new("nanoplot", NANOPLOT_TAG)
            .input(porechop_out)
            .dir_output(NANOPLOT_DIR, NANOPLOT_DIR)
            .when(RunConfig::long_reads_enabled)
            .resources(ResourceClass::Small)
            .command(nanoplot),
    )?;
    let pycoqc_out = g.task(
        TaskNode::new("pycoqc", PYCOQC_TAG)
            .input(fast5)
            .output(PYCOQC_HTML, "pycoqc.html")
            .output(SEQUENCING_SUMMARY, "sequencing_summary.txt")
            .when(RunConfig::long_reads_enabled)
            .resources(ResourceClass::Small)
            .command(pycoqc),
    )?;

    // Assembly
    let unicycler_input = match config.assembly_type {
        AssemblyType::Short => skewer_out,
        AssemblyType::Long => porechop_out,
        AssemblyType::Hybrid => g.join("hybrid_reads", skewer_out, porechop_out)?,
    };
    let unicycler_out = g.task(
        TaskNode::new("unicycler", UNICYCLER_TAG)
            .input(unicycler_input)
            .output(ASSEMBLY, "unicycler/assembly.fasta")
            .output(GRAPH, "unicycler/assembly.gfa")
            .when(|c| c.assembler == Assembler::Unicycler)
            .resources(ResourceClass::Large)
            .command(unicycler),
    )?;
    let canu_out = g.task(
        TaskNode::new("canu", CANU_TAG)
            .input(porechop_out)
            .output(ASSEMBLY, "canu/{sample}.contigs.fasta")
            .when(|c| c.assembler == Assembler::Canu)
            .resources(ResourceClass::Large)
            .command(canu),
    )?;
    let miniasm_out = g.task(
        TaskNode::new("miniasm", MINIASM_TAG)
            .input(porechop_out)
            .output(UNPOLISHED, "{sample}.unpolished.fasta")
            .output(GRAPH, "{sample}.gfa")
            .when(|c| c.assembler == Assembler::Miniasm)
            .resources(ResourceClass::Large)
            .command(miniasm),
    )?;
    let racon_input = g.join("racon_input", miniasm_out, porechop_out)?;
    let racon_out = g.task(
        TaskNode::new("racon", RACON_TAG)
            .input(racon_input)
            .output(ASSEMBLY, "{sample}.racon.fasta")
            .when(|c| c.assembler == Assembler::Miniasm)
            .resources(ResourceClass::Medium)
            .command(racon),
    )?;
    let assembly = g.mix("assembly", &[unicycler_out, canu_out, racon_out])?;

    // Long-read polishing
    let polish_input = g.join("polish_input", assembly, porechop_out)?;
    let medaka_out = g.task(
        TaskNode::new("medaka", MEDAKA_TAG)
            .input(polish_input)
            .output(ASSEMBLY, "medaka/consensus.fasta")
            .when(|c| polishing(c, PolishMethod::Medaka))
            .resources(ResourceClass::Medium)
            .command(medaka),
    )?;
    // Fast5 data is optional per sample, so it gates nanopolish through the
    // sample predicate rather than a join.
    let nanopolish_out = g.task(
        TaskNode::new("nanopolish", NANOPOLISH_TAG)
            .input(polish_input)
            .output(ASSEMBLY, "{sample}.polished.fasta")
            .when(|c| polishing(c, PolishMethod::Nanopolish))
            .when_sample(SampleRecord::has_fast5)
            .resources(ResourceClass::Large)
            .command(nanopolish),
    )?;
    let final_assembly = g.mix("final_assembly", &[nanopolish_out, medaka_out, assembly])?;

    // Assembly graph, classification, annotation
    let assembly_graph = g.mix("assembly_graph", &[unicycler_out, miniasm_out])?;
    g.task(
        TaskNode::new("bandage", BANDAGE_TAG)
            .input(assembly_graph)
            .output(GRAPH_IMAGE, "{sample}.graph.svg")
            .when(|c| c.assembler != Assembler::Canu)
            .resources(ResourceClass::Small)
            .command(bandage),
    )?;
    let trimmed_reads = g.mix("trimmed_reads", &[skewer_out, porechop_out])?;
    let kraken2_out = g.task(
        TaskNode::new("kraken2", KRAKEN2_TAG)
            .input(trimmed_reads)
            .output(KRAKEN2_REPORT, "{sample}.kraken2.report.txt")
            .when(|c| !c.skip_kraken2)
            .resources(ResourceClass::Large)
            .command(kraken2),
    )?;
    let prokka_out = g.task(
        TaskNode::new("prokka", PROKKA_TAG)
            .input(final_assembly)
            .dir_output(ANNOTATION_DIR, ANNOTATION_DIR)
            .when(|c| !c.skip_annotation)
            .resources(ResourceClass::Medium)
            .command(prokka),
    )?;

    // Run-wide aggregation
    let assemblies = g.collect("assemblies", final_assembly)?;
    let quast_out = g.task(
        TaskNode::new("quast", QUAST_TAG)
            .input(assemblies)
            .dir_output(QUAST_DIR, QUAST_DIR)
            .resources(ResourceClass::Medium)
            .required()
            .command(quast),
    )?;

    let fastqc_reports = g.collect("fastqc_reports", fastqc_out)?;
    let skewer_logs = g.collect("skewer_logs", skewer_out)?;
    let nanoplot_reports = g.collect("nanoplot_reports", nanoplot_out)?;
    let pycoqc_reports = g.collect("pycoqc_reports", pycoqc_out)?;
    let kraken2_reports = g.collect("kraken2_reports", kraken2_out)?;
    let prokka_reports = g.collect("prokka_reports", prokka_out)?;
    let multiqc_out = g.task(
        TaskNode::new("multiqc", MULTIQC_TAG)
            .input(fastqc_reports)
            .input(skewer_logs)
            .input(quast_out)
            .input(prokka_reports)
            .input(nanoplot_reports)
            .output(MULTIQC_REPORT, "multiqc_report.html")
            .resources(ResourceClass::Small)
            .command(multiqc),
    )?;

    for channel in [
        fastqc_reports,
        skewer_logs,
        nanoplot_reports,
        pycoqc_reports,
        kraken2_reports,
        prokka_reports,
        quast_out,
        multiqc_out,
    ] {
        g.report(channel)?;
    }

    g.build()
}

/// Runs the pipeline with the executor the configuration asks for.
pub async fn run(ctx: Arc<RunContext>) -> Result<RunReport, PipelineError> {
    let executor: Arc<dyn Executor> = if ctx.config.dry_run {
        Arc::new(DryRunExecutor)
    } else {
        Arc::new(ProcessExecutor::new(ctx.config.max_cpus, ctx.config.max_memory_gb))
    };
    run_with_executor(ctx, executor).await
}

/// Loads the manifest, schedules the graph, writes the run report and sends
/// the completion e-mail.
///
/// # Returns
/// The rendered report on success. When the run fails after scheduling
/// started the report is still written before the error is returned.
pub async fn run_with_executor(ctx: Arc<RunContext>, executor: Arc<dyn Executor>) -> Result<RunReport, PipelineError> {
    let config = ctx.config.clone();

    let samples: Vec<Arc<SampleRecord>> = load_from_config(&config)?.into_iter().map(Arc::new).collect();
    info!("Loaded {} samples from {}", samples.len(), config.manifest.display());

    let graph = Arc::new(build_graph(&config)?);

    let versions = if config.dry_run {
        BTreeMap::new()
    } else {
        check_versions(&TOOLS).await
    };

    std::fs::create_dir_all(&config.out_dir)?;
    let scheduler = Scheduler::new(graph, executor, ctx.clone());
    let mut outcome = scheduler.run(&samples).await?;

    let report = RunReport::aggregate(&ctx, &outcome, versions);
    report.write(&config.out_dir)?;

    if let Some(recipient) = &config.email {
        send_completion_email(recipient, &report).await;
    }

    match outcome.failure.take() {
        Some(failure) => {
            warn!("Run {} did not complete: {}", ctx.run_name, failure);
            Err(failure)
        }
        None => Ok(report),
    }
}
