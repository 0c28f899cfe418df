mod common;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use bacass_pipelines::config::{PipelineError, RunContext};
use bacass_pipelines::dataflow::{
    CommandSpec, DataflowGraph, Executor, GraphBuilder, InstanceState, RunOutcome, SampleKey, Scheduler, SkipReason, TaskNode,
};
use bacass_pipelines::utils::manifest::SampleRecord;

use common::{config, context, write_manifest, BlockingExecutor, RecordingExecutor};

fn samples() -> Vec<Arc<SampleRecord>> {
    vec![
        Arc::new(SampleRecord::new("A").with_short_reads("/data/A_1.fq", "/data/A_2.fq")),
        Arc::new(
            SampleRecord::new("B")
                .with_short_reads("/data/B_1.fq", "/data/B_2.fq")
                .with_long_reads("/data/B.ont.fq"),
        ),
        Arc::new(SampleRecord::new("C").with_short_reads("/data/C_1.fq", "/data/C_2.fq")),
    ]
}

fn short(s: &SampleRecord) -> Option<BTreeMap<String, PathBuf>> {
    s.short_reads_1.clone().map(|p| BTreeMap::from([("reads".to_string(), p)]))
}

fn long(s: &SampleRecord) -> Option<BTreeMap<String, PathBuf>> {
    s.long_reads.clone().map(|p| BTreeMap::from([("long".to_string(), p)]))
}

fn stage(name: &str) -> TaskNode {
    TaskNode::new(name, "true")
        .output(name, "{sample}.out")
        .command(|_| Ok(CommandSpec::new("true")))
}

fn run_context(extra: &[&str]) -> Result<(tempfile::TempDir, Arc<RunContext>)> {
    let tmp = tempfile::tempdir()?;
    let manifest = write_manifest(tmp.path(), &["A\t/data/A_1.fq\t/data/A_2.fq\tNA\tNA\tNA"])?;
    let mut args = vec!["--skip-kraken2"];
    args.extend_from_slice(extra);
    let ctx = context(config(tmp.path(), &manifest, &args)?);
    Ok((tmp, ctx))
}

async fn run(graph: DataflowGraph, executor: Arc<dyn Executor>, ctx: Arc<RunContext>) -> Result<RunOutcome> {
    let scheduler = Scheduler::new(Arc::new(graph), executor, ctx);
    Ok(scheduler.run(&samples()).await?)
}

fn state(outcome: &RunOutcome, task: &str, sample: &str) -> Option<InstanceState> {
    outcome
        .instance(task, &SampleKey::Sample(sample.to_string()))
        .map(|r| r.state)
}

#[tokio::test]
async fn test_fan_out_and_collect() -> Result<()> {
    let (_tmp, ctx) = run_context(&[])?;
    let mut g = GraphBuilder::new();
    let reads = g.source("reads", short)?;
    g.task(stage("qc").input(reads))?;
    let trim = g.task(stage("trim").input(reads))?;
    let all = g.collect("all_trimmed", trim)?;
    let summary = g.task(stage("summary").input(all))?;
    g.report(all)?;
    g.report(summary)?;

    let executor = RecordingExecutor::new();
    let outcome = run(g.build()?, Arc::new(executor.clone()), ctx).await?;

    assert_eq!(executor.samples_for("qc"), vec!["A", "B", "C"]);
    assert_eq!(executor.samples_for("trim"), vec!["A", "B", "C"]);
    assert_eq!(executor.samples_for("summary"), vec!["all"]);
    assert!(outcome.failure.is_none());

    let collected = &outcome.report_inputs[0];
    assert_eq!(collected.task, "trim");
    let ids: Vec<_> = collected.items.iter().filter_map(|d| d.sample_id()).collect();
    assert_eq!(ids, vec!["A", "B", "C"]);
    assert_eq!(outcome.report_inputs[1].items.len(), 1);
    Ok(())
}

fn hybrid_graph() -> Result<DataflowGraph> {
    let mut g = GraphBuilder::new();
    let reads = g.source("reads", short)?;
    let long_reads = g.source("long_reads", long)?;
    let trimmed = g.task(stage("trim").input(reads))?;
    let joined = g.join("hybrid", trimmed, long_reads)?;
    g.task(stage("assemble").input(joined))?;
    Ok(g.build()?)
}

#[tokio::test]
async fn test_join_skip_policy() -> Result<()> {
    let (_tmp, ctx) = run_context(&[])?;
    let executor = RecordingExecutor::new();
    let outcome = run(hybrid_graph()?, Arc::new(executor.clone()), ctx).await?;

    assert_eq!(executor.samples_for("assemble"), vec!["B"]);
    assert_eq!(state(&outcome, "assemble", "A"), Some(InstanceState::Skipped(SkipReason::JoinMismatch)));
    assert_eq!(state(&outcome, "assemble", "C"), Some(InstanceState::Skipped(SkipReason::JoinMismatch)));
    assert_eq!(outcome.join_mismatches.len(), 2);
    assert!(outcome.failure.is_none());
    Ok(())
}

#[tokio::test]
async fn test_join_null_fill_policy() -> Result<()> {
    let (_tmp, ctx) = run_context(&["--join-policy", "null-fill"])?;
    let executor = RecordingExecutor::new();
    let outcome = run(hybrid_graph()?, Arc::new(executor.clone()), ctx).await?;

    assert_eq!(executor.samples_for("assemble"), vec!["A", "B", "C"]);
    assert_eq!(outcome.join_mismatches.len(), 2);
    assert!(outcome.failure.is_none());
    Ok(())
}

#[tokio::test]
async fn test_join_fatal_policy() -> Result<()> {
    let (_tmp, ctx) = run_context(&["--join-policy", "fatal"])?;
    let outcome = run(hybrid_graph()?, Arc::new(RecordingExecutor::new()), ctx.clone()).await?;

    assert!(matches!(outcome.failure, Some(PipelineError::JoinMismatch { ref join, .. }) if join == "hybrid"));
    assert!(!outcome.cancelled);
    assert!(!ctx.is_cancelled());
    assert_ne!(state(&outcome, "assemble", "A"), Some(InstanceState::Succeeded));
    assert!(outcome.instances.iter().all(|r| r.state.is_terminal()));
    Ok(())
}

#[tokio::test]
async fn test_join_ignores_upstream_failure() -> Result<()> {
    let (_tmp, ctx) = run_context(&["--join-policy", "fatal"])?;
    let executor = RecordingExecutor::failing(&[("trim", Some("B"))]);
    let mut g = GraphBuilder::new();
    let reads = g.source("reads", short)?;
    let long_reads = g.source("long_reads", |s: &SampleRecord| {
        s.short_reads_1.clone().map(|p| BTreeMap::from([("long".to_string(), p)]))
    })?;
    let trimmed = g.task(stage("trim").input(reads))?;
    let joined = g.join("hybrid", trimmed, long_reads)?;
    g.task(stage("assemble").input(joined))?;
    let outcome = run(g.build()?, Arc::new(executor), ctx).await?;

    assert!(outcome.failure.is_none());
    assert!(outcome.join_mismatches.is_empty());
    assert_eq!(state(&outcome, "assemble", "B"), Some(InstanceState::Skipped(SkipReason::UpstreamFailed)));
    assert_eq!(state(&outcome, "assemble", "A"), Some(InstanceState::Succeeded));
    Ok(())
}

#[tokio::test]
async fn test_failure_is_contained_to_sample() -> Result<()> {
    let (_tmp, ctx) = run_context(&[])?;
    let executor = RecordingExecutor::failing(&[("trim", Some("A"))]);
    let mut g = GraphBuilder::new();
    let reads = g.source("reads", short)?;
    let trimmed = g.task(stage("trim").input(reads))?;
    let assembled = g.task(stage("assemble").input(trimmed))?;
    let all = g.collect("assemblies", assembled)?;
    g.task(stage("quast").input(all).required())?;
    let outcome = run(g.build()?, Arc::new(executor.clone()), ctx).await?;

    assert_eq!(state(&outcome, "trim", "A"), Some(InstanceState::Failed));
    assert_eq!(state(&outcome, "assemble", "A"), Some(InstanceState::Skipped(SkipReason::UpstreamFailed)));
    assert_eq!(executor.samples_for("assemble"), vec!["B", "C"]);
    assert_eq!(executor.samples_for("quast"), vec!["all"]);
    assert!(outcome.failure.is_none());
    let failed = outcome.instance("trim", &SampleKey::Sample("A".to_string())).unwrap();
    assert!(failed.error.as_deref().unwrap_or_default().contains("simulated failure"));
    Ok(())
}

#[tokio::test]
async fn test_required_stage_failing_everywhere_fails_run() -> Result<()> {
    let (_tmp, ctx) = run_context(&[])?;
    let executor = RecordingExecutor::failing(&[("trim", None)]);
    let mut g = GraphBuilder::new();
    let reads = g.source("reads", short)?;
    g.task(stage("trim").input(reads).required())?;
    let outcome = run(g.build()?, Arc::new(executor), ctx).await?;

    match outcome.failure {
        Some(PipelineError::TaskExecution { task, sample, .. }) => {
            assert_eq!(task, "trim");
            assert_eq!(sample, "A");
        }
        other => panic!("expected a task execution failure, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_required_aggregation_with_empty_input() -> Result<()> {
    let (_tmp, ctx) = run_context(&[])?;
    let executor = RecordingExecutor::new();
    let mut g = GraphBuilder::new();
    let nothing = g.source("nothing", |_: &SampleRecord| None)?;
    let all = g.collect("all", nothing)?;
    g.task(stage("quast").input(all).required())?;
    let outcome = run(g.build()?, Arc::new(executor.clone()), ctx).await?;

    assert!(executor.samples_for("quast").is_empty());
    assert_eq!(
        outcome.instance("quast", &SampleKey::Global).map(|r| r.state),
        Some(InstanceState::Skipped(SkipReason::EmptyInput))
    );
    assert!(matches!(outcome.failure, Some(PipelineError::AggregationIncomplete(ref name)) if name == "quast"));
    Ok(())
}

#[tokio::test]
async fn test_disabled_stage_never_dispatched() -> Result<()> {
    let (_tmp, ctx) = run_context(&[])?;
    let executor = RecordingExecutor::new();
    let mut g = GraphBuilder::new();
    let reads = g.source("reads", short)?;
    let classified = g.task(stage("kraken2").input(reads).when(|c| !c.skip_kraken2))?;
    g.task(stage("summarize").input(classified))?;
    let outcome = run(g.build()?, Arc::new(executor.clone()), ctx).await?;

    assert_eq!(outcome.dispatched("kraken2"), 0);
    assert!(executor.calls().is_empty());
    assert!(outcome
        .instances_of("kraken2")
        .all(|r| r.state == InstanceState::Skipped(SkipReason::Disabled)));
    assert!(outcome
        .instances_of("summarize")
        .all(|r| r.state == InstanceState::Skipped(SkipReason::MissingInput)));
    Ok(())
}

#[tokio::test]
async fn test_mix_falls_through_disabled_branch() -> Result<()> {
    let (_tmp, ctx) = run_context(&[])?;
    let executor = RecordingExecutor::new();
    let mut g = GraphBuilder::new();
    let reads = g.source("reads", short)?;
    let polished = g.task(stage("polish").input(reads).when(|_| false))?;
    let draft = g.task(stage("draft").input(reads))?;
    let best = g.mix("best", &[polished, draft])?;
    g.task(stage("annotate").input(best))?;
    run(g.build()?, Arc::new(executor.clone()), ctx).await?;

    assert_eq!(executor.samples_for("annotate"), vec!["A", "B", "C"]);
    assert!(executor.samples_for("polish").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_sample_predicate_skips() -> Result<()> {
    let (_tmp, ctx) = run_context(&[])?;
    let executor = RecordingExecutor::new();
    let mut g = GraphBuilder::new();
    let reads = g.source("reads", short)?;
    g.task(stage("nanopolish").input(reads).when_sample(SampleRecord::has_long_reads))?;
    let outcome = run(g.build()?, Arc::new(executor.clone()), ctx).await?;

    assert_eq!(executor.samples_for("nanopolish"), vec!["B"]);
    assert_eq!(state(&outcome, "nanopolish", "A"), Some(InstanceState::Skipped(SkipReason::Predicate)));
    Ok(())
}

#[tokio::test]
async fn test_cancellation_skips_pending_work() -> Result<()> {
    let (_tmp, ctx) = run_context(&[])?;
    let executor = BlockingExecutor::new("trim");
    let started = executor.started.clone();
    let mut g = GraphBuilder::new();
    let reads = g.source("reads", short)?;
    let trimmed = g.task(stage("trim").input(reads))?;
    g.task(stage("assemble").input(trimmed))?;

    let scheduler = Scheduler::new(Arc::new(g.build()?), Arc::new(executor), ctx.clone());
    let handle = tokio::spawn(async move { scheduler.run(&samples()).await });
    started.notified().await;
    ctx.cancel.cancel();
    let outcome = handle.await??;

    assert!(outcome.cancelled);
    assert!(matches!(outcome.failure, Some(PipelineError::Cancelled)));
    assert!(outcome
        .instances_of("trim")
        .all(|r| r.state == InstanceState::Skipped(SkipReason::Cancelled)));
    assert!(outcome
        .instances_of("assemble")
        .all(|r| r.state == InstanceState::Skipped(SkipReason::Cancelled)));
    Ok(())
}
