//! The run loop.
//!
//! A single loop owns every channel slot and instance record. It evaluates
//! (node, key) pairs from a worklist as soon as all their inputs have
//! resolved, spawns ready task instances on a `JoinSet`, and only mutates
//! state when an instance completes. Which samples take part in a join or a
//! collect is decided by resolutions, never by completion order.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::{FxHashMap, FxHashSet};
use log::{debug, error, info, warn};
use petgraph::graph::NodeIndex;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::cli::JoinPolicy;
use crate::config::{PipelineError, RunContext};
use crate::dataflow::channel::{collect, join, mix, AbsentCause, Datum, JoinOutcome, Payload, Resolution, SampleKey};
use crate::dataflow::executor::{Executor, Job, Outputs, TaskExecutionError};
use crate::dataflow::graph::{DataflowGraph, NodeKind};
use crate::dataflow::node::{Invocation, TaskNode};
use crate::utils::file::sanitize_component;
use crate::utils::manifest::SampleRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkipReason {
    Disabled,
    Predicate,
    MissingInput,
    UpstreamFailed,
    JoinMismatch,
    Cancelled,
    EmptyInput,
}

impl SkipReason {
    fn from_cause(cause: AbsentCause) -> Self {
        match cause {
            AbsentCause::UpstreamFailed => SkipReason::UpstreamFailed,
            AbsentCause::JoinMismatch => SkipReason::JoinMismatch,
            AbsentCause::Cancelled => SkipReason::Cancelled,
            AbsentCause::NoData | AbsentCause::Disabled | AbsentCause::Predicate => SkipReason::MissingInput,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Disabled => "disabled",
            SkipReason::Predicate => "predicate",
            SkipReason::MissingInput => "missing_input",
            SkipReason::UpstreamFailed => "upstream_failed",
            SkipReason::JoinMismatch => "join_mismatch",
            SkipReason::Cancelled => "cancelled",
            SkipReason::EmptyInput => "empty_input",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl InstanceState {
    pub fn label(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Ready => "ready",
            InstanceState::Running => "running",
            InstanceState::Succeeded => "succeeded",
            InstanceState::Failed => "failed",
            InstanceState::Skipped(_) => "skipped",
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            InstanceState::Skipped(reason) => Some(*reason),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Succeeded | InstanceState::Failed | InstanceState::Skipped(_))
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Skipped(reason) => write!(f, "skipped ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// One (task, key) instance as it ended up.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub task: String,
    pub tool: String,
    pub key: SampleKey,
    pub state: InstanceState,
    /// True once the instance was handed to the executor.
    pub dispatched: bool,
    pub error: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub outputs: Outputs,
    pub elapsed: Option<Duration>,
}

impl InstanceRecord {
    fn pending(task: &TaskNode, key: SampleKey) -> Self {
        InstanceRecord {
            task: task.name.clone(),
            tool: task.tool.to_string(),
            key,
            state: InstanceState::Pending,
            dispatched: false,
            error: None,
            work_dir: None,
            outputs: Outputs::new(),
            elapsed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinMismatchRecord {
    pub join: String,
    pub sample: String,
    pub policy: JoinPolicy,
}

/// Everything a report channel delivered, flattened to items.
#[derive(Debug, Clone)]
pub struct ReportInput {
    pub channel: String,
    /// Stage whose outputs the channel carries.
    pub task: String,
    pub items: Vec<Arc<Datum>>,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub instances: Vec<InstanceRecord>,
    pub report_inputs: Vec<ReportInput>,
    pub join_mismatches: Vec<JoinMismatchRecord>,
    pub cancelled: bool,
    /// Set when the run as a whole failed; the report is still rendered.
    pub failure: Option<PipelineError>,
}

impl RunOutcome {
    pub fn instances_of<'a>(&'a self, task: &'a str) -> impl Iterator<Item = &'a InstanceRecord> + 'a {
        self.instances.iter().filter(move |r| r.task == task)
    }

    pub fn instance(&self, task: &str, key: &SampleKey) -> Option<&InstanceRecord> {
        self.instances.iter().find(|r| r.task == task && &r.key == key)
    }

    pub fn dispatched(&self, task: &str) -> usize {
        self.instances_of(task).filter(|r| r.dispatched).count()
    }

    pub fn count(&self, state: InstanceState) -> usize {
        self.instances.iter().filter(|r| r.state == state).count()
    }
}

type SlotKey = (NodeIndex, SampleKey);

enum Slot {
    Resolved(Resolution),
    /// Every consumer has read the payload.
    Released,
}

pub struct Scheduler {
    graph: Arc<DataflowGraph>,
    executor: Arc<dyn Executor>,
    ctx: Arc<RunContext>,
}

impl Scheduler {
    pub fn new(graph: Arc<DataflowGraph>, executor: Arc<dyn Executor>, ctx: Arc<RunContext>) -> Self {
        Scheduler { graph, executor, ctx }
    }

    /// Runs the graph over the given samples until every instance is
    /// terminal.
    ///
    /// # Returns
    /// The outcome, including `failure` when the run as a whole failed. An
    /// `Err` is only returned when the scheduler itself cannot proceed.
    pub async fn run(&self, samples: &[Arc<SampleRecord>]) -> Result<RunOutcome, PipelineError> {
        let mut run = Run::new(self, samples);
        info!(
            "Scheduling {} nodes over {} samples on the {} executor",
            self.graph.node_count(),
            samples.len(),
            self.executor.name()
        );
        run.seed();

        let token = run.token.clone();
        let mut cancel_seen = false;
        loop {
            while let Some((node, key)) = run.worklist.pop_front() {
                run.evaluate(node, key);
            }
            if run.jobs.is_empty() {
                break;
            }

            tokio::select! {
                _ = token.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!("Cancellation requested, waiting for {} running jobs", run.jobs.len());
                }
                joined = run.jobs.join_next_with_id() => match joined {
                    Some(Ok((id, result))) => run.complete(id, result),
                    Some(Err(e)) => {
                        let id = e.id();
                        run.complete(id, Err(TaskExecutionError::Io(format!("job aborted: {}", e))));
                    }
                    None => {}
                },
            }
        }

        Ok(run.finish())
    }
}

struct Run<'a> {
    graph: &'a DataflowGraph,
    executor: &'a Arc<dyn Executor>,
    ctx: &'a Arc<RunContext>,
    token: CancellationToken,
    sample_keys: Vec<SampleKey>,
    samples: FxHashMap<String, Arc<SampleRecord>>,
    disabled: FxHashSet<NodeIndex>,
    consumer_counts: FxHashMap<NodeIndex, usize>,
    slots: FxHashMap<SlotKey, Slot>,
    remaining: FxHashMap<SlotKey, usize>,
    evaluated: FxHashSet<SlotKey>,
    records: FxHashMap<SlotKey, InstanceRecord>,
    running: FxHashMap<Id, (NodeIndex, SampleKey, Instant)>,
    jobs: JoinSet<Result<Outputs, TaskExecutionError>>,
    worklist: VecDeque<SlotKey>,
    mismatches: Vec<JoinMismatchRecord>,
    failure: Option<PipelineError>,
    released: usize,
}

impl<'a> Run<'a> {
    fn new(scheduler: &'a Scheduler, samples: &[Arc<SampleRecord>]) -> Self {
        let graph = scheduler.graph.as_ref();
        let config = &scheduler.ctx.config;

        let mut disabled: FxHashSet<NodeIndex> = graph
            .tasks()
            .filter(|(_, task)| !task.is_enabled(config))
            .map(|(i, _)| i)
            .collect();
        // Sources and combinators only run when something enabled reads
        // them, so a join feeding a disabled stage never reports mismatches.
        for &node in graph.topo_order().iter().rev() {
            if graph.node(node).task().is_some() || graph.report_inputs().contains(&node) {
                continue;
            }
            if graph.consumers(node).iter().all(|c| disabled.contains(c)) {
                disabled.insert(node);
            }
        }

        // Disabled consumers never read; report inputs hold their payload
        // until the end of the run.
        let mut consumer_counts = FxHashMap::default();
        for &node in graph.topo_order() {
            let count = graph
                .consumers(node)
                .iter()
                .filter(|c| !disabled.contains(c))
                .count();
            consumer_counts.insert(node, count);
        }
        for node in graph.report_inputs() {
            *consumer_counts.entry(*node).or_insert(0) += 1;
        }

        Run {
            graph,
            executor: &scheduler.executor,
            ctx: &scheduler.ctx,
            token: scheduler.ctx.cancel.child_token(),
            sample_keys: samples.iter().map(|s| SampleKey::Sample(s.id.clone())).collect(),
            samples: samples.iter().map(|s| (s.id.clone(), s.clone())).collect(),
            disabled,
            consumer_counts,
            slots: FxHashMap::default(),
            remaining: FxHashMap::default(),
            evaluated: FxHashSet::default(),
            records: FxHashMap::default(),
            running: FxHashMap::default(),
            jobs: JoinSet::new(),
            worklist: VecDeque::new(),
            mismatches: Vec::new(),
            failure: None,
            released: 0,
        }
    }

    fn keys_for(&self, node: NodeIndex) -> Vec<SampleKey> {
        if self.graph.node(node).keyed {
            self.sample_keys.clone()
        } else {
            vec![SampleKey::Global]
        }
    }

    /// Creates the instance table, resolves disabled stages up front and
    /// queues the entry points.
    fn seed(&mut self) {
        let graph = self.graph;
        for (node, task) in graph.tasks() {
            for key in self.keys_for(node) {
                self.records.insert((node, key.clone()), InstanceRecord::pending(task, key));
            }
        }

        let disabled: Vec<NodeIndex> = graph.topo_order().iter().copied().filter(|n| self.disabled.contains(n)).collect();
        for node in disabled {
            debug!("{} {} disabled for this run", graph.node(node).kind.label(), graph.node(node).name);
            for key in self.keys_for(node) {
                self.evaluated.insert((node, key.clone()));
                self.set_state(node, &key, InstanceState::Skipped(SkipReason::Disabled));
                self.resolve(node, key, Resolution::Absent(AbsentCause::Disabled));
            }
        }

        for &node in graph.topo_order() {
            match graph.node(node).kind {
                NodeKind::Source(_) => {
                    for key in self.sample_keys.clone() {
                        self.worklist.push_back((node, key));
                    }
                }
                NodeKind::Collect => self.worklist.push_back((node, SampleKey::Global)),
                _ => {}
            }
        }
    }

    fn set_state(&mut self, node: NodeIndex, key: &SampleKey, state: InstanceState) {
        if let Some(record) = self.records.get_mut(&(node, key.clone())) {
            record.state = state;
        }
    }

    fn input_slots(&self, node: NodeIndex, key: &SampleKey) -> Vec<SlotKey> {
        let collecting = matches!(self.graph.node(node).kind, NodeKind::Collect);
        let mut slots = Vec::new();
        for input in self.graph.inputs(node) {
            if collecting {
                slots.extend(self.sample_keys.iter().map(|k| (input, k.clone())));
            } else {
                slots.push((input, key.clone()));
            }
        }
        slots
    }

    fn is_ready(&self, node: NodeIndex, key: &SampleKey) -> bool {
        self.input_slots(node, key).iter().all(|slot| self.slots.contains_key(slot))
    }

    fn resolve(&mut self, node: NodeIndex, key: SampleKey, resolution: Resolution) {
        let consumers = self.consumer_counts.get(&node).copied().unwrap_or(0);
        let slot = (node, key.clone());
        if consumers == 0 {
            self.slots.insert(slot, Slot::Released);
        } else {
            self.remaining.insert(slot.clone(), consumers);
            self.slots.insert(slot, Slot::Resolved(resolution));
        }

        for consumer in self.graph.consumers(node) {
            if self.disabled.contains(&consumer) {
                continue;
            }
            let consumer_key = if self.graph.node(consumer).keyed {
                key.clone()
            } else {
                SampleKey::Global
            };
            self.worklist.push_back((consumer, consumer_key));
        }
    }

    /// Reads one input slot on behalf of a consumer and releases the payload
    /// once the last consumer has read it.
    fn read(&mut self, slot: SlotKey) -> Resolution {
        let resolution = match self.slots.get(&slot) {
            Some(Slot::Resolved(resolution)) => resolution.clone(),
            Some(Slot::Released) | None => {
                warn!("Channel {} read after release for {}", self.graph.node(slot.0).name, slot.1);
                return Resolution::Absent(AbsentCause::NoData);
            }
        };
        if let Some(left) = self.remaining.get_mut(&slot) {
            *left = left.saturating_sub(1);
            if *left == 0 {
                self.remaining.remove(&slot);
                self.slots.insert(slot, Slot::Released);
                self.released += 1;
            }
        }
        resolution
    }

    fn evaluate(&mut self, node: NodeIndex, key: SampleKey) {
        if self.evaluated.contains(&(node, key.clone())) || !self.is_ready(node, &key) {
            return;
        }
        self.evaluated.insert((node, key.clone()));

        let graph = self.graph;
        let slots = self.input_slots(node, &key);
        match &graph.node(node).kind {
            NodeKind::Source(extract) => {
                let resolution = match self.samples.get(key.label()).and_then(|s| extract(s.as_ref()).map(|f| (s, f))) {
                    Some((sample, files)) => {
                        Resolution::Present(Payload::Item(Arc::new(Datum::new(Some(sample.clone()), files))))
                    }
                    None => Resolution::Absent(AbsentCause::NoData),
                };
                self.resolve(node, key, resolution);
            }
            NodeKind::Join => {
                let inputs: Vec<Resolution> = slots.into_iter().map(|s| self.read(s)).collect();
                let resolution = match join(&inputs[0], &inputs[1]) {
                    JoinOutcome::Resolved(resolution) => resolution,
                    JoinOutcome::Mismatch(payload) => self.on_mismatch(node, &key, payload),
                };
                self.resolve(node, key, resolution);
            }
            NodeKind::Mix => {
                let inputs: Vec<Resolution> = slots.into_iter().map(|s| self.read(s)).collect();
                self.resolve(node, key, mix(&inputs));
            }
            NodeKind::Collect => {
                let inputs: Vec<Resolution> = slots.into_iter().map(|s| self.read(s)).collect();
                let payload = collect(&inputs);
                self.resolve(node, key, Resolution::Present(payload));
            }
            NodeKind::Task(task) => {
                let inputs: Vec<Resolution> = slots.into_iter().map(|s| self.read(s)).collect();
                self.evaluate_task(node, task, key, inputs);
            }
        }
    }

    fn on_mismatch(&mut self, node: NodeIndex, key: &SampleKey, payload: Payload) -> Resolution {
        let graph = self.graph;
        let name = &graph.node(node).name;
        let policy = self.ctx.config.join_policy;
        self.mismatches.push(JoinMismatchRecord {
            join: name.clone(),
            sample: key.label().to_string(),
            policy,
        });
        match policy {
            JoinPolicy::Skip => {
                warn!("Join {}: sample {} is missing one side, skipping it", name, key);
                Resolution::Absent(AbsentCause::JoinMismatch)
            }
            JoinPolicy::NullFill => {
                info!("Join {}: sample {} is missing one side, continuing with the side present", name, key);
                Resolution::Present(payload)
            }
            JoinPolicy::Fatal => {
                error!("Join {}: sample {} is missing one side, aborting the run", name, key);
                if self.failure.is_none() {
                    self.failure = Some(PipelineError::JoinMismatch {
                        join: name.clone(),
                        sample: key.label().to_string(),
                    });
                }
                self.token.cancel();
                Resolution::Absent(AbsentCause::JoinMismatch)
            }
        }
    }

    fn skip(&mut self, node: NodeIndex, key: SampleKey, reason: SkipReason, cause: AbsentCause) {
        debug!("[{} {}] skipped: {}", self.graph.node(node).name, key, reason);
        self.set_state(node, &key, InstanceState::Skipped(reason));
        self.resolve(node, key, Resolution::Absent(cause));
    }

    fn evaluate_task(&mut self, node: NodeIndex, task: &TaskNode, key: SampleKey, inputs: Vec<Resolution>) {
        if self.token.is_cancelled() {
            return self.skip(node, key, SkipReason::Cancelled, AbsentCause::Cancelled);
        }

        let absent = inputs
            .iter()
            .filter_map(Resolution::absent_cause)
            .fold(None, |acc: Option<AbsentCause>, cause| match acc {
                Some(prev) if prev.is_blocking() || !cause.is_blocking() => Some(prev),
                _ => Some(cause),
            });
        if let Some(cause) = absent {
            return self.skip(node, key, SkipReason::from_cause(cause), cause);
        }

        let payloads: Vec<Payload> = inputs
            .into_iter()
            .filter_map(|r| match r {
                Resolution::Present(payload) => Some(payload),
                Resolution::Absent(_) => None,
            })
            .collect();

        let sample = self.samples.get(key.label()).cloned().filter(|_| !key.is_global());
        if let Some(sample) = &sample {
            if !task.accepts(sample) {
                return self.skip(node, key, SkipReason::Predicate, AbsentCause::Predicate);
            }
        } else if payloads
            .iter()
            .all(|p| matches!(p, Payload::Collected(items) if items.is_empty()))
        {
            warn!("Stage {} has no collected inputs", task.name);
            return self.skip(node, key, SkipReason::EmptyInput, AbsentCause::NoData);
        }

        self.set_state(node, &key, InstanceState::Ready);
        let resources = self.ctx.config.resources(task.resource_class);
        let out_dir = &self.ctx.config.out_dir;
        let work_dir = match &key {
            SampleKey::Sample(id) => out_dir.join(sanitize_component(id)).join(&task.name),
            SampleKey::Global => out_dir.join(&task.name),
        };

        let invocation = Invocation {
            ctx: self.ctx.as_ref(),
            key: &key,
            inputs: &payloads,
            work_dir: &work_dir,
            resources,
        };
        let command = match (task.command)(&invocation) {
            Ok(command) => command,
            Err(e) => {
                let error = TaskExecutionError::Command {
                    tool: task.tool.to_string(),
                    error: e.to_string(),
                };
                error!("[{} {}] {}", task.name, key, error);
                if let Some(record) = self.records.get_mut(&(node, key.clone())) {
                    record.state = InstanceState::Failed;
                    record.error = Some(error.to_string());
                }
                self.resolve(node, key, Resolution::Absent(AbsentCause::UpstreamFailed));
                return;
            }
        };

        let job = Job {
            task: task.name.clone(),
            tool: task.tool.to_string(),
            key: key.clone(),
            resources,
            command,
            work_dir: work_dir.clone(),
            outputs: task.outputs.clone(),
            cancel: self.token.child_token(),
        };
        debug!("[{} {}] dispatching ({} cpus, {} GB)", task.name, key, resources.cpus, resources.memory_gb);
        let handle = self.jobs.spawn(self.executor.execute(job));
        self.running.insert(handle.id(), (node, key.clone(), Instant::now()));
        if let Some(record) = self.records.get_mut(&(node, key)) {
            record.state = InstanceState::Running;
            record.dispatched = true;
            record.work_dir = Some(work_dir);
        }
    }

    fn complete(&mut self, id: Id, result: Result<Outputs, TaskExecutionError>) {
        let Some((node, key, started)) = self.running.remove(&id) else {
            warn!("Completion for unknown job {}", id);
            return;
        };
        let name = self.graph.node(node).name.clone();
        let slot = (node, key.clone());
        let elapsed = started.elapsed();

        let resolution = match result {
            Ok(outputs) => {
                info!("[{} {}] succeeded in {:.1}s", name, key, elapsed.as_secs_f64());
                let sample = match &key {
                    SampleKey::Sample(id) => self.samples.get(id).cloned(),
                    SampleKey::Global => None,
                };
                let datum = Datum::new(sample, outputs.clone());
                if let Some(record) = self.records.get_mut(&slot) {
                    record.state = InstanceState::Succeeded;
                    record.outputs = outputs;
                    record.elapsed = Some(elapsed);
                }
                Resolution::Present(Payload::Item(Arc::new(datum)))
            }
            Err(TaskExecutionError::Cancelled) => {
                warn!("[{} {}] cancelled", name, key);
                if let Some(record) = self.records.get_mut(&slot) {
                    record.state = InstanceState::Skipped(SkipReason::Cancelled);
                    record.elapsed = Some(elapsed);
                }
                Resolution::Absent(AbsentCause::Cancelled)
            }
            Err(e) => {
                error!("[{} {}] failed: {}", name, key, e);
                if let Some(record) = self.records.get_mut(&slot) {
                    record.state = InstanceState::Failed;
                    record.error = Some(e.to_string());
                    record.elapsed = Some(elapsed);
                }
                Resolution::Absent(AbsentCause::UpstreamFailed)
            }
        };
        self.resolve(node, key, resolution);
    }

    /// Run-level failure from required stages: a per-sample stage that
    /// failed everywhere it ran, or a global stage that failed or had
    /// nothing to aggregate.
    fn required_failure(&self, order: &FxHashMap<NodeIndex, usize>) -> Option<PipelineError> {
        let mut required: Vec<(NodeIndex, &TaskNode)> = self
            .graph
            .tasks()
            .filter(|(i, task)| task.is_required() && !self.disabled.contains(i))
            .collect();
        required.sort_by_key(|(i, _)| order.get(i).copied());

        for (node, task) in required {
            let mut ran: Vec<&InstanceRecord> = self
                .records
                .iter()
                .filter(|((n, _), r)| *n == node && matches!(r.state, InstanceState::Succeeded | InstanceState::Failed))
                .map(|(_, r)| r)
                .collect();
            ran.sort_by(|a, b| a.key.cmp(&b.key));

            if self.graph.node(node).keyed {
                if !ran.is_empty() && ran.iter().all(|r| r.state == InstanceState::Failed) {
                    return Some(PipelineError::TaskExecution {
                        task: task.name.clone(),
                        sample: ran[0].key.label().to_string(),
                        error: ran[0].error.clone().unwrap_or_default(),
                    });
                }
                continue;
            }

            let record = self.records.get(&(node, SampleKey::Global));
            match record.map(|r| r.state) {
                Some(InstanceState::Failed) => {
                    return Some(PipelineError::TaskExecution {
                        task: task.name.clone(),
                        sample: SampleKey::Global.label().to_string(),
                        error: record.and_then(|r| r.error.clone()).unwrap_or_default(),
                    });
                }
                Some(InstanceState::Skipped(SkipReason::EmptyInput)) => {
                    return Some(PipelineError::AggregationIncomplete(task.name.clone()));
                }
                _ => {}
            }
        }
        None
    }

    fn finish(mut self) -> RunOutcome {
        let order: FxHashMap<NodeIndex, usize> =
            self.graph.topo_order().iter().enumerate().map(|(pos, &n)| (n, pos)).collect();

        let cancelled = self.ctx.cancel.is_cancelled();
        let failure = match self.failure.take() {
            Some(failure) => Some(failure),
            None if cancelled => Some(PipelineError::Cancelled),
            None => self.required_failure(&order),
        };

        let report_inputs = self
            .graph
            .report_inputs()
            .iter()
            .map(|&node| {
                let items = match self.slots.get(&(node, SampleKey::Global)) {
                    Some(Slot::Resolved(Resolution::Present(Payload::Collected(items)))) => items.to_vec(),
                    Some(Slot::Resolved(Resolution::Present(Payload::Item(item)))) => vec![item.clone()],
                    _ => Vec::new(),
                };
                let producer = match self.graph.node(node).kind {
                    NodeKind::Collect => self.graph.inputs(node).first().copied().unwrap_or(node),
                    _ => node,
                };
                ReportInput {
                    channel: self.graph.node(node).name.clone(),
                    task: self.graph.node(producer).name.clone(),
                    items,
                }
            })
            .collect();

        let mut instances: Vec<InstanceRecord> = self.records.drain().map(|(_, record)| record).collect();
        for record in instances.iter().filter(|r| !r.state.is_terminal()) {
            warn!("[{} {}] left in state {}", record.task, record.key, record.state);
        }
        instances.sort_by_key(|r| {
            let position = self.graph.find(&r.task).and_then(|n| order.get(&n).copied());
            (position, r.key.clone())
        });

        let succeeded = instances.iter().filter(|r| r.state == InstanceState::Succeeded).count();
        let failed = instances.iter().filter(|r| r.state == InstanceState::Failed).count();
        let skipped = instances.iter().filter(|r| r.state.skip_reason().is_some()).count();
        info!(
            "Run finished: {} succeeded, {} failed, {} skipped ({} payloads released early)",
            succeeded, failed, skipped, self.released
        );

        RunOutcome {
            instances,
            report_inputs,
            join_mismatches: std::mem::take(&mut self.mismatches),
            cancelled,
            failure,
        }
    }
}
