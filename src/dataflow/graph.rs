//! Graph construction.
//!
//! Every node owns exactly one output channel, so a `Channel` is a handle to
//! the node that produces it. Edges point from producer to consumer and carry
//! the input position on the consumer side.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use fxhash::FxHashMap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::config::PipelineError;
use crate::dataflow::channel::Channel;
use crate::dataflow::node::TaskNode;
use crate::utils::manifest::SampleRecord;

/// Extracts a source's files from a sample, or `None` when the sample does
/// not feed this source.
pub type SourceFn = Arc<dyn Fn(&SampleRecord) -> Option<BTreeMap<String, PathBuf>> + Send + Sync>;

#[derive(Clone)]
pub enum NodeKind {
    Source(SourceFn),
    Task(TaskNode),
    Join,
    Mix,
    Collect,
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Source(_) => "source",
            NodeKind::Task(_) => "task",
            NodeKind::Join => "join",
            NodeKind::Mix => "mix",
            NodeKind::Collect => "collect",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Task(task) => f.debug_tuple("Task").field(task).finish(),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    /// Per-sample output channel, or a single global one.
    pub keyed: bool,
}

impl Node {
    pub fn task(&self) -> Option<&TaskNode> {
        match &self.kind {
            NodeKind::Task(task) => Some(task),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct GraphBuilder {
    graph: DiGraph<Node, usize>,
    report_inputs: Vec<NodeIndex>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, name: &str, kind: NodeKind, keyed: bool, inputs: &[Channel]) -> Result<Channel, PipelineError> {
        for channel in inputs {
            if self.graph.node_weight(channel.node).is_none() {
                return Err(PipelineError::Graph(format!("{} references an unknown channel", name)));
            }
        }
        let node = self.graph.add_node(Node {
            name: name.to_string(),
            kind,
            keyed,
        });
        for (position, channel) in inputs.iter().enumerate() {
            self.graph.add_edge(channel.node, node, position);
        }
        Ok(Channel { node, keyed })
    }

    fn require_keyed(name: &str, op: &str, inputs: &[Channel]) -> Result<(), PipelineError> {
        if inputs.iter().any(|c| !c.keyed) {
            return Err(PipelineError::Graph(format!("{} {} accepts only per-sample channels", op, name)));
        }
        Ok(())
    }

    /// Entry channel fed from the sample records.
    pub fn source(
        &mut self,
        name: &str,
        extract: impl Fn(&SampleRecord) -> Option<BTreeMap<String, PathBuf>> + Send + Sync + 'static,
    ) -> Result<Channel, PipelineError> {
        self.add(name, NodeKind::Source(Arc::new(extract)), true, &[])
    }

    /// Registers a task. Its inputs must be all per-sample (one instance per
    /// sample) or all global (a single instance).
    pub fn task(&mut self, task: TaskNode) -> Result<Channel, PipelineError> {
        let inputs = task.inputs.clone();
        if inputs.is_empty() {
            return Err(PipelineError::Graph(format!("task {} has no inputs", task.name)));
        }
        let keyed = inputs[0].keyed;
        if inputs.iter().any(|c| c.keyed != keyed) {
            return Err(PipelineError::Graph(format!(
                "task {} mixes per-sample and collected inputs",
                task.name
            )));
        }
        let name = task.name.clone();
        self.add(&name, NodeKind::Task(task), keyed, &inputs)
    }

    /// Matches two per-sample channels by sample id.
    pub fn join(&mut self, name: &str, left: Channel, right: Channel) -> Result<Channel, PipelineError> {
        Self::require_keyed(name, "join", &[left, right])?;
        self.add(name, NodeKind::Join, true, &[left, right])
    }

    /// First present input per sample, in the given order.
    pub fn mix(&mut self, name: &str, inputs: &[Channel]) -> Result<Channel, PipelineError> {
        if inputs.is_empty() {
            return Err(PipelineError::Graph(format!("mix {} has no inputs", name)));
        }
        Self::require_keyed(name, "mix", inputs)?;
        self.add(name, NodeKind::Mix, true, inputs)
    }

    /// Gathers every sample's output into one global set.
    pub fn collect(&mut self, name: &str, input: Channel) -> Result<Channel, PipelineError> {
        Self::require_keyed(name, "collect", &[input])?;
        self.add(name, NodeKind::Collect, false, &[input])
    }

    /// Marks a global channel as an input of the run report.
    pub fn report(&mut self, channel: Channel) -> Result<(), PipelineError> {
        if channel.keyed {
            return Err(PipelineError::Graph("report inputs must be collected channels".to_string()));
        }
        if self.graph.node_weight(channel.node).is_none() {
            return Err(PipelineError::Graph("report references an unknown channel".to_string()));
        }
        if !self.report_inputs.contains(&channel.node) {
            self.report_inputs.push(channel.node);
        }
        Ok(())
    }

    pub fn build(self) -> Result<DataflowGraph, PipelineError> {
        let mut names = HashSet::new();
        for node in self.graph.node_weights() {
            if !names.insert(node.name.as_str()) {
                return Err(PipelineError::Graph(format!("duplicate node name {}", node.name)));
            }
        }

        let order = toposort(&self.graph, None).map_err(|cycle| {
            PipelineError::Graph(format!("cycle detected at {}", self.graph[cycle.node_id()].name))
        })?;

        let by_name = self
            .graph
            .node_indices()
            .map(|i| (self.graph[i].name.clone(), i))
            .collect();

        Ok(DataflowGraph {
            graph: self.graph,
            order,
            report_inputs: self.report_inputs,
            by_name,
        })
    }
}

/// Validated, immutable pipeline graph.
pub struct DataflowGraph {
    graph: DiGraph<Node, usize>,
    order: Vec<NodeIndex>,
    report_inputs: Vec<NodeIndex>,
    by_name: FxHashMap<String, NodeIndex>,
}

impl DataflowGraph {
    pub fn node(&self, index: NodeIndex) -> &Node {
        &self.graph[index]
    }

    pub fn find(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    pub fn topo_order(&self) -> &[NodeIndex] {
        &self.order
    }

    pub fn report_inputs(&self) -> &[NodeIndex] {
        &self.report_inputs
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Producers feeding `index`, in input position order.
    pub fn inputs(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut edges: Vec<(usize, NodeIndex)> = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .map(|e| (*e.weight(), e.source()))
            .collect();
        edges.sort();
        edges.into_iter().map(|(_, source)| source).collect()
    }

    /// One entry per consuming edge; a node reading the same channel twice
    /// appears twice.
    pub fn consumers(&self, index: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(index, Direction::Outgoing)
            .map(|e| e.target())
            .collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = (NodeIndex, &TaskNode)> + '_ {
        self.order
            .iter()
            .filter_map(move |&i| self.graph[i].task().map(|task| (i, task)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reads(sample: &SampleRecord) -> Option<BTreeMap<String, PathBuf>> {
        sample.short_reads_1.clone().map(|p| BTreeMap::from([("r1".to_string(), p)]))
    }

    #[test]
    fn test_build_orders_inputs_and_consumers() {
        let mut builder = GraphBuilder::new();
        let short = builder.source("short", reads).unwrap();
        let long = builder.source("long", reads).unwrap();
        let joined = builder.join("hybrid", short, long).unwrap();
        let qc = builder.task(TaskNode::new("qc", "fastqc").input(short)).unwrap();
        let all = builder.collect("all_qc", qc).unwrap();
        builder.report(all).unwrap();
        let graph = builder.build().unwrap();

        assert_eq!(graph.inputs(joined.index()), vec![short.index(), long.index()]);
        assert_eq!(graph.consumers(short.index()).len(), 2);
        assert_eq!(graph.report_inputs(), &[all.index()]);
        assert_eq!(graph.find("qc"), Some(qc.index()));
        assert!(!all.is_keyed());
        assert_eq!(graph.tasks().count(), 1);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut builder = GraphBuilder::new();
        let short = builder.source("short", reads).unwrap();
        builder.task(TaskNode::new("short", "fastqc").input(short)).unwrap();
        assert!(matches!(builder.build(), Err(PipelineError::Graph(_))));
    }

    #[test]
    fn test_operand_kinds_checked() {
        let mut builder = GraphBuilder::new();
        let short = builder.source("short", reads).unwrap();
        let all = builder.collect("all", short).unwrap();
        assert!(builder.join("bad_join", short, all).is_err());
        assert!(builder.mix("bad_mix", &[all]).is_err());
        assert!(builder.collect("bad_collect", all).is_err());
        assert!(builder.report(short).is_err());
        assert!(builder.task(TaskNode::new("mixed", "quast").input(short).input(all)).is_err());
        assert!(builder.task(TaskNode::new("orphan", "quast")).is_err());
    }
}
