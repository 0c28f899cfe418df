//! Static stage definitions.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::config::{RunConfig, RunContext};
use crate::dataflow::channel::{Channel, Datum, Payload, SampleKey};
use crate::dataflow::executor::CommandSpec;
use crate::utils::manifest::SampleRecord;

/// Placeholder expanded to the sample id (or `all` for global instances) in
/// declared output paths.
pub const SAMPLE_PLACEHOLDER: &str = "{sample}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceClass {
    Small,
    Medium,
    Large,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceClass::Small => f.write_str("small"),
            ResourceClass::Medium => f.write_str("medium"),
            ResourceClass::Large => f.write_str("large"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub cpus: usize,
    pub memory_gb: u64,
}

/// A file or directory a task promises to leave in its work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDecl {
    pub name: String,
    pub path: String,
    pub optional: bool,
    pub dir: bool,
}

impl OutputDecl {
    /// Relative path with the sample placeholder expanded.
    pub fn resolve(&self, key: &SampleKey) -> String {
        self.path.replace(SAMPLE_PLACEHOLDER, key.label())
    }
}

pub type RunPredicate = Arc<dyn Fn(&RunConfig) -> bool + Send + Sync>;
pub type SamplePredicate = Arc<dyn Fn(&SampleRecord) -> bool + Send + Sync>;
pub type CommandBuilder = Arc<dyn Fn(&Invocation<'_>) -> Result<CommandSpec> + Send + Sync>;

/// Everything a command builder may look at when rendering one instance.
pub struct Invocation<'a> {
    pub ctx: &'a RunContext,
    pub key: &'a SampleKey,
    pub inputs: &'a [Payload],
    pub work_dir: &'a Path,
    pub resources: Resources,
}

impl<'a> Invocation<'a> {
    pub fn config(&self) -> &RunConfig {
        &self.ctx.config
    }

    pub fn sample(&self) -> Option<&SampleRecord> {
        self.inputs.iter().find_map(|payload| match payload {
            Payload::Item(datum) => datum.sample.as_deref(),
            Payload::Collected(_) => None,
        })
    }

    /// Id used in output file names: the sample id, or `all`.
    pub fn label(&self) -> &str {
        self.key.label()
    }

    /// First keyed input carrying a file with this name.
    pub fn find_file(&self, name: &str) -> Option<&Path> {
        self.inputs.iter().find_map(|payload| match payload {
            Payload::Item(datum) => datum.file(name),
            Payload::Collected(_) => None,
        })
    }

    pub fn file(&self, name: &str) -> Result<&Path> {
        self.find_file(name)
            .ok_or_else(|| anyhow!("input file '{}' not available for {}", name, self.key))
    }

    /// Collected set delivered on input position `index`.
    pub fn collected(&self, index: usize) -> Result<&[Arc<Datum>]> {
        match self.inputs.get(index) {
            Some(Payload::Collected(items)) => Ok(items.as_slice()),
            Some(Payload::Item(_)) => Err(anyhow!("input {} is keyed, expected a collected set", index)),
            None => Err(anyhow!("no input at position {}", index)),
        }
    }

    /// All collected items across every input, in input order.
    pub fn all_collected(&self) -> Vec<&Arc<Datum>> {
        self.inputs
            .iter()
            .filter_map(|payload| match payload {
                Payload::Collected(items) => Some(items.iter()),
                Payload::Item(_) => None,
            })
            .flatten()
            .collect()
    }

    pub fn cpus(&self) -> String {
        self.resources.cpus.to_string()
    }
}

/// One pipeline stage.
///
/// A node is defined once when the graph is built and never changes during
/// the run. `when` is evaluated once per run against the configuration;
/// `when_sample` is evaluated for every sample that reaches the node.
#[derive(Clone)]
pub struct TaskNode {
    pub(crate) name: String,
    pub(crate) tool: &'static str,
    pub(crate) inputs: Vec<Channel>,
    pub(crate) outputs: Vec<OutputDecl>,
    pub(crate) when: Option<RunPredicate>,
    pub(crate) when_sample: Option<SamplePredicate>,
    pub(crate) resource_class: ResourceClass,
    pub(crate) required: bool,
    pub(crate) command: CommandBuilder,
}

impl TaskNode {
    pub fn new(name: impl Into<String>, tool: &'static str) -> Self {
        TaskNode {
            name: name.into(),
            tool,
            inputs: Vec::new(),
            outputs: Vec::new(),
            when: None,
            when_sample: None,
            resource_class: ResourceClass::Small,
            required: false,
            command: Arc::new(move |_: &Invocation<'_>| -> Result<CommandSpec> {
                Err(anyhow!("no command defined for {}", tool))
            }),
        }
    }

    pub fn input(mut self, channel: Channel) -> Self {
        self.inputs.push(channel);
        self
    }

    pub fn output(mut self, name: &str, path: &str) -> Self {
        self.outputs.push(OutputDecl {
            name: name.to_string(),
            path: path.to_string(),
            optional: false,
            dir: false,
        });
        self
    }

    pub fn optional_output(mut self, name: &str, path: &str) -> Self {
        self.outputs.push(OutputDecl {
            name: name.to_string(),
            path: path.to_string(),
            optional: true,
            dir: false,
        });
        self
    }

    pub fn dir_output(mut self, name: &str, path: &str) -> Self {
        self.outputs.push(OutputDecl {
            name: name.to_string(),
            path: path.to_string(),
            optional: false,
            dir: true,
        });
        self
    }

    pub fn when(mut self, predicate: impl Fn(&RunConfig) -> bool + Send + Sync + 'static) -> Self {
        self.when = Some(Arc::new(predicate));
        self
    }

    pub fn when_sample(mut self, predicate: impl Fn(&SampleRecord) -> bool + Send + Sync + 'static) -> Self {
        self.when_sample = Some(Arc::new(predicate));
        self
    }

    pub fn resources(mut self, class: ResourceClass) -> Self {
        self.resource_class = class;
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn command(mut self, builder: impl Fn(&Invocation<'_>) -> Result<CommandSpec> + Send + Sync + 'static) -> Self {
        self.command = Arc::new(builder);
        self
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_enabled(&self, config: &RunConfig) -> bool {
        self.when.as_ref().map(|p| p(config)).unwrap_or(true)
    }

    pub fn accepts(&self, sample: &SampleRecord) -> bool {
        self.when_sample.as_ref().map(|p| p(sample)).unwrap_or(true)
    }
}

impl fmt::Debug for TaskNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskNode")
            .field("name", &self.name)
            .field("tool", &self.tool)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("resource_class", &self.resource_class)
            .field("required", &self.required)
            .finish()
    }
}
