pub mod channel;
pub mod executor;
pub mod graph;
pub mod node;
pub mod scheduler;

pub use channel::{AbsentCause, Channel, Datum, Payload, Resolution, SampleKey};
pub use executor::{CommandSpec, DryRunExecutor, Executor, Job, Outputs, ProcessExecutor, TaskExecutionError};
pub use graph::{DataflowGraph, GraphBuilder};
pub use node::{Invocation, ResourceClass, Resources, TaskNode};
pub use scheduler::{InstanceRecord, InstanceState, RunOutcome, Scheduler, SkipReason};
