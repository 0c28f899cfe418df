pub mod context;
pub mod defs;

pub use context::RunContext;
pub use defs::{PipelineError, RunConfig};
