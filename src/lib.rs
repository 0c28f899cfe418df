// src/lib.rs
pub mod cli;
pub mod config;
pub mod dataflow;
pub mod pipelines;
pub mod report;
pub mod utils;

pub use cli::Arguments;
pub use config::{PipelineError, RunConfig, RunContext};
