use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;

use crate::config::defs::{RunConfig, PIPELINE_NAME};

/// Run-level metadata handed to every component that needs it: the
/// scheduler, the execution backend, the report aggregator and the notifier.
///
/// The summary is captured once when the context is created and never
/// changes afterwards.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub config: Arc<RunConfig>,
    pub run_name: String,
    pub started_at: DateTime<Local>,
    pub summary: Arc<BTreeMap<String, String>>,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: Arc<RunConfig>) -> Self {
        let started_at = Local::now();
        let run_name = format!("{}_{}", PIPELINE_NAME, started_at.format("%Y%m%d_%H%M%S"));
        let mut summary = config.summary();
        summary.insert("run_name".to_string(), run_name.clone());
        summary.insert("pipeline_version".to_string(), env!("CARGO_PKG_VERSION").to_string());

        RunContext {
            config,
            run_name,
            started_at,
            summary: Arc::new(summary),
            cancel: CancellationToken::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
