use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{debug, error, info, warn};

use bacass_pipelines::cli::parse;
use bacass_pipelines::config::{RunConfig, RunContext};
use bacass_pipelines::pipelines::bacass;

#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n bacass\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let config = match RunConfig::from_args(&args, &dir) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            std::process::exit(e.exit_code());
        }
    };
    debug!(
        "Per-task caps: {} CPUs, {} GB memory",
        config.max_cpus, config.max_memory_gb
    );

    let ctx = Arc::new(RunContext::new(config));
    info!("Starting run {}", ctx.run_name);

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling running tasks");
            cancel.cancel();
        }
    });

    if let Err(e) = bacass::run(ctx).await {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(e.exit_code());
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}
