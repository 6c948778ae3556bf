//! motiongridd - motion grid pipeline daemon
//!
//! This daemon:
//! 1. Loads the pipeline configuration (file + environment)
//! 2. Captures frames from the configured video source
//! 3. Detects motion, samples it and aggregates composite grids
//! 4. Stores composites and notifies the analysis service
//! 5. Logs status until Ctrl-C or end of stream

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use motion_grid::{
    AnalysisTrigger, FsObjectStore, HttpObjectStore, HttpTrigger, LogTrigger, ObjectStore,
    Pipeline, PipelineConfig,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Video source (overrides config): stub://name, device id, file or URL.
    #[arg(long, env = "MOTION_GRID_SOURCE")]
    source: Option<String>,
    /// Local object store root, used when no store endpoint is configured.
    #[arg(long, default_value = "motion_grid_out")]
    out: PathBuf,
    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = PipelineConfig::load()?;
    if let Some(source) = args.source {
        config.source.uri = source;
    }
    if args.print_config {
        println!("{:#?}", config);
        return Ok(());
    }

    let store: Arc<dyn ObjectStore> = match &config.endpoints.store {
        Some(endpoint) => {
            log::info!("object store: {}", endpoint);
            Arc::new(HttpObjectStore::new(endpoint, config.endpoints.timeout)?)
        }
        None => {
            log::info!("object store: local directory {}", args.out.display());
            Arc::new(FsObjectStore::new(&args.out))
        }
    };
    let trigger: Arc<dyn AnalysisTrigger> = match &config.endpoints.trigger {
        Some(endpoint) => {
            log::info!("analysis trigger: {} ({})", endpoint, config.sink.function);
            Arc::new(HttpTrigger::new(endpoint, config.endpoints.timeout)?)
        }
        None => {
            log::warn!("no trigger endpoint configured; notifications are only logged");
            Arc::new(LogTrigger::with_history(0))
        }
    };

    log::info!(
        "motiongridd {} reading {} (grid {}x{}, sink workers {})",
        env!("CARGO_PKG_VERSION"),
        config.source.uri,
        config.grid.rows,
        config.grid.columns,
        config.sink.workers
    );

    let mut pipeline = Pipeline::build(config, store, trigger)?;
    let stop = pipeline.stop_handle();
    ctrlc::set_handler(move || stop.request_stop()).expect("error setting Ctrl-C handler");

    pipeline.start()?;
    while !pipeline.wait_timeout(STATUS_INTERVAL) {
        let status = pipeline.status();
        log::info!(
            "status state={:?} source_running={} last_frame={:?} captured={} composites={} delivered={} failed_workers={}",
            status.state,
            status.source_running,
            status.last_frame_index,
            status.frames_captured,
            status.composites_emitted,
            status.composites_delivered,
            status.failed_workers
        );
    }

    log::info!("shutting down");
    pipeline.stop();
    let status = pipeline.status();
    log::info!("final status: {}", serde_json::to_string(&status)?);
    Ok(())
}
