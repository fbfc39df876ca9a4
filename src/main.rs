//! dxfdiff - batch comparison of DXF drawing pairs
//!
//! Headless driver for the pipeline.
//!
//! ```text
//! dxfdiff <pairs.yaml> [output.zip]
//! ```
//!
//! # Execution Flow
//!
//! 1. Initialize logging -> logs/dxfdiff.<date>
//! 2. Create a multi-thread tokio runtime
//! 3. Load and validate configuration (`dxfdiff.yaml` + environment)
//! 4. Read the pair manifest (YAML list of `pair_name`, `file_a`, `file_b`)
//! 5. Run every pair; Ctrl-C requests cancellation
//! 6. Print one status line per pair and write the all-pairs archive when at
//!    least one pair completed
//!
//! The process exits non-zero when any pair failed.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use dxfdiff::config::load_pairs;
use dxfdiff::progress::LogProgress;
use dxfdiff::services::CommandComparator;
use dxfdiff::{
    APP_NAME, ArchiveBuilder, ArchiveSource, ConfigManager, PairState, PipelineOrchestrator,
    StageKind, VERSION,
};
use std::fs;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_ARCHIVE: &str = "dxfdiff_results.zip";

fn main() -> Result<ExitCode> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(manifest_path) = args.first().map(Utf8PathBuf::from) else {
        eprintln!("Usage: {} <pairs.yaml> [output.zip]", APP_NAME);
        return Ok(ExitCode::from(2));
    };
    let archive_path = args
        .get(1)
        .map(Utf8PathBuf::from)
        .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_ARCHIVE));

    let _log_guard = dxfdiff::logging::setup_logging_with_console(
        "logs",
        dxfdiff::logging::LOG_PREFIX,
        false,
        true,
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("dxfdiff-worker")
        .build()
        .context("Failed to build tokio runtime")?;

    let config = ConfigManager::default().load()?;
    let pairs = load_pairs(&manifest_path)?;

    let comparator = Arc::new(CommandComparator::new(
        config.script_path(StageKind::Comparison),
    ));
    let orchestrator =
        PipelineOrchestrator::new(config, comparator).with_progress_sink(Arc::new(LogProgress));
    let cancel = orchestrator.cancel_handle();

    let states = runtime.block_on(async {
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling remaining work");
                cancel.request_cancel();
            }
        });
        let result = orchestrator.run_all(pairs).await;
        ctrl_c.abort();
        result
    })?;

    for state in &states {
        println!("{}", state.status_line());
    }

    if states.iter().any(PairState::is_complete) {
        let bytes = ArchiveBuilder::new().build(ArchiveSource::Run(&states))?;
        fs::write(&archive_path, bytes)
            .with_context(|| format!("Failed to write archive: {}", archive_path))?;
        println!("Archive written to {}", archive_path);
    } else {
        tracing::warn!("No pair completed, no archive written");
    }

    runtime.shutdown_timeout(Duration::from_secs(5));

    let failed = states.iter().filter(|s| s.is_failed()).count();
    tracing::info!(
        "Shutdown complete: {} of {} pair(s) failed",
        failed,
        states.len()
    );

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
