pub mod buffer;
pub mod config;
pub mod db;
pub mod ipc;
pub mod metrics;
pub mod platform;
pub mod processing;
pub mod search;
pub mod sensing;
pub mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use buffer::SnapshotBuffer;
use config::RekalConfig;
use db::Database;
use ipc::{IpcServer, RequestHandler};
use metrics::MetricsCollector;
use platform::Platform;
use processing::{processing_loop, Processor, ProcessorSettings};
use search::QueryEngine;
use sensing::{CaptureController, CaptureSettings, CaptureWorker, RecordingSwitch};

/// Run the daemon until `cancel_token` is cancelled.
///
/// Fails only during initialization: invalid config, unusable data directory,
/// database that cannot be opened or migrated, or a socket that cannot be
/// bound. Once running, per-tick and per-run failures are logged and retried.
pub async fn run_daemon(
    config: RekalConfig,
    platform: Platform,
    cancel_token: CancellationToken,
) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let video_dir = config.video_dir();
    std::fs::create_dir_all(&video_dir)
        .with_context(|| format!("failed to create video directory {}", video_dir.display()))?;

    let database = Database::new(config.database_path())?;
    let buffer = SnapshotBuffer::new();
    let metrics = MetricsCollector::new();
    let queries = Arc::new(QueryEngine::new(database.clone()));
    let recording = RecordingSwitch::new(true);

    let processor = Processor::new(
        ProcessorSettings::from(&config),
        database.clone(),
        buffer.clone(),
        platform.clone(),
        metrics.clone(),
        queries.clone(),
    );

    let handler = Arc::new(RequestHandler::new(
        database.clone(),
        buffer.clone(),
        queries,
        processor.clone(),
        recording.clone(),
        metrics.clone(),
        config.data_dir.clone(),
    ));
    let server = IpcServer::new(config.socket_path.clone(), handler);
    let listener = server.bind()?;

    let worker = CaptureWorker::new(
        CaptureSettings::from(&config),
        platform,
        buffer.clone(),
        metrics,
        recording.subscribe(),
    );
    let mut capture = CaptureController::new();
    capture.start(worker, &cancel_token)?;

    let processing = tokio::spawn(processing_loop(
        processor,
        Duration::from_secs(config.process_interval_secs),
        cancel_token.child_token(),
    ));

    info!(
        "rekal daemon running (data dir {}, bin interval {}s)",
        config.data_dir.display(),
        config.bin_interval_secs
    );

    server.serve(listener, cancel_token.clone()).await;

    capture.stop().await?;
    processing
        .await
        .context("processing loop task failed to join")?;

    let unprocessed = buffer.len().await;
    if unprocessed > 0 {
        warn!("Discarding {unprocessed} unprocessed snapshots on shutdown");
    }
    info!("rekal daemon stopped");
    Ok(())
}
