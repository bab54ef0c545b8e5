use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Duration;

use crate::{
    buffer::SnapshotBuffer,
    config::RekalConfig,
    db::{bin_start, is_constraint_violation, Database, Snapshot, VideoSegment},
    metrics::MetricsCollector,
    platform::{FrameSink, Platform},
    search::QueryEngine,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const READY_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub bin_interval: i64,
    pub video_dir: PathBuf,
}

impl From<&RekalConfig> for ProcessorSettings {
    fn from(config: &RekalConfig) -> Self {
        Self {
            bin_interval: config.bin_interval_secs,
            video_dir: config.video_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentReport {
    pub bin_start: i64,
    pub path: PathBuf,
    pub frames: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    /// Snapshots persisted and removed from the buffer.
    pub processed: usize,
    pub segments: Vec<SegmentReport>,
    /// Snapshots still buffered after the run.
    pub remaining: usize,
    pub max_bin_timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferReason {
    OnBattery,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Completed(ProcessReport),
    Deferred { reason: DeferReason },
}

/// Container opened during the current run.
struct OpenSegment {
    segment: VideoSegment,
    sink: Box<dyn FrameSink>,
    next_frame: u64,
}

/// Drains the buffer into video segments and metadata rows. Runs are
/// serialized; a forced run waits for a periodic one in progress.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    settings: ProcessorSettings,
    db: Database,
    buffer: SnapshotBuffer,
    platform: Platform,
    metrics: MetricsCollector,
    queries: Arc<QueryEngine>,
    run_lock: Mutex<()>,
}

impl Processor {
    pub fn new(
        settings: ProcessorSettings,
        db: Database,
        buffer: SnapshotBuffer,
        platform: Platform,
        metrics: MetricsCollector,
        queries: Arc<QueryEngine>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                settings,
                db,
                buffer,
                platform,
                metrics,
                queries,
                run_lock: Mutex::new(()),
            }),
        }
    }

    /// One processing run as of `now`. Unless `force` is set the run is
    /// deferred while the host is on battery.
    pub async fn run(&self, force: bool, now: i64) -> Result<ProcessOutcome> {
        let _guard = self.inner.run_lock.lock().await;

        let result = self.run_locked(force, now).await;
        match &result {
            Ok(ProcessOutcome::Completed(report)) => {
                self.inner
                    .metrics
                    .record_run_completed(report.processed, report.segments.len())
                    .await;
                if report.processed > 0 {
                    self.inner.queries.invalidate().await;
                }
            }
            Ok(ProcessOutcome::Deferred { .. }) => self.inner.metrics.record_run_deferred().await,
            Err(_) => {
                self.inner.metrics.record_run_failed().await;
                // Rows written before the failure are searchable.
                self.inner.queries.invalidate().await;
            }
        }
        result
    }

    async fn run_locked(&self, force: bool, now: i64) -> Result<ProcessOutcome> {
        if !force && !self.on_external_power().await {
            log_info!("host is on battery; delaying processing");
            return Ok(ProcessOutcome::Deferred {
                reason: DeferReason::OnBattery,
            });
        }

        let max_bin_timestamp = bin_start(now, self.inner.settings.bin_interval);
        let snapshots = self.inner.buffer.begin_run(max_bin_timestamp).await;
        if snapshots.is_empty() {
            log_debug!("no snapshots to process");
            return Ok(ProcessOutcome::Deferred {
                reason: DeferReason::Empty,
            });
        }

        log_info!(
            "processing {} buffered snapshots (cutoff bin {max_bin_timestamp})",
            snapshots.len()
        );

        let mut open_segments = BTreeMap::new();
        let mut processed = 0;
        let result = self
            .process_snapshots(snapshots, max_bin_timestamp, &mut open_segments, &mut processed)
            .await;

        let (segments, finalize_error) = self.finalize_segments(open_segments).await;

        if let Err(err) = result {
            log_error!("processing aborted after {processed} snapshots: {err:#}");
            return Err(err);
        }
        if let Some(err) = finalize_error {
            return Err(err);
        }

        let remaining = self.inner.buffer.len().await;
        log_info!("processed {processed} snapshots, {remaining} still buffered");
        Ok(ProcessOutcome::Completed(ProcessReport {
            processed,
            segments,
            remaining,
            max_bin_timestamp,
        }))
    }

    async fn on_external_power(&self) -> bool {
        let power = self.inner.platform.power.clone();
        match tokio::task::spawn_blocking(move || power.is_on_external_power()).await {
            Ok(Ok(on_power)) => on_power,
            Ok(Err(err)) => {
                log_warn!("power state unavailable, assuming battery: {err:#}");
                false
            }
            Err(err) => {
                log_warn!("power state worker join failed: {err}");
                false
            }
        }
    }

    async fn process_snapshots(
        &self,
        snapshots: Vec<Snapshot>,
        max_bin_timestamp: i64,
        open_segments: &mut BTreeMap<i64, OpenSegment>,
        processed: &mut usize,
    ) -> Result<()> {
        let bin_interval = self.inner.settings.bin_interval;

        for mut snapshot in snapshots {
            let timestamp = snapshot.timestamp;
            let bin = snapshot.bin_start(bin_interval);
            if bin >= max_bin_timestamp {
                log_debug!("stopping at {timestamp}: bin {bin} may still grow");
                break;
            }

            let Some(image) = snapshot.image.clone() else {
                // Nothing can ever encode it; keep it from blocking later runs.
                self.inner.buffer.remove(timestamp).await;
                return Err(anyhow!("snapshot {timestamp} has no image; dropped"));
            };

            let mut open = match open_segments.remove(&bin) {
                Some(open) => open,
                None => self.open_segment(bin).await?,
            };

            while !open.sink.is_ready() {
                tokio::time::sleep(READY_POLL).await;
            }
            let frame_index = open.next_frame;
            let frame = Arc::clone(&image);
            let (mut open, appended) = tokio::task::spawn_blocking(move || {
                let appended = open.sink.append_frame(&frame, frame_index);
                (open, appended)
            })
            .await
            .context("encoder append worker join failed")?;
            if appended.is_ok() {
                open.next_frame += 1;
            }
            open_segments.insert(bin, open);
            appended
                .with_context(|| format!("failed to append snapshot {timestamp} to segment {bin}"))?;

            snapshot.ocr_text = self.recognize_text(timestamp, image).await;

            self.inner
                .db
                .insert_snapshot(&snapshot, bin, frame_index)
                .await
                .with_context(|| format!("failed to persist snapshot {timestamp}"))?;

            self.inner.buffer.remove(timestamp).await;
            *processed += 1;
        }

        Ok(())
    }

    /// Reserve the segment row, then open its container.
    async fn open_segment(&self, bin: i64) -> Result<OpenSegment> {
        let segment = VideoSegment::new(bin, &self.inner.settings.video_dir);
        if let Err(err) = self.inner.db.insert_video_segment(&segment).await {
            if is_constraint_violation(&err) {
                // The bin was written by an earlier run; its stragglers can
                // never be stored.
                let interval = self.inner.settings.bin_interval;
                let dropped = self.inner.buffer.discard_range(bin, bin + interval).await;
                log_error!("segment {bin} already exists; dropped {dropped} buffered snapshots");
            }
            return Err(err.context(format!("failed to reserve segment {bin}")));
        }

        let encoder = self.inner.platform.encoder.clone();
        let path = segment.path.clone();
        let sink = tokio::task::spawn_blocking(move || encoder.open(&path))
            .await
            .context("encoder open worker join failed")?
            .with_context(|| format!("failed to open container {}", segment.path.display()))?;

        log_debug!("opened segment {bin} at {}", segment.path.display());
        Ok(OpenSegment {
            segment,
            sink,
            next_frame: 0,
        })
    }

    async fn recognize_text(&self, timestamp: i64, image: Arc<image::RgbaImage>) -> Option<String> {
        let ocr = self.inner.platform.ocr.clone();
        match tokio::task::spawn_blocking(move || ocr.recognize_text(&image)).await {
            Ok(Ok(text)) => {
                let text = text.trim();
                (!text.is_empty()).then(|| text.to_string())
            }
            Ok(Err(err)) => {
                log_warn!("ocr failed for snapshot {timestamp}: {err:#}");
                None
            }
            Err(err) => {
                log_warn!("ocr worker join failed for snapshot {timestamp}: {err}");
                None
            }
        }
    }

    /// Close every container opened in this run, even after a failure.
    async fn finalize_segments(
        &self,
        open_segments: BTreeMap<i64, OpenSegment>,
    ) -> (Vec<SegmentReport>, Option<anyhow::Error>) {
        let mut reports = Vec::with_capacity(open_segments.len());
        let mut first_error = None;

        for (bin, open) in open_segments {
            let OpenSegment {
                segment,
                sink,
                next_frame,
            } = open;

            let finalized = tokio::task::spawn_blocking(move || sink.finalize())
                .await
                .context("encoder finalize worker join failed")
                .and_then(|result| result);

            let frames = match finalized {
                Ok(frames) => {
                    log_info!("wrote {frames} frames to {}", segment.path.display());
                    frames
                }
                Err(err) => {
                    let err = err.context(format!("failed to finalize segment {bin}"));
                    log_error!("{err:#}");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                    next_frame
                }
            };

            reports.push(SegmentReport {
                bin_start: bin,
                path: segment.path,
                frames,
            });
        }

        (reports, first_error)
    }
}
