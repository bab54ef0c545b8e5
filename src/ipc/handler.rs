//! Request Handler
//!
//! Dispatches incoming requests to the buffer, store, query engine and
//! processor, and turns every failure into an explicit error response.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, error};

use crate::buffer::SnapshotBuffer;
use crate::db::{Database, Snapshot};
use crate::metrics::MetricsCollector;
use crate::processing::Processor;
use crate::search::{QueryEngine, SearchQuery};
use crate::sensing::RecordingSwitch;
use crate::utils::unix_now;

use super::protocol::*;

pub struct RequestHandler {
    db: Database,
    buffer: SnapshotBuffer,
    queries: Arc<QueryEngine>,
    processor: Processor,
    recording: RecordingSwitch,
    metrics: MetricsCollector,
    data_dir: PathBuf,
    image_budget: usize,
    start_time: Instant,
}

impl RequestHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        buffer: SnapshotBuffer,
        queries: Arc<QueryEngine>,
        processor: Processor,
        recording: RecordingSwitch,
        metrics: MetricsCollector,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            buffer,
            queries,
            processor,
            recording,
            metrics,
            data_dir,
            image_budget: IMAGE_PAGE_BUDGET,
            start_time: Instant::now(),
        }
    }

    /// Override the encoded image bytes allowed per snapshot reply.
    pub fn with_image_budget(mut self, bytes: usize) -> Self {
        self.image_budget = bytes;
        self
    }

    /// Handle an incoming request and return its response
    pub async fn handle(&self, request: Request) -> Response {
        debug!("Handling request: {:?}", std::mem::discriminant(&request));

        match request {
            Request::FetchBufferedSnapshots => Response::Snapshots {
                snapshots: self
                    .buffer
                    .snapshot()
                    .await
                    .iter()
                    .map(|snapshot| EncodedSnapshot::metadata(snapshot, true))
                    .collect(),
                remaining: Vec::new(),
            },

            Request::FetchSnapshots { timestamps } => match self.fetch_snapshots(&timestamps).await {
                Ok((snapshots, remaining)) => Response::Snapshots {
                    snapshots,
                    remaining,
                },
                Err(e) => store_error("fetch snapshots", e),
            },

            Request::FetchTimestamps { query } => match self.matching_timestamps(&query).await {
                Ok(timestamps) => Response::Timestamps { timestamps },
                Err(e) => store_error("fetch timestamps", e),
            },

            Request::ParseQuery { text, full_text } => {
                match self.queries.parse(&text, full_text).await {
                    Ok(query) => Response::Query { query },
                    Err(e) => store_error("parse query", e),
                }
            }

            Request::Search { text, full_text } => match self.search(&text, full_text).await {
                Ok(timestamps) => Response::Timestamps { timestamps },
                Err(e) => store_error("search", e),
            },

            Request::SetRecording { recording } => Response::RecordingStatus {
                recording: self.recording.set(recording),
            },

            Request::GetRecordingStatus => Response::RecordingStatus {
                recording: self.recording.is_recording(),
            },

            Request::GetQueuedCount => Response::QueuedCount {
                count: self.buffer.len().await,
            },

            Request::ProcessNow => match self.processor.run(true, unix_now()).await {
                Ok(outcome) => Response::Processed { outcome },
                Err(e) => {
                    error!("Forced processing failed: {e:#}");
                    Response::error(ErrorCode::ProcessingFailed, format!("{e:#}"))
                }
            },

            Request::Status => Response::Status(DaemonStatus {
                recording: self.recording.is_recording(),
                queued: self.buffer.len().await,
                uptime_seconds: self.start_time.elapsed().as_secs(),
                data_dir: self.data_dir.clone(),
                metrics: self.metrics.get_snapshot().await,
            }),

            Request::Ping => Response::Pong,
        }
    }

    /// Buffered snapshots carry their image; stored ones carry metadata only.
    /// Returns one page plus the timestamps that did not fit in it.
    async fn fetch_snapshots(&self, timestamps: &[i64]) -> Result<(Vec<EncodedSnapshot>, Vec<i64>)> {
        let buffered = self.buffer.get_many(timestamps).await;
        let found: BTreeSet<i64> = buffered.iter().map(|s| s.timestamp).collect();
        let missing: Vec<i64> = timestamps
            .iter()
            .copied()
            .filter(|ts| !found.contains(ts))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let stored = self.db.fetch_snapshots_by_timestamps(&missing).await?;

        let budget = self.image_budget;
        tokio::task::spawn_blocking(move || encode_page(buffered, stored, budget))
            .await
            .context("snapshot encoding worker join failed")?
    }

    async fn search(&self, text: &str, full_text: bool) -> Result<Vec<i64>> {
        let query = self.queries.parse(text, full_text).await?;
        self.matching_timestamps(&query).await
    }

    /// Union of buffered and stored matches, ascending and deduplicated.
    /// The buffer is read first: a snapshot leaves it only after its row is
    /// stored, so a concurrent run cannot hide it from both reads.
    async fn matching_timestamps(&self, query: &SearchQuery) -> Result<Vec<i64>> {
        let mut timestamps: BTreeSet<i64> =
            self.buffer.timestamps_matching(query).await.into_iter().collect();
        timestamps.extend(self.queries.matching_stored_timestamps(query).await?);
        Ok(timestamps.into_iter().collect())
    }
}

/// Encode in timestamp order until the image bytes would pass `budget`. The
/// first snapshot always goes in so every page makes progress.
fn encode_page(
    buffered: Vec<Snapshot>,
    stored: Vec<Snapshot>,
    budget: usize,
) -> Result<(Vec<EncodedSnapshot>, Vec<i64>)> {
    let mut pending: Vec<(Snapshot, bool)> = buffered
        .into_iter()
        .map(|snapshot| (snapshot, true))
        .chain(stored.into_iter().map(|snapshot| (snapshot, false)))
        .collect();
    pending.sort_by_key(|(snapshot, _)| snapshot.timestamp);

    let mut page = Vec::new();
    let mut remaining = Vec::new();
    let mut used = 0usize;
    for (snapshot, buffered) in pending {
        if !remaining.is_empty() {
            remaining.push(snapshot.timestamp);
            continue;
        }
        let encoded = EncodedSnapshot::encode(&snapshot, buffered)?;
        let size = encoded.image_png.as_ref().map_or(0, String::len);
        if !page.is_empty() && used + size > budget {
            remaining.push(snapshot.timestamp);
            continue;
        }
        used += size;
        page.push(encoded);
    }
    Ok((page, remaining))
}

fn store_error(operation: &str, e: anyhow::Error) -> Response {
    error!("Failed to {operation}: {e:#}");
    Response::error(ErrorCode::StoreFailed, format!("{e:#}"))
}
