//! IPC Protocol Types
//!
//! Request/response types exchanged between clients and the daemon over a
//! length-prefixed JSON framing. Every request gets exactly one response.

use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::db::{Snapshot, SnapshotInfo};
use crate::metrics::MetricsSnapshot;
use crate::processing::ProcessOutcome;
use crate::search::SearchQuery;

/// Snapshot as it crosses the socket. The image, when present, is a
/// base64-encoded PNG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedSnapshot {
    pub timestamp: i64,
    pub info: SnapshotInfo,
    pub phash: String,
    pub ocr_text: Option<String>,
    /// `true` while the snapshot is still waiting in the daemon's buffer.
    pub buffered: bool,
    pub image_png: Option<String>,
}

impl EncodedSnapshot {
    /// Metadata only, no image.
    pub fn metadata(snapshot: &Snapshot, buffered: bool) -> Self {
        Self {
            timestamp: snapshot.timestamp,
            info: snapshot.info.clone(),
            phash: snapshot.phash.clone(),
            ocr_text: snapshot.ocr_text.clone(),
            buffered,
            image_png: None,
        }
    }

    /// Metadata plus the PNG-encoded image when the snapshot still has one.
    /// CPU-heavy for display-sized frames.
    pub fn encode(snapshot: &Snapshot, buffered: bool) -> Result<Self> {
        let image_png = match &snapshot.image {
            Some(image) => Some(BASE64.encode(png_bytes(image)?)),
            None => None,
        };

        Ok(Self {
            timestamp: snapshot.timestamp,
            info: snapshot.info.clone(),
            phash: snapshot.phash.clone(),
            ocr_text: snapshot.ocr_text.clone(),
            buffered,
            image_png,
        })
    }

    /// Raw PNG bytes of the image, if one was sent.
    pub fn png(&self) -> Result<Option<Vec<u8>>> {
        self.image_png
            .as_deref()
            .map(|encoded| BASE64.decode(encoded).context("invalid base64 image payload"))
            .transpose()
    }

    pub fn into_snapshot(self) -> Result<Snapshot> {
        let image = match self.png()? {
            Some(bytes) => Some(Arc::new(
                image::load_from_memory_with_format(&bytes, ImageFormat::Png)
                    .context("invalid PNG payload")?
                    .to_rgba8(),
            )),
            None => None,
        };

        Ok(Snapshot {
            timestamp: self.timestamp,
            image,
            info: self.info,
            phash: self.phash,
            ocr_text: self.ocr_text,
        })
    }
}

fn png_bytes(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, ImageFormat::Png)
        .context("failed to encode snapshot as PNG")?;
    Ok(cursor.into_inner())
}

/// Request types sent from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Every snapshot still in the buffer, metadata only
    FetchBufferedSnapshots,

    /// Snapshots by timestamp, buffered or stored. Images count against a
    /// per-reply budget; timestamps that did not fit come back in `remaining`
    FetchSnapshots { timestamps: Vec<i64> },

    /// Timestamps matching an already parsed query
    FetchTimestamps { query: SearchQuery },

    /// Parse free text against the daemon's known applications
    ParseQuery { text: String, full_text: bool },

    /// Parse and match in one round trip
    Search { text: String, full_text: bool },

    SetRecording { recording: bool },

    GetRecordingStatus,

    GetQueuedCount,

    /// Forced processing run, ignoring the power gate
    ProcessNow,

    Status,

    Ping,
}

/// Current daemon status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub recording: bool,
    pub queued: usize,
    pub uptime_seconds: u64,
    pub data_dir: PathBuf,
    pub metrics: MetricsSnapshot,
}

/// Error codes for response errors
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    InternalError,
    InvalidRequest,
    StoreFailed,
    ProcessingFailed,
}

/// Response types sent from daemon to client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Snapshots {
        snapshots: Vec<EncodedSnapshot>,
        /// Requested timestamps left for a follow-up request
        #[serde(default)]
        remaining: Vec<i64>,
    },

    Timestamps { timestamps: Vec<i64> },

    Query { query: SearchQuery },

    /// Effective recording state after the request
    RecordingStatus { recording: bool },

    QueuedCount { count: usize },

    Processed { outcome: ProcessOutcome },

    Status(DaemonStatus),

    Pong,

    Error { code: ErrorCode, message: String },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::error(ErrorCode::InternalError, message)
    }
}

/// Wire format for messages (length-prefixed)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Encoded image bytes allowed in one snapshot reply.
pub const IMAGE_PAGE_BUDGET: usize = MAX_MESSAGE_SIZE / 4;

/// Encode a message to bytes with a u32 little-endian length prefix
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("Message too large: {} bytes", payload.len());
    }
    let len = (payload.len() as u32).to_le_bytes();
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a message from bytes (after the length prefix is read)
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(data)?)
}
