//! Snapshot data model.
//!
//! A snapshot is one retained screen capture plus the window context it was
//! taken in. It lives in the in-memory buffer until the processor encodes its
//! image into a video segment and persists its metadata row.

use std::sync::Arc;

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use super::video_segment::bin_start;

/// Frame of the captured window, in display coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowBounds {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

/// Window context resolved for a capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    pub window_id: i64,
    pub bounds: WindowBounds,
    pub window_name: Option<String>,
    pub app_id: Option<String>,
    pub app_name: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Seconds since the Unix epoch; unique within the buffer and the store.
    pub timestamp: i64,
    /// Raw bitmap. `None` once the row comes back from the store.
    pub image: Option<Arc<RgbaImage>>,
    pub info: SnapshotInfo,
    /// 16 hex digits (64 bits).
    pub phash: String,
    pub ocr_text: Option<String>,
}

impl Snapshot {
    pub fn new(timestamp: i64, image: RgbaImage, info: SnapshotInfo, phash: String) -> Self {
        Self {
            timestamp,
            image: Some(Arc::new(image)),
            info,
            phash,
            ocr_text: None,
        }
    }

    pub fn bin_start(&self, bin_interval: i64) -> i64 {
        bin_start(self.timestamp, bin_interval)
    }
}
