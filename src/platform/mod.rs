//! Narrow interfaces to the desktop: capture, window context, OCR, video
//! encoding and power state. The pipeline only talks to these traits; the
//! `command` backend implements them with standard command-line tools.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use image::RgbaImage;

use crate::db::WindowBounds;

pub mod command;

pub use command::CommandBackend;

/// One on-screen window as reported by the window system.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowInfo {
    pub window_id: i64,
    pub pid: u32,
    pub title: Option<String>,
    pub app_id: Option<String>,
    pub app_name: Option<String>,
    pub bounds: WindowBounds,
}

pub trait ScreenSource: Send + Sync {
    /// Time since the last event of each monitored input class.
    fn input_idle_ages(&self) -> Result<Vec<Duration>>;
    fn foreground_process_id(&self) -> Result<u32>;
    fn enumerate_windows(&self) -> Result<Vec<WindowInfo>>;
    fn capture_display(&self) -> Result<RgbaImage>;
}

pub trait BrowserSource: Send + Sync {
    /// URL of the active tab of the browser identified by `app_id`, if any.
    fn active_tab_url(&self, app_id: &str) -> Result<Option<String>>;
}

pub trait TextRecognizer: Send + Sync {
    fn recognize_text(&self, image: &RgbaImage) -> Result<String>;
}

pub trait VideoEncoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSink>>;
}

/// An open container accepting frames in order.
pub trait FrameSink: Send {
    /// `false` while the encoder cannot take another frame.
    fn is_ready(&self) -> bool;
    fn append_frame(&mut self, image: &RgbaImage, frame_index: u64) -> Result<()>;
    /// Flush and close the container; returns the number of frames written.
    fn finalize(self: Box<Self>) -> Result<u64>;
}

pub trait PowerSource: Send + Sync {
    fn is_on_external_power(&self) -> Result<bool>;
}

/// The full set of collaborators handed to the pipeline.
#[derive(Clone)]
pub struct Platform {
    pub screen: Arc<dyn ScreenSource>,
    pub browser: Arc<dyn BrowserSource>,
    pub ocr: Arc<dyn TextRecognizer>,
    pub encoder: Arc<dyn VideoEncoder>,
    pub power: Arc<dyn PowerSource>,
}

impl Platform {
    pub fn from_backend(backend: Arc<CommandBackend>) -> Self {
        Self {
            screen: backend.clone(),
            browser: backend.clone(),
            ocr: backend.clone(),
            encoder: backend.clone(),
            power: backend,
        }
    }
}
