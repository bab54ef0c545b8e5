#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use anyhow::{bail, Result};
use image::{Rgba, RgbaImage};
use tempfile::TempDir;

use rekal_lib::buffer::SnapshotBuffer;
use rekal_lib::db::{Database, Snapshot, SnapshotInfo, WindowBounds};
use rekal_lib::metrics::MetricsCollector;
use rekal_lib::platform::{
    BrowserSource, FrameSink, Platform, PowerSource, ScreenSource, TextRecognizer, VideoEncoder,
    WindowInfo,
};
use rekal_lib::processing::{Processor, ProcessorSettings};
use rekal_lib::search::QueryEngine;
use rekal_lib::sensing::phash::compute_phash;
use rekal_lib::sensing::{CaptureSettings, CaptureWorker, RecordingSwitch};

pub const FOREGROUND_PID: u32 = 4242;

/// 32x32 image of 4px black/white blocks chosen by a seeded LCG. Different
/// seeds give perceptually unrelated images.
pub fn test_image(seed: u32) -> RgbaImage {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(12_345);
    let mut blocks = [false; 64];
    for block in blocks.iter_mut() {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        *block = (state >> 16) & 1 == 1;
    }

    RgbaImage::from_fn(32, 32, |x, y| {
        let on = blocks[((y / 4) * 8 + x / 4) as usize];
        let v = if on { 255 } else { 0 };
        Rgba([v, v, v, 255])
    })
}

/// `width`x`height` of per-pixel LCG noise; PNG cannot shrink it much.
pub fn noise_image(width: u32, height: u32, seed: u32) -> RgbaImage {
    let mut state = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
    RgbaImage::from_fn(width, height, |_, _| {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let [_, r, g, b] = state.to_le_bytes();
        Rgba([r, g, b, 255])
    })
}

pub fn window(title: &str, app_id: &str, app_name: &str) -> WindowInfo {
    WindowInfo {
        window_id: 7,
        pid: FOREGROUND_PID,
        title: Some(title.to_string()),
        app_id: Some(app_id.to_string()),
        app_name: Some(app_name.to_string()),
        bounds: WindowBounds {
            x: 0,
            y: 0,
            width: 800,
            height: 600,
        },
    }
}

/// Buffered snapshot with a real image and hash.
pub fn snapshot_at(timestamp: i64, seed: u32) -> Snapshot {
    let image = test_image(seed);
    let phash = compute_phash(&image).unwrap();
    Snapshot::new(
        timestamp,
        image,
        SnapshotInfo {
            window_id: 7,
            bounds: WindowBounds::default(),
            window_name: Some(format!("Window {seed}")),
            app_id: Some("org.example.editor".into()),
            app_name: Some("Editor".into()),
            url: None,
        },
        phash,
    )
}

/// Buffered snapshot carrying a full-display noise frame.
pub fn display_snapshot_at(timestamp: i64, seed: u32) -> Snapshot {
    Snapshot::new(
        timestamp,
        noise_image(1920, 1080, seed),
        SnapshotInfo::default(),
        "0000000000000000".into(),
    )
}

pub struct FakeScreen {
    pub idle_ages: Mutex<Vec<Duration>>,
    pub foreground_pid: Mutex<u32>,
    pub windows: Mutex<Vec<WindowInfo>>,
    pub frame: Mutex<RgbaImage>,
    pub fail_capture: AtomicBool,
    pub captures: AtomicUsize,
}

impl FakeScreen {
    pub fn new() -> Self {
        Self {
            idle_ages: Mutex::new(vec![Duration::ZERO]),
            foreground_pid: Mutex::new(FOREGROUND_PID),
            windows: Mutex::new(vec![window("Editor", "org.example.editor", "Editor")]),
            frame: Mutex::new(test_image(1)),
            fail_capture: AtomicBool::new(false),
            captures: AtomicUsize::new(0),
        }
    }

    pub fn show(&self, seed: u32) {
        *self.frame.lock().unwrap() = test_image(seed);
    }

    pub fn focus(&self, window: WindowInfo) {
        *self.windows.lock().unwrap() = vec![window];
    }

    pub fn set_idle(&self, age: Duration) {
        *self.idle_ages.lock().unwrap() = vec![age; 4];
    }
}

impl ScreenSource for FakeScreen {
    fn input_idle_ages(&self) -> Result<Vec<Duration>> {
        Ok(self.idle_ages.lock().unwrap().clone())
    }

    fn foreground_process_id(&self) -> Result<u32> {
        Ok(*self.foreground_pid.lock().unwrap())
    }

    fn enumerate_windows(&self) -> Result<Vec<WindowInfo>> {
        Ok(self.windows.lock().unwrap().clone())
    }

    fn capture_display(&self) -> Result<RgbaImage> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        if self.fail_capture.load(Ordering::SeqCst) {
            bail!("capture denied");
        }
        Ok(self.frame.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeBrowser {
    pub url: Mutex<Option<String>>,
    pub calls: AtomicUsize,
}

impl FakeBrowser {
    pub fn set_url(&self, url: &str) {
        *self.url.lock().unwrap() = Some(url.to_string());
    }
}

impl BrowserSource for FakeBrowser {
    fn active_tab_url(&self, _app_id: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.url.lock().unwrap().clone())
    }
}

pub struct FakeOcr {
    pub text: Mutex<String>,
    pub fail: AtomicBool,
}

impl FakeOcr {
    pub fn new(text: &str) -> Self {
        Self {
            text: Mutex::new(text.to_string()),
            fail: AtomicBool::new(false),
        }
    }
}

impl TextRecognizer for FakeOcr {
    fn recognize_text(&self, _image: &RgbaImage) -> Result<String> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("recognizer unavailable");
        }
        Ok(self.text.lock().unwrap().clone())
    }
}

/// Records frame indices per container path.
#[derive(Default)]
pub struct FakeEncoder {
    pub opened: Mutex<Vec<PathBuf>>,
    pub finalized: Arc<Mutex<BTreeMap<PathBuf, Vec<u64>>>>,
    /// Each sink reports "not ready" this many times before every frame.
    pub busy_polls: usize,
    pub ready_checks: Arc<AtomicUsize>,
    pub append_threads: Arc<Mutex<Vec<ThreadId>>>,
}

impl FakeEncoder {
    pub fn with_busy_polls(busy_polls: usize) -> Self {
        Self {
            busy_polls,
            ..Self::default()
        }
    }

    pub fn frames_for(&self, path: &Path) -> Option<Vec<u64>> {
        self.finalized.lock().unwrap().get(path).cloned()
    }
}

impl VideoEncoder for FakeEncoder {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSink>> {
        self.opened.lock().unwrap().push(path.to_path_buf());
        Ok(Box::new(FakeSink {
            path: path.to_path_buf(),
            frames: Vec::new(),
            busy_polls: self.busy_polls,
            remaining_busy: AtomicUsize::new(self.busy_polls),
            ready_checks: Arc::clone(&self.ready_checks),
            append_threads: Arc::clone(&self.append_threads),
            finalized: Arc::clone(&self.finalized),
        }))
    }
}

struct FakeSink {
    path: PathBuf,
    frames: Vec<u64>,
    busy_polls: usize,
    remaining_busy: AtomicUsize,
    ready_checks: Arc<AtomicUsize>,
    append_threads: Arc<Mutex<Vec<ThreadId>>>,
    finalized: Arc<Mutex<BTreeMap<PathBuf, Vec<u64>>>>,
}

impl FrameSink for FakeSink {
    fn is_ready(&self) -> bool {
        self.ready_checks.fetch_add(1, Ordering::SeqCst);
        let remaining = self.remaining_busy.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_busy.store(remaining - 1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn append_frame(&mut self, _image: &RgbaImage, frame_index: u64) -> Result<()> {
        self.frames.push(frame_index);
        self.append_threads
            .lock()
            .unwrap()
            .push(std::thread::current().id());
        self.remaining_busy.store(self.busy_polls, Ordering::SeqCst);
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<u64> {
        let count = self.frames.len() as u64;
        self.finalized
            .lock()
            .unwrap()
            .insert(self.path.clone(), self.frames);
        Ok(count)
    }
}

pub struct FakePower {
    pub on_power: AtomicBool,
}

impl PowerSource for FakePower {
    fn is_on_external_power(&self) -> Result<bool> {
        Ok(self.on_power.load(Ordering::SeqCst))
    }
}

/// Every collaborator faked, plus handles to inspect them.
pub struct Fakes {
    pub screen: Arc<FakeScreen>,
    pub browser: Arc<FakeBrowser>,
    pub ocr: Arc<FakeOcr>,
    pub encoder: Arc<FakeEncoder>,
    pub power: Arc<FakePower>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::with_encoder(FakeEncoder::default())
    }

    pub fn with_encoder(encoder: FakeEncoder) -> Self {
        Self {
            screen: Arc::new(FakeScreen::new()),
            browser: Arc::new(FakeBrowser::default()),
            ocr: Arc::new(FakeOcr::new("quarterly report draft")),
            encoder: Arc::new(encoder),
            power: Arc::new(FakePower {
                on_power: AtomicBool::new(true),
            }),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            screen: self.screen.clone(),
            browser: self.browser.clone(),
            ocr: self.ocr.clone(),
            encoder: self.encoder.clone(),
            power: self.power.clone(),
        }
    }
}

/// In-memory store, buffer and processor wired to fakes.
pub struct Pipeline {
    pub db: Database,
    pub buffer: SnapshotBuffer,
    pub metrics: MetricsCollector,
    pub queries: Arc<QueryEngine>,
    pub processor: Processor,
    pub fakes: Fakes,
    pub video_dir: PathBuf,
    pub bin_interval: i64,
    _dir: TempDir,
}

impl Pipeline {
    pub fn new(bin_interval: i64) -> Self {
        Self::with_fakes(bin_interval, Fakes::new())
    }

    pub fn with_fakes(bin_interval: i64, fakes: Fakes) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let video_dir = dir.path().join("videos");
        let db = Database::in_memory().unwrap();
        let buffer = SnapshotBuffer::new();
        let metrics = MetricsCollector::new();
        let queries = Arc::new(QueryEngine::new(db.clone()));
        let processor = Processor::new(
            ProcessorSettings {
                bin_interval,
                video_dir: video_dir.clone(),
            },
            db.clone(),
            buffer.clone(),
            fakes.platform(),
            metrics.clone(),
            queries.clone(),
        );

        Self {
            db,
            buffer,
            metrics,
            queries,
            processor,
            fakes,
            video_dir,
            bin_interval,
            _dir: dir,
        }
    }

    /// A second processor over the same store and fakes, draining `buffer`.
    pub fn processor_for(&self, buffer: &SnapshotBuffer) -> Processor {
        Processor::new(
            ProcessorSettings {
                bin_interval: self.bin_interval,
                video_dir: self.video_dir.clone(),
            },
            self.db.clone(),
            buffer.clone(),
            self.fakes.platform(),
            self.metrics.clone(),
            self.queries.clone(),
        )
    }

    /// Capture worker feeding this pipeline's buffer from the fake screen.
    pub fn capture_worker(&self, recording: &RecordingSwitch) -> CaptureWorker {
        CaptureWorker::new(
            CaptureSettings {
                interval: Duration::from_secs(1),
                similarity_threshold: 90.0,
                excluded_apps: Vec::new(),
                excluded_urls: Vec::new(),
                browser_app_ids: Vec::new(),
            },
            self.fakes.platform(),
            self.buffer.clone(),
            self.metrics.clone(),
            recording.subscribe(),
        )
    }
}
