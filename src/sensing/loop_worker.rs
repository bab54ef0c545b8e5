use anyhow::{Context, Result};
use chrono::Utc;
use image::RgbaImage;
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    buffer::{BufferError, SnapshotBuffer},
    config::RekalConfig,
    db::{Snapshot, SnapshotInfo},
    metrics::{CaptureMetrics, MetricsCollector, TickOutcome},
    platform::{Platform, WindowInfo},
    utils::unix_now,
};

use super::phash::{compute_phash, similarity_percent};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Capture-loop knobs taken from the config.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interval: Duration,
    pub similarity_threshold: f64,
    pub excluded_apps: Vec<String>,
    pub excluded_urls: Vec<String>,
    pub browser_app_ids: Vec<String>,
}

impl From<&RekalConfig> for CaptureSettings {
    fn from(config: &RekalConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.capture_interval_secs),
            similarity_threshold: config.similarity_threshold,
            excluded_apps: config.excluded_apps.clone(),
            excluded_urls: config.excluded_urls.clone(),
            browser_app_ids: config.browser_app_ids.clone(),
        }
    }
}

/// Context of the last retained snapshot.
struct PreviousCapture {
    phash: String,
    window_name: Option<String>,
    url: Option<String>,
}

#[derive(Default)]
struct TickTimings {
    context_ms: u64,
    capture_ms: u64,
    phash_ms: u64,
    similarity: Option<f64>,
}

/// State carried from one capture tick to the next.
pub struct CaptureWorker {
    settings: CaptureSettings,
    platform: Platform,
    buffer: SnapshotBuffer,
    metrics: MetricsCollector,
    recording: watch::Receiver<bool>,
    previous: Option<PreviousCapture>,
}

impl CaptureWorker {
    pub fn new(
        settings: CaptureSettings,
        platform: Platform,
        buffer: SnapshotBuffer,
        metrics: MetricsCollector,
        recording: watch::Receiver<bool>,
    ) -> Self {
        Self {
            settings,
            platform,
            buffer,
            metrics,
            recording,
            previous: None,
        }
    }

    /// Run one tick stamped `timestamp`. Never fails: every error ends the
    /// tick with [`TickOutcome::Failed`] after being logged.
    pub async fn tick(&mut self, timestamp: i64) -> TickOutcome {
        let started = Instant::now();
        let mut timings = TickTimings::default();

        let outcome = match self.perform_capture(timestamp, &mut timings).await {
            Ok(outcome) => outcome,
            Err(err) => {
                log_error!("capture tick {timestamp} failed: {err:#}");
                TickOutcome::Failed
            }
        };

        self.metrics
            .record_tick(CaptureMetrics {
                timestamp: Utc::now(),
                outcome,
                context_ms: timings.context_ms,
                capture_ms: timings.capture_ms,
                phash_ms: timings.phash_ms,
                total_ms: started.elapsed().as_millis() as u64,
                similarity: timings.similarity,
            })
            .await;

        outcome
    }

    async fn perform_capture(
        &mut self,
        timestamp: i64,
        timings: &mut TickTimings,
    ) -> Result<TickOutcome> {
        if !*self.recording.borrow() {
            return Ok(TickOutcome::Paused);
        }

        let context_start = Instant::now();
        if self.is_idle().await {
            return Ok(TickOutcome::Idle);
        }

        let Some(window) = self.resolve_foreground_window().await? else {
            log_debug!("no window owned by the foreground process at {timestamp}");
            return Ok(TickOutcome::NoWindow);
        };

        if let Some(app_id) = window.app_id.as_deref() {
            if self.settings.excluded_apps.iter().any(|excluded| excluded == app_id) {
                log_debug!("skipping excluded app {app_id}");
                return Ok(TickOutcome::Excluded);
            }
        }

        let url = self.resolve_url(&window).await;
        if let Some(url) = url.as_deref() {
            if url_is_excluded(url, &self.settings.excluded_urls) {
                log_debug!("skipping excluded url");
                return Ok(TickOutcome::Excluded);
            }
        }
        timings.context_ms = context_start.elapsed().as_millis() as u64;

        let capture_start = Instant::now();
        let screen = self.platform.screen.clone();
        let image = tokio::task::spawn_blocking(move || screen.capture_display())
            .await
            .context("display capture worker join failed")?
            .context("display capture failed")?;
        timings.capture_ms = capture_start.elapsed().as_millis() as u64;

        let phash_start = Instant::now();
        let (image, phash) = tokio::task::spawn_blocking(move || {
            let phash = compute_phash(&image);
            (image, phash)
        })
        .await
        .context("phash worker join failed")?;
        let phash = phash?;
        timings.phash_ms = phash_start.elapsed().as_millis() as u64;

        if let Some(previous) = &self.previous {
            match similarity_percent(&previous.phash, &phash) {
                Some(similarity) => {
                    timings.similarity = Some(similarity);
                    if similarity >= self.settings.similarity_threshold {
                        log_debug!("dropping capture {timestamp}: {similarity:.1}% similar");
                        return Ok(TickOutcome::Duplicate);
                    }
                }
                None => {
                    log_warn!(
                        "similarity undefined between {} and {phash}; keeping capture",
                        previous.phash
                    );
                }
            }
        }

        self.retain(timestamp, image, &window, url, phash).await
    }

    async fn is_idle(&self) -> bool {
        let screen = self.platform.screen.clone();
        let ages = match tokio::task::spawn_blocking(move || screen.input_idle_ages()).await {
            Ok(Ok(ages)) => ages,
            Ok(Err(err)) => {
                log_warn!("input idle query failed, treating as active: {err:#}");
                return false;
            }
            Err(err) => {
                log_warn!("input idle worker join failed: {err}");
                return false;
            }
        };
        !ages.is_empty() && ages.iter().all(|age| *age >= self.settings.interval)
    }

    async fn resolve_foreground_window(&self) -> Result<Option<WindowInfo>> {
        let screen = self.platform.screen.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<WindowInfo>> {
            let pid = screen
                .foreground_process_id()
                .context("foreground process lookup failed")?;
            let windows = screen
                .enumerate_windows()
                .context("window enumeration failed")?;
            Ok(windows.into_iter().find(|window| window.pid == pid))
        })
        .await
        .context("window context worker join failed")?
    }

    /// Active tab URL for browsers. Reuses the previous snapshot's URL while the
    /// window title is unchanged.
    async fn resolve_url(&self, window: &WindowInfo) -> Option<String> {
        let app_id = window.app_id.as_deref()?;
        if !self.settings.browser_app_ids.iter().any(|id| id == app_id) {
            return None;
        }

        if let Some(previous) = &self.previous {
            if window.title.is_some() && previous.window_name == window.title {
                return previous.url.clone();
            }
        }

        let browser = self.platform.browser.clone();
        let app_id = app_id.to_string();
        match tokio::task::spawn_blocking(move || browser.active_tab_url(&app_id)).await {
            Ok(Ok(url)) => url,
            Ok(Err(err)) => {
                log_warn!("browser url lookup failed: {err:#}");
                None
            }
            Err(err) => {
                log_warn!("browser url worker join failed: {err}");
                None
            }
        }
    }

    async fn retain(
        &mut self,
        timestamp: i64,
        image: RgbaImage,
        window: &WindowInfo,
        url: Option<String>,
        phash: String,
    ) -> Result<TickOutcome> {
        let info = SnapshotInfo {
            window_id: window.window_id,
            bounds: window.bounds,
            window_name: window.title.clone(),
            app_id: window.app_id.clone(),
            app_name: window.app_name.clone(),
            url,
        };

        let previous = PreviousCapture {
            phash: phash.clone(),
            window_name: info.window_name.clone(),
            url: info.url.clone(),
        };

        match self
            .buffer
            .push(Snapshot::new(timestamp, image, info, phash))
            .await
        {
            Ok(()) => {}
            Err(err @ BufferError::BinClosed { .. }) => {
                log_warn!("dropping late capture: {err}");
                return Ok(TickOutcome::Late);
            }
            Err(err) => return Err(err.into()),
        }
        self.previous = Some(previous);

        log_debug!("buffered snapshot {timestamp}");
        Ok(TickOutcome::Captured)
    }
}

/// `url` is excluded when an entry equals it, equals its host, or is a parent
/// domain of its host.
pub fn url_is_excluded(url: &str, excluded: &[String]) -> bool {
    if excluded.is_empty() {
        return false;
    }
    let host = Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_lowercase));

    excluded.iter().any(|entry| {
        let entry = entry.trim();
        if entry.is_empty() {
            return false;
        }
        if entry == url {
            return true;
        }
        let Some(host) = host.as_deref() else {
            return false;
        };
        let entry = entry.to_lowercase();
        host == entry || host.ends_with(&format!(".{entry}"))
    })
}

pub async fn capture_loop(mut worker: CaptureWorker, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(worker.settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    log_info!(
        "capture loop started (interval {:?}, similarity threshold {:.1}%)",
        worker.settings.interval,
        worker.settings.similarity_threshold
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                worker.tick(unix_now()).await;
            }
            _ = cancel_token.cancelled() => {
                log_info!("capture loop shutting down");
                break;
            }
        }
    }
}
