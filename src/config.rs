use anyhow::{bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

pub const CONFIG_FILE_NAME: &str = "config.json";
const DATABASE_FILE_NAME: &str = "rekal.sqlite3";
const VIDEO_DIR_NAME: &str = "videos";
const OWN_APP_ID: &str = "rekal";

/// Command lines for the desktop collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Writes a PNG of the whole display to stdout.
    pub capture_command: Vec<String>,
    /// Prints the pid owning the focused window.
    pub foreground_pid_command: Vec<String>,
    /// `wmctrl -lpGx` compatible window listing.
    pub window_list_command: Vec<String>,
    /// Prints milliseconds since the last input event.
    pub idle_command: Vec<String>,
    /// Prints the active tab URL; the browser app id is appended as last argument.
    pub browser_url_command: Option<Vec<String>>,
    /// Reads a PNG on stdin, prints recognized text.
    pub ocr_command: Vec<String>,
    pub ffmpeg_binary: String,
    /// Output options passed to ffmpeg before the container path.
    pub ffmpeg_output_args: Vec<String>,
    /// Frames queued for the encoder before it reports not ready.
    pub encoder_queue_capacity: usize,
    pub power_supply_dir: PathBuf,
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            capture_command: argv(&["import", "-window", "root", "png:-"]),
            foreground_pid_command: argv(&["xdotool", "getactivewindow", "getwindowpid"]),
            window_list_command: argv(&["wmctrl", "-lpGx"]),
            idle_command: argv(&["xprintidle"]),
            browser_url_command: None,
            ocr_command: argv(&["tesseract", "stdin", "stdout"]),
            ffmpeg_binary: "ffmpeg".into(),
            ffmpeg_output_args: argv(&[
                "-vf",
                "pad=ceil(iw/2)*2:ceil(ih/2)*2",
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-pix_fmt",
                "yuv420p",
            ]),
            encoder_queue_capacity: 4,
            power_supply_dir: PathBuf::from("/sys/class/power_supply"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RekalConfig {
    pub capture_interval_secs: u64,
    pub process_interval_secs: u64,
    pub bin_interval_secs: i64,
    /// Captures at least this similar (percent) to the previous one are dropped.
    pub similarity_threshold: f64,
    /// Exact application ids that are never captured.
    pub excluded_apps: Vec<String>,
    /// URLs or hosts that are never captured. A host entry also covers its subdomains.
    pub excluded_urls: Vec<String>,
    pub browser_app_ids: Vec<String>,
    pub data_dir: PathBuf,
    pub socket_path: PathBuf,
    pub backend: BackendConfig,
}

impl Default for RekalConfig {
    fn default() -> Self {
        Self {
            capture_interval_secs: 1,
            process_interval_secs: 60,
            bin_interval_secs: 300,
            similarity_threshold: 90.0,
            excluded_apps: vec![OWN_APP_ID.into()],
            excluded_urls: Vec::new(),
            browser_app_ids: argv(&[
                "firefox",
                "google-chrome",
                "chromium",
                "chromium-browser",
                "brave-browser",
                "microsoft-edge",
                "vivaldi-stable",
            ]),
            data_dir: default_data_dir(),
            socket_path: crate::ipc::default_socket_path(),
            backend: BackendConfig::default(),
        }
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("rekal")
}

impl RekalConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE_NAME)
    }

    pub fn video_dir(&self) -> PathBuf {
        self.data_dir.join(VIDEO_DIR_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture_interval_secs == 0 {
            bail!("capture_interval_secs must be positive");
        }
        if self.process_interval_secs == 0 {
            bail!("process_interval_secs must be positive");
        }
        if self.bin_interval_secs <= 0 {
            bail!("bin_interval_secs must be positive");
        }
        if !(0.0..=100.0).contains(&self.similarity_threshold) {
            bail!(
                "similarity_threshold must be within 0..=100, got {}",
                self.similarity_threshold
            );
        }
        if self.backend.encoder_queue_capacity == 0 {
            bail!("backend.encoder_queue_capacity must be positive");
        }
        Ok(())
    }
}

/// Config file backed by JSON. A missing file yields defaults; an unreadable
/// or malformed one is reported and replaced by defaults in memory.
pub struct ConfigStore {
    path: PathBuf,
    data: RwLock<RekalConfig>,
}

impl ConfigStore {
    pub fn load(path: PathBuf) -> Self {
        let data = if path.exists() {
            match read_config(&path) {
                Ok(config) => config,
                Err(err) => {
                    warn!("Ignoring config at {}: {err:#}", path.display());
                    RekalConfig::default()
                }
            }
        } else {
            RekalConfig::default()
        };

        Self {
            path,
            data: RwLock::new(data),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> RekalConfig {
        match self.data.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn update(&self, apply: impl FnOnce(&mut RekalConfig)) {
        let mut guard = match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
    }

    /// Write the current values so the file can be edited by hand.
    pub fn persist_if_missing(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let serialized = serde_json::to_string_pretty(&self.config())?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write config to {}", self.path.display()))
    }
}

fn read_config(path: &Path) -> Result<RekalConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    serde_json::from_str(&contents).context("Failed to parse config")
}
