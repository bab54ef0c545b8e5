//! Desktop backend that shells out to X11 and media tools.

use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use image::{imageops::FilterType, ImageFormat, RgbaImage};
use log::{debug, warn};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::config::BackendConfig;
use crate::db::WindowBounds;

use super::{
    BrowserSource, FrameSink, PowerSource, ScreenSource, TextRecognizer, VideoEncoder, WindowInfo,
};

pub struct CommandBackend {
    config: BackendConfig,
    system: Mutex<System>,
}

impl CommandBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            system: Mutex::new(System::new()),
        }
    }

    fn process_name(&self, pid: u32) -> Option<String> {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        system
            .process(pid)
            .map(|process| process.name().to_string_lossy().into_owned())
    }
}

fn run_command(argv: &[String], stdin: Option<Vec<u8>>) -> Result<Vec<u8>> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let feeder = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(mut pipe)) => Some(thread::spawn(move || pipe.write_all(&bytes))),
        _ => None,
    };

    let output = child
        .wait_with_output()
        .with_context(|| format!("failed to wait for {program}"))?;

    if let Some(feeder) = feeder {
        feeder
            .join()
            .map_err(|_| anyhow!("stdin writer for {program} panicked"))?
            .with_context(|| format!("failed to write stdin of {program}"))?;
    }

    if !output.status.success() {
        bail!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

fn run_text(argv: &[String]) -> Result<String> {
    let stdout = run_command(argv, None)?;
    Ok(String::from_utf8_lossy(&stdout).trim().to_string())
}

pub(crate) fn parse_pid(output: &str) -> Result<u32> {
    output
        .trim()
        .parse()
        .with_context(|| format!("invalid pid {:?}", output.trim()))
}

pub(crate) fn parse_idle_millis(output: &str) -> Result<Duration> {
    let millis: u64 = output
        .trim()
        .parse()
        .with_context(|| format!("invalid idle time {:?}", output.trim()))?;
    Ok(Duration::from_millis(millis))
}

/// Split off `count` whitespace-separated fields and return the remainder.
fn split_fields(line: &str, count: usize) -> Option<(Vec<&str>, &str)> {
    let mut rest = line.trim_start();
    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        if rest.is_empty() {
            return None;
        }
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        fields.push(&rest[..end]);
        rest = rest[end..].trim_start();
    }
    Some((fields, rest.trim_end()))
}

/// Parse `wmctrl -lpGx` output:
/// `<id> <desktop> <pid> <x> <y> <w> <h> <instance.Class> <host> <title...>`.
/// The app id is the lowercased class part of `WM_CLASS`.
pub(crate) fn parse_window_list(output: &str) -> Vec<WindowInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (fields, title) = split_fields(line, 9)?;
            let window_id = i64::from_str_radix(fields[0].trim_start_matches("0x"), 16).ok()?;
            let pid: u32 = fields[2].parse().ok()?;
            let number = |i: usize| fields[i].parse::<i64>().ok();

            let class = fields[7];
            let app_id = class
                .rsplit('.')
                .next()
                .filter(|part| !part.is_empty() && *part != "N/A")
                .map(str::to_lowercase);

            Some(WindowInfo {
                window_id,
                pid,
                title: (!title.is_empty()).then(|| title.to_string()),
                app_id,
                app_name: None,
                bounds: WindowBounds {
                    x: number(3)?,
                    y: number(4)?,
                    width: number(5)?,
                    height: number(6)?,
                },
            })
        })
        .collect()
}

/// External power when any non-battery supply is online, or when the machine
/// has no battery at all.
pub(crate) fn read_power_state(dir: &Path) -> Result<bool> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()))
        }
    };

    let mut has_battery = false;
    for entry in entries {
        let path = entry?.path();
        let kind = fs::read_to_string(path.join("type")).unwrap_or_default();
        if kind.trim() == "Battery" {
            has_battery = true;
            continue;
        }
        let online = fs::read_to_string(path.join("online")).unwrap_or_default();
        if online.trim() == "1" {
            return Ok(true);
        }
    }
    Ok(!has_battery)
}

impl ScreenSource for CommandBackend {
    fn input_idle_ages(&self) -> Result<Vec<Duration>> {
        let output = run_text(&self.config.idle_command)?;
        Ok(vec![parse_idle_millis(&output)?])
    }

    fn foreground_process_id(&self) -> Result<u32> {
        parse_pid(&run_text(&self.config.foreground_pid_command)?)
    }

    fn enumerate_windows(&self) -> Result<Vec<WindowInfo>> {
        let output = run_text(&self.config.window_list_command)?;
        let mut windows = parse_window_list(&output);
        for window in &mut windows {
            window.app_name = self.process_name(window.pid);
        }
        Ok(windows)
    }

    fn capture_display(&self) -> Result<RgbaImage> {
        let png = run_command(&self.config.capture_command, None)?;
        let image = image::load_from_memory(&png).context("failed to decode display capture")?;
        Ok(image.to_rgba8())
    }
}

impl BrowserSource for CommandBackend {
    fn active_tab_url(&self, app_id: &str) -> Result<Option<String>> {
        let Some(command) = &self.config.browser_url_command else {
            return Ok(None);
        };
        let mut argv = command.clone();
        argv.push(app_id.to_string());
        let url = run_text(&argv)?;
        Ok((!url.is_empty()).then_some(url))
    }
}

impl TextRecognizer for CommandBackend {
    fn recognize_text(&self, image: &RgbaImage) -> Result<String> {
        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, ImageFormat::Png)
            .context("failed to encode frame for OCR")?;
        let stdout = run_command(&self.config.ocr_command, Some(png.into_inner()))?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }
}

impl PowerSource for CommandBackend {
    fn is_on_external_power(&self) -> Result<bool> {
        read_power_state(&self.config.power_supply_dir)
    }
}

impl VideoEncoder for CommandBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSink>> {
        if path.exists() {
            bail!("refusing to overwrite existing segment {}", path.display());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        Ok(Box::new(FfmpegSink {
            path: path.to_path_buf(),
            ffmpeg_binary: self.config.ffmpeg_binary.clone(),
            output_args: self.config.ffmpeg_output_args.clone(),
            capacity: self.config.encoder_queue_capacity,
            pending: Arc::new(AtomicUsize::new(0)),
            stream: None,
            frames: 0,
        }))
    }
}

struct EncoderStream {
    child: Child,
    sender: SyncSender<Vec<u8>>,
    writer: JoinHandle<std::io::Result<()>>,
    width: u32,
    height: u32,
}

/// ffmpeg fed raw RGBA frames at one frame per second of timeline. The process
/// starts on the first frame, which fixes the segment's dimensions.
struct FfmpegSink {
    path: PathBuf,
    ffmpeg_binary: String,
    output_args: Vec<String>,
    capacity: usize,
    pending: Arc<AtomicUsize>,
    stream: Option<EncoderStream>,
    frames: u64,
}

impl FfmpegSink {
    fn start(&self, width: u32, height: u32) -> Result<EncoderStream> {
        let mut child = Command::new(&self.ffmpeg_binary)
            .args(["-hide_banner", "-loglevel", "error", "-n"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba"])
            .arg("-s")
            .arg(format!("{width}x{height}"))
            .args(["-framerate", "1", "-i", "-"])
            .args(&self.output_args)
            .arg(&self.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.ffmpeg_binary))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdin unavailable"))?;

        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(self.capacity);
        let pending = Arc::clone(&self.pending);
        let writer = thread::Builder::new()
            .name("rekal-encoder".into())
            .spawn(move || write_frames(stdin, receiver, pending))
            .context("failed to spawn encoder writer thread")?;

        debug!(
            "Started encoder for {} at {width}x{height}",
            self.path.display()
        );
        Ok(EncoderStream {
            child,
            sender,
            writer,
            width,
            height,
        })
    }
}

fn write_frames(
    mut stdin: ChildStdin,
    receiver: mpsc::Receiver<Vec<u8>>,
    pending: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    while let Ok(frame) = receiver.recv() {
        let result = stdin.write_all(&frame);
        pending.fetch_sub(1, Ordering::SeqCst);
        result?;
    }
    stdin.flush()
}

impl FrameSink for FfmpegSink {
    fn is_ready(&self) -> bool {
        self.pending.load(Ordering::SeqCst) < self.capacity
    }

    fn append_frame(&mut self, image: &RgbaImage, frame_index: u64) -> Result<()> {
        if frame_index != self.frames {
            bail!(
                "frame {frame_index} out of order for {}, expected {}",
                self.path.display(),
                self.frames
            );
        }

        if self.stream.is_none() {
            self.stream = Some(self.start(image.width(), image.height())?);
        }
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| anyhow!("encoder stream missing"))?;

        let bytes = if image.dimensions() == (stream.width, stream.height) {
            image.as_raw().clone()
        } else {
            warn!(
                "Resizing frame {frame_index} from {:?} to {}x{}",
                image.dimensions(),
                stream.width,
                stream.height
            );
            image::imageops::resize(image, stream.width, stream.height, FilterType::Triangle)
                .into_raw()
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if stream.sender.send(bytes).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            bail!("encoder for {} stopped accepting frames", self.path.display());
        }
        self.frames += 1;
        Ok(())
    }

    fn finalize(self: Box<Self>) -> Result<u64> {
        let FfmpegSink {
            path,
            stream,
            frames,
            ..
        } = *self;

        let Some(EncoderStream {
            mut child,
            sender,
            writer,
            ..
        }) = stream
        else {
            return Ok(0);
        };

        drop(sender);
        let write_result = writer
            .join()
            .map_err(|_| anyhow!("encoder writer thread panicked"))?;
        let status = child.wait().context("failed to wait for ffmpeg")?;

        write_result.with_context(|| format!("failed to stream frames to {}", path.display()))?;
        if !status.success() {
            bail!("ffmpeg exited with {status} for {}", path.display());
        }
        Ok(frames)
    }
}
