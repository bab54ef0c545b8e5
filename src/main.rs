use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use tokio_util::sync::CancellationToken;

use rekal_lib::{
    config::{default_data_dir, ConfigStore, RekalConfig, CONFIG_FILE_NAME},
    db::{bin_start, segment_path},
    ipc::DaemonClient,
    platform::{CommandBackend, Platform},
    processing::ProcessOutcome,
    run_daemon,
    utils::init_logging,
};

#[derive(Parser)]
#[command(name = "rekal", version, about = "Continuous screen recall")]
struct Cli {
    /// Data directory (database, videos, config)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to <data dir>/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Control socket path
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture and processing daemon in the foreground
    Daemon,
    /// Show daemon status and counters
    Status,
    /// Pause or resume recording
    Record { state: RecordState },
    /// Number of snapshots waiting to be processed
    Queued,
    /// Process buffered snapshots now, even on battery
    Process,
    /// Search snapshots: `[YYYY-MM-DD [to YYYY-MM-DD]] terms...`
    Search {
        /// Also require every term to appear in recognized text
        #[arg(long)]
        full_text: bool,
        terms: Vec<String>,
    },
    /// Write PNGs of snapshots (all buffered ones when no timestamps are given)
    Export {
        #[arg(long)]
        out: PathBuf,
        timestamps: Vec<i64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RecordState {
    On,
    Off,
}

fn load_config(cli: &Cli) -> ConfigStore {
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| data_dir.join(CONFIG_FILE_NAME));

    let store = ConfigStore::load(config_path);
    store.update(|config| {
        if let Some(dir) = &cli.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(socket) = &cli.socket {
            config.socket_path = socket.clone();
        }
    });
    store
}

fn format_timestamp(timestamp: i64) -> String {
    match Local.timestamp_opt(timestamp, 0).single() {
        Some(local) => local.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => timestamp.to_string(),
    }
}

async fn shutdown_signal(cancel_token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    info!("Shutdown requested");
    cancel_token.cancel();
}

async fn daemon(store: ConfigStore) -> Result<()> {
    if let Err(err) = store.persist_if_missing() {
        log::warn!("Could not write default config: {err:#}");
    }
    let config = store.config();

    let backend = Arc::new(CommandBackend::new(config.backend.clone()));
    let platform = Platform::from_backend(backend);

    let cancel_token = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel_token.clone()));

    run_daemon(config, platform, cancel_token).await
}

async fn export(
    client: &mut DaemonClient,
    config: &RekalConfig,
    out: &Path,
    timestamps: Vec<i64>,
) -> Result<()> {
    let timestamps = if timestamps.is_empty() {
        client
            .fetch_buffered_snapshots()
            .await?
            .iter()
            .map(|snapshot| snapshot.timestamp)
            .collect()
    } else {
        timestamps
    };
    let snapshots = client.fetch_snapshots(timestamps).await?;

    std::fs::create_dir_all(out)
        .with_context(|| format!("failed to create {}", out.display()))?;

    for snapshot in snapshots {
        let timestamp = snapshot.timestamp;
        let image = snapshot.into_snapshot()?.image;
        match image {
            Some(image) => {
                let path = out.join(format!("{timestamp}.png"));
                image
                    .save(&path)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                println!("{}", path.display());
            }
            None => {
                let video = segment_path(
                    &config.video_dir(),
                    bin_start(timestamp, config.bin_interval_secs),
                );
                println!("{timestamp}: stored in {}", video.display());
            }
        }
    }
    Ok(())
}

async fn connect(config: &RekalConfig) -> Result<DaemonClient> {
    Ok(DaemonClient::connect_to(&config.socket_path).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let store = load_config(&cli);
    let config = store.config();

    match cli.command {
        Commands::Daemon => daemon(store).await?,
        Commands::Status => {
            let status = connect(&config).await?.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Record { state } => {
            let recording = connect(&config)
                .await?
                .set_recording(matches!(state, RecordState::On))
                .await?;
            println!("recording: {}", if recording { "on" } else { "off" });
        }
        Commands::Queued => {
            println!("{}", connect(&config).await?.queued_count().await?);
        }
        Commands::Process => match connect(&config).await?.process_now().await? {
            ProcessOutcome::Completed(report) => {
                println!(
                    "processed {} snapshots, {} still queued",
                    report.processed, report.remaining
                );
                for segment in report.segments {
                    println!("  {} frames -> {}", segment.frames, segment.path.display());
                }
            }
            ProcessOutcome::Deferred { reason } => println!("deferred: {reason:?}"),
        },
        Commands::Search { full_text, terms } => {
            let timestamps = connect(&config)
                .await?
                .search(&terms.join(" "), full_text)
                .await?;
            for timestamp in timestamps {
                println!("{timestamp}\t{}", format_timestamp(timestamp));
            }
        }
        Commands::Export { out, timestamps } => {
            let mut client = connect(&config).await?;
            export(&mut client, &config, &out, timestamps).await?;
        }
    }

    Ok(())
}
