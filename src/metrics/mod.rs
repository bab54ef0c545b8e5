mod types;

pub use types::{
    CaptureMetrics, MetricsSnapshot, ProcessingCounts, SystemMetrics, TickCounts, TickOutcome,
};

use std::sync::Arc;

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

const MAX_RECENT_CAPTURES: usize = 20;

pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    recent_captures: Vec<CaptureMetrics>,
    ticks: TickCounts,
    processing: ProcessingCounts,
    system: System,
    pid: Pid,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Baseline refresh; CPU usage is a delta between refreshes.
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        Self {
            inner: Arc::new(Mutex::new(MetricsState {
                recent_captures: Vec::with_capacity(MAX_RECENT_CAPTURES),
                ticks: TickCounts::default(),
                processing: ProcessingCounts::default(),
                system,
                pid,
            })),
        }
    }

    pub async fn record_tick(&self, metrics: CaptureMetrics) {
        let mut state = self.inner.lock().await;
        state.ticks.record(metrics.outcome);

        // Idle and paused ticks carry no timings worth keeping.
        if matches!(metrics.outcome, TickOutcome::Idle | TickOutcome::Paused) {
            return;
        }

        state.recent_captures.push(metrics);
        if state.recent_captures.len() > MAX_RECENT_CAPTURES {
            state.recent_captures.remove(0);
        }
    }

    pub async fn record_run_completed(&self, snapshots_processed: usize, segments_written: usize) {
        let mut state = self.inner.lock().await;
        state.processing.runs_completed += 1;
        state.processing.snapshots_processed += snapshots_processed as u64;
        state.processing.segments_written += segments_written as u64;
        state.processing.last_run_at = Some(Utc::now());
    }

    pub async fn record_run_deferred(&self) {
        self.inner.lock().await.processing.runs_deferred += 1;
    }

    pub async fn record_run_failed(&self) {
        let mut state = self.inner.lock().await;
        state.processing.runs_failed += 1;
        state.processing.last_run_at = Some(Utc::now());
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let pid = state.pid;

        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system_metrics = if let Some(process) = state.system.process(pid) {
            SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            }
        } else {
            SystemMetrics::default()
        };

        MetricsSnapshot {
            system: system_metrics,
            ticks: state.ticks.clone(),
            processing: state.processing.clone(),
            recent_captures: state.recent_captures.clone(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
