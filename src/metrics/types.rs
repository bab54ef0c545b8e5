use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a single capture tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickOutcome {
    Captured,
    Paused,
    Idle,
    NoWindow,
    Excluded,
    Duplicate,
    /// Captured after a processing run closed its bin; dropped.
    Late,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureMetrics {
    pub timestamp: DateTime<Utc>,
    pub outcome: TickOutcome,
    pub context_ms: u64,
    pub capture_ms: u64,
    pub phash_ms: u64,
    pub total_ms: u64,
    pub similarity: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickCounts {
    pub captured: u64,
    pub paused: u64,
    pub idle: u64,
    pub no_window: u64,
    pub excluded: u64,
    pub duplicate: u64,
    pub late: u64,
    pub failed: u64,
}

impl TickCounts {
    pub fn record(&mut self, outcome: TickOutcome) {
        let counter = match outcome {
            TickOutcome::Captured => &mut self.captured,
            TickOutcome::Paused => &mut self.paused,
            TickOutcome::Idle => &mut self.idle,
            TickOutcome::NoWindow => &mut self.no_window,
            TickOutcome::Excluded => &mut self.excluded,
            TickOutcome::Duplicate => &mut self.duplicate,
            TickOutcome::Late => &mut self.late,
            TickOutcome::Failed => &mut self.failed,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u64 {
        self.captured
            + self.paused
            + self.idle
            + self.no_window
            + self.excluded
            + self.duplicate
            + self.late
            + self.failed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingCounts {
    pub runs_completed: u64,
    pub runs_deferred: u64,
    pub runs_failed: u64,
    pub snapshots_processed: u64,
    pub segments_written: u64,
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub ticks: TickCounts,
    pub processing: ProcessingCounts,
    pub recent_captures: Vec<CaptureMetrics>,
}
