//! In-memory holding area for snapshots that have not been persisted yet.
//!
//! The capture loop pushes, the processor reads a consistent copy and removes
//! entries one by one after their rows are stored, and protocol handlers read.
//! All access goes through one async mutex.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::db::Snapshot;
use crate::search::SearchQuery;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("snapshot timestamp {timestamp} is not after the last buffered timestamp {last}")]
    OutOfOrder { timestamp: i64, last: i64 },

    /// A processing run already claimed every bin before `closed_before`.
    #[error("snapshot timestamp {timestamp} falls in a bin closed before {closed_before}")]
    BinClosed { timestamp: i64, closed_before: i64 },
}

#[derive(Default)]
struct BufferState {
    snapshots: BTreeMap<i64, Snapshot>,
    last_pushed: Option<i64>,
    closed_before: Option<i64>,
}

#[derive(Clone, Default)]
pub struct SnapshotBuffer {
    inner: Arc<Mutex<BufferState>>,
}

impl SnapshotBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a snapshot. Its timestamp must be greater than every timestamp
    /// pushed before, including ones already removed, and must not fall in a
    /// bin a processing run has already closed.
    pub async fn push(&self, snapshot: Snapshot) -> Result<(), BufferError> {
        let mut state = self.inner.lock().await;
        let timestamp = snapshot.timestamp;
        if let Some(last) = state.last_pushed {
            if timestamp <= last {
                return Err(BufferError::OutOfOrder { timestamp, last });
            }
        }
        if let Some(closed_before) = state.closed_before {
            if timestamp < closed_before {
                return Err(BufferError::BinClosed {
                    timestamp,
                    closed_before,
                });
            }
        }
        state.last_pushed = Some(timestamp);
        state.snapshots.insert(timestamp, snapshot);
        Ok(())
    }

    /// Start of a processing run with cutoff `closed_before`: returns the
    /// ordered contents and, when there is anything to process, refuses later
    /// pushes below the cutoff. Both happen under one lock so no snapshot can
    /// slip into a bin between the view and the close.
    pub async fn begin_run(&self, closed_before: i64) -> Vec<Snapshot> {
        let mut state = self.inner.lock().await;
        if !state.snapshots.is_empty() {
            let cutoff = state.closed_before.map_or(closed_before, |c| c.max(closed_before));
            state.closed_before = Some(cutoff);
        }
        state.snapshots.values().cloned().collect()
    }

    /// Drop every buffered snapshot in `[start, end)`. Returns how many went.
    pub async fn discard_range(&self, start: i64, end: i64) -> usize {
        let mut state = self.inner.lock().await;
        let doomed: Vec<i64> = state
            .snapshots
            .range(start..end.max(start))
            .map(|(timestamp, _)| *timestamp)
            .collect();
        for timestamp in &doomed {
            state.snapshots.remove(timestamp);
        }
        doomed.len()
    }

    /// Copy of the current contents in ascending timestamp order. Images are
    /// shared, not cloned.
    pub async fn snapshot(&self) -> Vec<Snapshot> {
        self.inner.lock().await.snapshots.values().cloned().collect()
    }

    pub async fn remove(&self, timestamp: i64) -> Option<Snapshot> {
        self.inner.lock().await.snapshots.remove(&timestamp)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.snapshots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.snapshots.is_empty()
    }

    /// Buffered snapshots for the requested timestamps, ascending. Unknown
    /// timestamps are skipped.
    pub async fn get_many(&self, timestamps: &[i64]) -> Vec<Snapshot> {
        let state = self.inner.lock().await;
        let mut found: Vec<Snapshot> = timestamps
            .iter()
            .filter_map(|ts| state.snapshots.get(ts).cloned())
            .collect();
        found.sort_by_key(|snapshot| snapshot.timestamp);
        found.dedup_by_key(|snapshot| snapshot.timestamp);
        found
    }

    pub async fn timestamps_matching(&self, query: &SearchQuery) -> Vec<i64> {
        let state = self.inner.lock().await;
        state
            .snapshots
            .range(query.min_timestamp..query.max_timestamp.max(query.min_timestamp))
            .filter(|(_, snapshot)| query.matches(snapshot))
            .map(|(timestamp, _)| *timestamp)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use image::RgbaImage;

    use super::*;
    use crate::db::SnapshotInfo;

    fn snap(timestamp: i64, title: &str) -> Snapshot {
        Snapshot::new(
            timestamp,
            RgbaImage::new(2, 2),
            SnapshotInfo {
                window_name: Some(title.into()),
                ..SnapshotInfo::default()
            },
            "0000000000000000".into(),
        )
    }

    #[tokio::test]
    async fn keeps_ascending_order() {
        let buffer = SnapshotBuffer::new();
        buffer.push(snap(10, "a")).await.unwrap();
        buffer.push(snap(20, "b")).await.unwrap();
        buffer.push(snap(30, "c")).await.unwrap();

        let view: Vec<i64> = buffer.snapshot().await.iter().map(|s| s.timestamp).collect();
        assert_eq!(view, vec![10, 20, 30]);
        assert_eq!(buffer.len().await, 3);
    }

    #[tokio::test]
    async fn rejects_non_increasing_timestamps() {
        let buffer = SnapshotBuffer::new();
        buffer.push(snap(10, "a")).await.unwrap();
        assert!(buffer.push(snap(10, "dup")).await.is_err());
        assert!(buffer.push(snap(5, "old")).await.is_err());

        buffer.remove(10).await;
        assert!(buffer.push(snap(10, "again")).await.is_err());
        assert!(buffer.is_empty().await);
    }

    #[tokio::test]
    async fn run_closes_bins_behind_the_cutoff() {
        let buffer = SnapshotBuffer::new();
        buffer.push(snap(10, "a")).await.unwrap();

        let view = buffer.begin_run(60).await;
        assert_eq!(view.len(), 1);
        assert_eq!(
            buffer.push(snap(59, "late")).await,
            Err(BufferError::BinClosed {
                timestamp: 59,
                closed_before: 60
            })
        );
        buffer.push(snap(60, "next bin")).await.unwrap();

        // A smaller cutoff never reopens a closed bin.
        buffer.begin_run(30).await;
        assert!(buffer.push(snap(61, "still open")).await.is_ok());
        assert!(matches!(
            buffer.push(snap(45, "old")).await,
            Err(BufferError::OutOfOrder { .. })
        ));
    }

    #[tokio::test]
    async fn empty_run_leaves_bins_open() {
        let buffer = SnapshotBuffer::new();
        assert!(buffer.begin_run(60).await.is_empty());
        buffer.push(snap(10, "a")).await.unwrap();
    }

    #[tokio::test]
    async fn discard_range_is_half_open() {
        let buffer = SnapshotBuffer::new();
        for ts in [0, 30, 60, 90] {
            buffer.push(snap(ts, "a")).await.unwrap();
        }
        assert_eq!(buffer.discard_range(0, 60).await, 2);
        let left: Vec<i64> = buffer.snapshot().await.iter().map(|s| s.timestamp).collect();
        assert_eq!(left, vec![60, 90]);
    }

    #[tokio::test]
    async fn consistent_view_survives_removal() {
        let buffer = SnapshotBuffer::new();
        buffer.push(snap(1, "a")).await.unwrap();
        buffer.push(snap(2, "b")).await.unwrap();

        let view = buffer.snapshot().await;
        assert!(buffer.remove(1).await.is_some());
        assert_eq!(view.len(), 2);
        assert_eq!(buffer.len().await, 1);
    }

    #[tokio::test]
    async fn get_many_skips_unknown() {
        let buffer = SnapshotBuffer::new();
        buffer.push(snap(1, "a")).await.unwrap();
        buffer.push(snap(2, "b")).await.unwrap();

        let found = buffer.get_many(&[2, 99, 1, 2]).await;
        let timestamps: Vec<i64> = found.iter().map(|s| s.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2]);
    }

    #[tokio::test]
    async fn matching_respects_range_and_terms() {
        let buffer = SnapshotBuffer::new();
        buffer.push(snap(5, "inbox")).await.unwrap();
        buffer.push(snap(15, "inbox")).await.unwrap();
        buffer.push(snap(25, "editor")).await.unwrap();

        let mut query = SearchQuery::for_day(10);
        query.free_text_terms = vec!["inbox".into()];
        assert_eq!(buffer.timestamps_matching(&query).await, vec![15]);
    }
}
