use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Row};

use crate::db::{
    helpers::to_i64,
    models::{Snapshot, SnapshotInfo, WindowBounds},
    Database,
};

const SNAPSHOT_COLUMNS: &str = "timestamp, window_id, window_name, app_id, app_name, url,
    x, y, width, height, p_hash, ocr_text";

fn row_to_snapshot(row: &Row) -> Result<Snapshot, rusqlite::Error> {
    Ok(Snapshot {
        timestamp: row.get("timestamp")?,
        image: None,
        info: SnapshotInfo {
            window_id: row.get("window_id")?,
            bounds: WindowBounds {
                x: row.get("x")?,
                y: row.get("y")?,
                width: row.get("width")?,
                height: row.get("height")?,
            },
            window_name: row.get("window_name")?,
            app_id: row.get("app_id")?,
            app_name: row.get("app_name")?,
            url: row.get("url")?,
        },
        phash: row.get("p_hash")?,
        ocr_text: row.get("ocr_text")?,
    })
}

impl Database {
    /// Persist one snapshot row owned by the segment `video_bin_start` and bump
    /// that segment's frame count. Fails on a duplicate timestamp.
    pub async fn insert_snapshot(
        &self,
        snapshot: &Snapshot,
        video_bin_start: i64,
        frame_index: u64,
    ) -> Result<()> {
        let timestamp = snapshot.timestamp;
        let info = snapshot.info.clone();
        let phash = snapshot.phash.clone();
        let ocr_text = snapshot.ocr_text.clone();

        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO snapshots (
                    timestamp,
                    window_id,
                    window_name,
                    app_id,
                    app_name,
                    url,
                    x,
                    y,
                    width,
                    height,
                    p_hash,
                    ocr_text,
                    frame_index,
                    video_bin_start
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    timestamp,
                    info.window_id,
                    info.window_name,
                    info.app_id,
                    info.app_name,
                    info.url,
                    info.bounds.x,
                    info.bounds.y,
                    info.bounds.width,
                    info.bounds.height,
                    phash,
                    ocr_text,
                    to_i64(frame_index)?,
                    video_bin_start,
                ],
            )
            .with_context(|| format!("failed to insert snapshot {timestamp}"))?;

            tx.execute(
                "UPDATE videos SET frame_count = frame_count + 1 WHERE bin_start = ?1",
                params![video_bin_start],
            )
            .context("failed to update segment frame count")?;

            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Rows owned by one segment, in frame order.
    pub async fn fetch_snapshots_in_segment(&self, video_bin_start: i64) -> Result<Vec<Snapshot>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS}
                 FROM snapshots
                 WHERE video_bin_start = ?1
                 ORDER BY frame_index ASC"
            ))?;

            let snapshots = stmt
                .query_map(params![video_bin_start], row_to_snapshot)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(snapshots)
        })
        .await
    }

    /// Rows with `timestamp` in `[min_timestamp, max_timestamp)`, ascending.
    pub async fn fetch_snapshots_in_range(
        &self,
        min_timestamp: i64,
        max_timestamp: i64,
    ) -> Result<Vec<Snapshot>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS}
                 FROM snapshots
                 WHERE timestamp >= ?1 AND timestamp < ?2
                 ORDER BY timestamp ASC"
            ))?;

            let snapshots = stmt
                .query_map(params![min_timestamp, max_timestamp], row_to_snapshot)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(snapshots)
        })
        .await
    }

    pub async fn fetch_snapshots_by_timestamps(&self, timestamps: &[i64]) -> Result<Vec<Snapshot>> {
        if timestamps.is_empty() {
            return Ok(Vec::new());
        }

        let timestamps = timestamps.to_vec();
        self.execute(move |conn| {
            let placeholders = vec!["?"; timestamps.len()].join(", ");
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS}
                 FROM snapshots
                 WHERE timestamp IN ({placeholders})
                 ORDER BY timestamp ASC"
            ))?;

            let snapshots = stmt
                .query_map(params_from_iter(timestamps.iter()), row_to_snapshot)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(snapshots)
        })
        .await
    }

    pub async fn count_snapshots_in_range(
        &self,
        min_timestamp: i64,
        max_timestamp: i64,
    ) -> Result<u64> {
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM snapshots WHERE timestamp >= ?1 AND timestamp < ?2",
                params![min_timestamp, max_timestamp],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Every stored timestamp at or after `day_start`, ascending.
    pub async fn fetch_timestamps_since(&self, day_start: i64) -> Result<Vec<i64>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp FROM snapshots WHERE timestamp >= ?1 ORDER BY timestamp ASC",
            )?;

            let timestamps = stmt
                .query_map(params![day_start], |row| row.get::<_, i64>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(timestamps)
        })
        .await
    }
}
