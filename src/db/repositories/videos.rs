use std::path::PathBuf;

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use crate::db::{
    helpers::{conversion_error, to_i64, to_u64},
    models::VideoSegment,
    Database,
};

fn row_to_segment(row: &Row) -> Result<VideoSegment, rusqlite::Error> {
    let path: String = row.get("path")?;
    let frame_count: i64 = row.get("frame_count")?;

    Ok(VideoSegment {
        bin_start: row.get("bin_start")?,
        path: PathBuf::from(path),
        frame_count: to_u64(frame_count, "frame_count").map_err(conversion_error)?,
    })
}

impl Database {
    /// Reserve the row for a bin. Fails on a duplicate `bin_start` or `path`;
    /// an existing row is never overwritten.
    pub async fn insert_video_segment(&self, segment: &VideoSegment) -> Result<()> {
        let record = segment.clone();
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO videos (bin_start, path, frame_count) VALUES (?1, ?2, ?3)",
                params![
                    record.bin_start,
                    record.path.to_string_lossy(),
                    to_i64(record.frame_count)?,
                ],
            )
            .with_context(|| format!("failed to insert video segment {}", record.bin_start))?;
            Ok(())
        })
        .await
    }

    pub async fn get_video_segment(&self, bin_start: i64) -> Result<Option<VideoSegment>> {
        self.execute(move |conn| {
            conn.query_row(
                "SELECT bin_start, path, frame_count FROM videos WHERE bin_start = ?1",
                params![bin_start],
                row_to_segment,
            )
            .optional()
            .map_err(Into::into)
        })
        .await
    }

    /// Segments whose `bin_start` lies in `[min_timestamp, max_timestamp)`.
    pub async fn fetch_segments_in_range(
        &self,
        min_timestamp: i64,
        max_timestamp: i64,
    ) -> Result<Vec<VideoSegment>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT bin_start, path, frame_count
                 FROM videos
                 WHERE bin_start >= ?1 AND bin_start < ?2
                 ORDER BY bin_start ASC",
            )?;

            let segments = stmt
                .query_map(params![min_timestamp, max_timestamp], row_to_segment)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(segments)
        })
        .await
    }
}
