mod helpers;

use std::path::Path;

use helpers::snapshot_at;
use rekal_lib::db::{is_constraint_violation, Database, VideoSegment};

fn segment(bin_start: i64) -> VideoSegment {
    VideoSegment::new(bin_start, Path::new("/tmp/rekal-videos"))
}

#[tokio::test]
async fn segment_rows_are_never_overwritten() {
    let db = Database::in_memory().unwrap();
    db.insert_video_segment(&segment(0)).await.unwrap();

    let err = db.insert_video_segment(&segment(0)).await.unwrap_err();
    assert!(is_constraint_violation(&err));

    // Same path under another key collides on the path column.
    let mut clash = segment(300);
    clash.path = segment(0).path;
    let err = db.insert_video_segment(&clash).await.unwrap_err();
    assert!(is_constraint_violation(&err));
}

#[tokio::test]
async fn snapshot_insert_bumps_frame_count() {
    let db = Database::in_memory().unwrap();
    db.insert_video_segment(&segment(0)).await.unwrap();

    db.insert_snapshot(&snapshot_at(10, 1), 0, 0).await.unwrap();
    db.insert_snapshot(&snapshot_at(20, 2), 0, 1).await.unwrap();

    let stored = db.get_video_segment(0).await.unwrap().unwrap();
    assert_eq!(stored.frame_count, 2);

    let rows = db.fetch_snapshots_in_segment(0).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].info.window_name.as_deref(), Some("Window 2"));
    assert!(rows.iter().all(|row| row.image.is_none()));
}

#[tokio::test]
async fn duplicate_snapshot_is_rejected_without_side_effects() {
    let db = Database::in_memory().unwrap();
    db.insert_video_segment(&segment(0)).await.unwrap();
    db.insert_snapshot(&snapshot_at(10, 1), 0, 0).await.unwrap();

    let err = db.insert_snapshot(&snapshot_at(10, 2), 0, 1).await.unwrap_err();
    assert!(is_constraint_violation(&err));

    let stored = db.get_video_segment(0).await.unwrap().unwrap();
    assert_eq!(stored.frame_count, 1);
}

#[tokio::test]
async fn snapshot_requires_its_segment() {
    let db = Database::in_memory().unwrap();
    let err = db.insert_snapshot(&snapshot_at(10, 1), 0, 0).await.unwrap_err();
    assert!(is_constraint_violation(&err));
}

#[tokio::test]
async fn range_queries_are_half_open() {
    let db = Database::in_memory().unwrap();
    for bin in [0, 300, 600] {
        db.insert_video_segment(&segment(bin)).await.unwrap();
    }
    for (i, ts) in [10_i64, 299, 300, 650].iter().enumerate() {
        let bin = ts - ts % 300;
        db.insert_snapshot(&snapshot_at(*ts, i as u32), bin, 0)
            .await
            .unwrap();
    }

    let bins: Vec<i64> = db
        .fetch_segments_in_range(0, 600)
        .await
        .unwrap()
        .iter()
        .map(|s| s.bin_start)
        .collect();
    assert_eq!(bins, vec![0, 300]);

    let timestamps: Vec<i64> = db
        .fetch_snapshots_in_range(10, 300)
        .await
        .unwrap()
        .iter()
        .map(|s| s.timestamp)
        .collect();
    assert_eq!(timestamps, vec![10, 299]);

    assert_eq!(db.count_snapshots_in_range(0, 1000).await.unwrap(), 4);
    assert_eq!(db.fetch_timestamps_since(300).await.unwrap(), vec![300, 650]);
}

#[tokio::test]
async fn fetch_by_timestamps_skips_unknown() {
    let db = Database::in_memory().unwrap();
    db.insert_video_segment(&segment(0)).await.unwrap();
    db.insert_snapshot(&snapshot_at(10, 1), 0, 0).await.unwrap();
    db.insert_snapshot(&snapshot_at(20, 2), 0, 1).await.unwrap();

    let rows = db.fetch_snapshots_by_timestamps(&[20, 99, 10]).await.unwrap();
    let timestamps: Vec<i64> = rows.iter().map(|s| s.timestamp).collect();
    assert_eq!(timestamps, vec![10, 20]);

    assert!(db.fetch_snapshots_by_timestamps(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn known_apps_are_distinct_and_lowercased() {
    let db = Database::in_memory().unwrap();
    db.insert_video_segment(&segment(0)).await.unwrap();

    let mut first = snapshot_at(10, 1);
    first.info.app_id = Some("Org.Mozilla.Firefox".into());
    first.info.app_name = Some("Firefox".into());
    let mut second = snapshot_at(20, 2);
    second.info.app_id = Some("org.mozilla.firefox".into());
    second.info.app_name = Some("FIREFOX".into());

    db.insert_snapshot(&first, 0, 0).await.unwrap();
    db.insert_snapshot(&second, 0, 1).await.unwrap();

    let known = db.fetch_known_apps().await.unwrap();
    assert_eq!(known.app_ids.len(), 1);
    assert!(known.app_ids.contains("org.mozilla.firefox"));
    assert_eq!(known.app_names.len(), 1);
    assert!(known.classifies_as_app("fire"));
    assert!(!known.classifies_as_app("mozilla"));
}

#[tokio::test]
async fn file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("rekal.sqlite3");

    {
        let db = Database::new(path.clone()).unwrap();
        db.insert_video_segment(&segment(0)).await.unwrap();
        db.insert_snapshot(&snapshot_at(10, 1), 0, 0).await.unwrap();
    }

    let db = Database::new(path.clone()).unwrap();
    assert_eq!(db.path(), Some(path.as_path()));
    assert_eq!(db.fetch_timestamps_since(0).await.unwrap(), vec![10]);
}
