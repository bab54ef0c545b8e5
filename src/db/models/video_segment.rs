use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One encoded container holding every frame of a single time bin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSegment {
    /// Multiple of the bin interval; primary key.
    pub bin_start: i64,
    pub path: PathBuf,
    pub frame_count: u64,
}

impl VideoSegment {
    pub fn new(bin_start: i64, video_dir: &Path) -> Self {
        Self {
            bin_start,
            path: segment_path(video_dir, bin_start),
            frame_count: 0,
        }
    }
}

/// Start of the bin that `timestamp` falls into (floor division).
pub fn bin_start(timestamp: i64, bin_interval: i64) -> i64 {
    timestamp.div_euclid(bin_interval) * bin_interval
}

/// Deterministic container location for a bin.
pub fn segment_path(video_dir: &Path, bin_start: i64) -> PathBuf {
    video_dir.join(format!("{bin_start}.mp4"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bins_floor_to_interval() {
        assert_eq!(bin_start(125, 60), 60);
        assert_eq!(bin_start(120, 60), 120);
        assert_eq!(bin_start(59, 60), 0);
        assert_eq!(bin_start(1_736_748_537, 300), 1_736_748_300);
    }

    #[test]
    fn segment_path_is_keyed_by_bin() {
        let path = segment_path(Path::new("/data/videos"), 300);
        assert_eq!(path, PathBuf::from("/data/videos/300.mp4"));
    }
}
