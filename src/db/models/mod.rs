pub mod snapshot;
pub mod video_segment;

pub use snapshot::{Snapshot, SnapshotInfo, WindowBounds};
pub use video_segment::{bin_start, segment_path, VideoSegment};
