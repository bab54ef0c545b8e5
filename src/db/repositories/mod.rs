pub mod apps;
pub mod snapshots;
pub mod videos;
