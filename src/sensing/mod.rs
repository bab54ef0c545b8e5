mod controller;
mod loop_worker;
pub mod phash;

pub use controller::{CaptureController, RecordingSwitch};
pub use loop_worker::{capture_loop, url_is_excluded, CaptureSettings, CaptureWorker};
