use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::loop_worker::{capture_loop, CaptureWorker};

/// Shared recording flag. The capture loop reads it at the top of every tick.
#[derive(Clone)]
pub struct RecordingSwitch {
    tx: Arc<watch::Sender<bool>>,
}

impl RecordingSwitch {
    pub fn new(recording: bool) -> Self {
        let (tx, _rx) = watch::channel(recording);
        Self { tx: Arc::new(tx) }
    }

    /// Set the flag and return the new effective state.
    pub fn set(&self, recording: bool) -> bool {
        let previous = self.tx.send_replace(recording);
        if previous != recording {
            info!("Recording {}", if recording { "resumed" } else { "paused" });
        }
        recording
    }

    pub fn is_recording(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

pub struct CaptureController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl CaptureController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the capture loop under a child of `parent`, so cancelling the
    /// daemon also stops capturing.
    pub fn start(&mut self, worker: CaptureWorker, parent: &CancellationToken) -> Result<()> {
        if self.handle.is_some() {
            bail!("capture loop already running");
        }

        let cancel_token = parent.child_token();
        let handle = tokio::spawn(capture_loop(worker, cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("capture loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_reports_new_state() {
        let switch = RecordingSwitch::new(true);
        let rx = switch.subscribe();
        assert!(!switch.set(false));
        assert!(!switch.is_recording());
        assert!(!*rx.borrow());
        assert!(switch.set(true));
        assert!(*rx.borrow());
    }
}
