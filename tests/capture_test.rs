mod helpers;

use std::sync::atomic::Ordering;
use std::time::Duration;

use helpers::{window, Fakes};
use rekal_lib::buffer::SnapshotBuffer;
use rekal_lib::metrics::{MetricsCollector, TickOutcome};
use rekal_lib::sensing::{CaptureSettings, CaptureWorker, RecordingSwitch};

struct Harness {
    fakes: Fakes,
    buffer: SnapshotBuffer,
    metrics: MetricsCollector,
    switch: RecordingSwitch,
    worker: CaptureWorker,
}

fn harness() -> Harness {
    let fakes = Fakes::new();
    let buffer = SnapshotBuffer::new();
    let metrics = MetricsCollector::new();
    let switch = RecordingSwitch::new(true);
    let settings = CaptureSettings {
        interval: Duration::from_secs(1),
        similarity_threshold: 90.0,
        excluded_apps: vec!["org.secret.vault".into()],
        excluded_urls: vec!["bank.example.com".into()],
        browser_app_ids: vec!["firefox".into()],
    };
    let worker = CaptureWorker::new(
        settings,
        fakes.platform(),
        buffer.clone(),
        metrics.clone(),
        switch.subscribe(),
    );

    Harness {
        fakes,
        buffer,
        metrics,
        switch,
        worker,
    }
}

#[tokio::test]
async fn near_identical_frames_are_kept_once() {
    let mut h = harness();

    assert_eq!(h.worker.tick(100).await, TickOutcome::Captured);
    assert_eq!(h.worker.tick(101).await, TickOutcome::Duplicate);

    h.fakes.screen.show(2);
    assert_eq!(h.worker.tick(102).await, TickOutcome::Captured);

    let kept: Vec<i64> = h.buffer.snapshot().await.iter().map(|s| s.timestamp).collect();
    assert_eq!(kept, vec![100, 102]);

    let ticks = h.metrics.get_snapshot().await.ticks;
    assert_eq!(ticks.captured, 2);
    assert_eq!(ticks.duplicate, 1);
}

#[tokio::test]
async fn retained_snapshot_carries_window_context() {
    let mut h = harness();
    h.worker.tick(100).await;

    let snapshots = h.buffer.snapshot().await;
    let info = &snapshots[0].info;
    assert_eq!(info.window_name.as_deref(), Some("Editor"));
    assert_eq!(info.app_id.as_deref(), Some("org.example.editor"));
    assert_eq!(info.bounds.width, 800);
    assert_eq!(info.url, None);
    assert_eq!(snapshots[0].phash.len(), 16);
    assert!(snapshots[0].image.is_some());
}

#[tokio::test]
async fn paused_ticks_do_not_touch_the_screen() {
    let mut h = harness();
    h.switch.set(false);

    assert_eq!(h.worker.tick(100).await, TickOutcome::Paused);
    assert_eq!(h.fakes.screen.captures.load(Ordering::SeqCst), 0);

    h.switch.set(true);
    assert_eq!(h.worker.tick(101).await, TickOutcome::Captured);
}

#[tokio::test]
async fn idle_user_is_not_captured() {
    let mut h = harness();
    h.fakes.screen.set_idle(Duration::from_secs(5));

    assert_eq!(h.worker.tick(100).await, TickOutcome::Idle);
    assert!(h.buffer.is_empty().await);
}

#[tokio::test]
async fn foreground_process_without_window() {
    let mut h = harness();
    *h.fakes.screen.foreground_pid.lock().unwrap() = 1;

    assert_eq!(h.worker.tick(100).await, TickOutcome::NoWindow);
}

#[tokio::test]
async fn excluded_app_is_skipped() {
    let mut h = harness();
    h.fakes
        .screen
        .focus(window("Vault", "org.secret.vault", "Vault"));

    assert_eq!(h.worker.tick(100).await, TickOutcome::Excluded);
    assert_eq!(h.fakes.screen.captures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn browser_url_is_reused_while_title_is_unchanged() {
    let mut h = harness();
    h.fakes.screen.focus(window("Docs", "firefox", "Firefox"));
    h.fakes.browser.set_url("https://docs.example.com/intro");

    assert_eq!(h.worker.tick(100).await, TickOutcome::Captured);
    h.fakes.screen.show(2);
    assert_eq!(h.worker.tick(101).await, TickOutcome::Captured);
    assert_eq!(h.fakes.browser.calls.load(Ordering::SeqCst), 1);

    h.fakes.screen.focus(window("News", "firefox", "Firefox"));
    h.fakes.browser.set_url("https://news.example.com/");
    h.fakes.screen.show(3);
    assert_eq!(h.worker.tick(102).await, TickOutcome::Captured);
    assert_eq!(h.fakes.browser.calls.load(Ordering::SeqCst), 2);

    let urls: Vec<Option<String>> = h
        .buffer
        .snapshot()
        .await
        .into_iter()
        .map(|s| s.info.url)
        .collect();
    assert_eq!(
        urls,
        vec![
            Some("https://docs.example.com/intro".to_string()),
            Some("https://docs.example.com/intro".to_string()),
            Some("https://news.example.com/".to_string()),
        ]
    );
}

#[tokio::test]
async fn non_browser_apps_skip_the_url_lookup() {
    let mut h = harness();
    h.fakes.browser.set_url("https://docs.example.com/");

    h.worker.tick(100).await;
    assert_eq!(h.fakes.browser.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn excluded_url_subdomain_is_skipped() {
    let mut h = harness();
    h.fakes.screen.focus(window("Login", "firefox", "Firefox"));
    h.fakes.browser.set_url("https://login.bank.example.com/session");

    assert_eq!(h.worker.tick(100).await, TickOutcome::Excluded);
    assert!(h.buffer.is_empty().await);
}

#[tokio::test]
async fn capture_failure_ends_only_that_tick() {
    let mut h = harness();
    h.fakes.screen.fail_capture.store(true, Ordering::SeqCst);
    assert_eq!(h.worker.tick(100).await, TickOutcome::Failed);

    h.fakes.screen.fail_capture.store(false, Ordering::SeqCst);
    assert_eq!(h.worker.tick(101).await, TickOutcome::Captured);

    let ticks = h.metrics.get_snapshot().await.ticks;
    assert_eq!(ticks.failed, 1);
    assert_eq!(ticks.captured, 1);
}
