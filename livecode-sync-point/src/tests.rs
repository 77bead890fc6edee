use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing_subscriber::filter::LevelFilter;

use crate::{sync_point_entry, SyncPoint};

fn initialize_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .try_init();
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition never became true");
        thread::sleep(Duration::from_millis(1));
    }
}

// Simulates instrumented code: passes through the entry point, then does
// "work" that advances `progress`.
fn watched_loop(sync_point: &SyncPoint, progress: &AtomicUsize, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        sync_point.entry();
        progress.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn unarmed_server_does_not_block() {
    initialize_tracing();
    let sync_point = SyncPoint::new();
    let started = Instant::now();
    assert!(!sync_point.enter());
    sync_point.leave();
    {
        let paused = sync_point.pause();
        assert!(!paused.synchronized());
    }
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(!sync_point.is_used());
}

#[test]
fn entry_without_request_returns() {
    initialize_tracing();
    let sync_point = SyncPoint::new();
    for _ in 0..100 {
        sync_point.entry();
    }
    assert!(sync_point.is_used());
}

#[test]
fn watched_code_parks_between_enter_and_leave() {
    initialize_tracing();
    let sync_point = SyncPoint::new();
    let progress = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);

    crossbeam_utils::thread::scope(|scope| {
        scope.spawn(|_| watched_loop(&sync_point, &progress, &stop));
        wait_until(|| sync_point.is_used());

        for _ in 0..3 {
            assert!(sync_point.enter());
            let parked_at = progress.load(Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            assert_eq!(
                progress.load(Ordering::SeqCst),
                parked_at,
                "watched code ran inside the controlled section"
            );
            sync_point.leave();
            wait_until(|| progress.load(Ordering::SeqCst) > parked_at);
        }

        stop.store(true, Ordering::SeqCst);
    })
    .unwrap();
}

#[test]
fn pause_guard_releases_on_drop() {
    initialize_tracing();
    let sync_point = SyncPoint::new();
    let progress = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);

    crossbeam_utils::thread::scope(|scope| {
        scope.spawn(|_| watched_loop(&sync_point, &progress, &stop));
        wait_until(|| sync_point.is_used());

        let parked_at = {
            let paused = sync_point.pause();
            assert!(paused.synchronized());
            let parked_at = progress.load(Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            assert_eq!(progress.load(Ordering::SeqCst), parked_at);
            parked_at
        };
        wait_until(|| progress.load(Ordering::SeqCst) > parked_at);

        stop.store(true, Ordering::SeqCst);
    })
    .unwrap();
}

#[test]
fn leave_after_skipped_enter_releases_nothing() {
    initialize_tracing();
    let sync_point = SyncPoint::new();
    let progress = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);

    // Armed between an enter that found nothing to wait for and its leave.
    assert!(!sync_point.enter());
    sync_point.entry();
    sync_point.leave();

    crossbeam_utils::thread::scope(|scope| {
        scope.spawn(|_| watched_loop(&sync_point, &progress, &stop));

        assert!(sync_point.enter());
        let parked_at = progress.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            progress.load(Ordering::SeqCst),
            parked_at,
            "a stale leave let the watched code through"
        );
        sync_point.leave();
        wait_until(|| progress.load(Ordering::SeqCst) > parked_at);

        // A second leave without an enter is ignored as well.
        sync_point.leave();
        assert!(sync_point.enter());
        let parked_at = progress.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(progress.load(Ordering::SeqCst), parked_at);
        sync_point.leave();

        stop.store(true, Ordering::SeqCst);
    })
    .unwrap();
}

#[test]
fn global_entry_arms_global_sync_point() {
    initialize_tracing();
    sync_point_entry();
    assert!(SyncPoint::global().is_used());
    // No request is pending, so a second pass does not block.
    sync_point_entry();
}
