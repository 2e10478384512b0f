#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use camera_http_server::{FeedEvent, FeedRegistry, ProcessSpec, ShutdownToken};
use common::{fake_jpeg, launches, looping_decoder, one_shot_decoder, wait_until, write_file};

const TIMEOUT: Duration = Duration::from_secs(10);

#[test]
fn two_subscribers_share_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let frames = write_file(dir.path(), "frames.bin", &fake_jpeg(1, 100));
    let log = dir.path().join("launches.log");
    let spec = looping_decoder(&log, &[frames]);
    let registry = FeedRegistry::new(ShutdownToken::new());

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let a = first.clone();
    let b = second.clone();
    let sub_a = registry
        .subscribe(&spec, move |event| {
            if let FeedEvent::Frame(frame) = event {
                assert_eq!(frame.len(), 104);
                a.fetch_add(1, Ordering::SeqCst);
            }
            true
        })
        .unwrap();
    let sub_b = registry
        .subscribe(&spec, move |event| {
            if let FeedEvent::Frame(_) = event {
                b.fetch_add(1, Ordering::SeqCst);
            }
            true
        })
        .unwrap();

    assert!(wait_until(TIMEOUT, || first.load(Ordering::SeqCst) >= 3
        && second.load(Ordering::SeqCst) >= 3));
    assert_eq!(launches(&log), 1);
    let stats = registry.stats();
    assert_eq!(stats.active_feeds, 1);
    assert_eq!(stats.processes_launched, 1);

    sub_a.cancel();
    sub_b.cancel();
    assert!(wait_until(TIMEOUT, || !registry.is_active(&spec)));
}

#[test]
fn last_subscriber_leaving_tears_down_and_resubscribe_relaunches() {
    let dir = tempfile::tempdir().unwrap();
    let frames = write_file(dir.path(), "frames.bin", &fake_jpeg(2, 50));
    let log = dir.path().join("launches.log");
    let spec = looping_decoder(&log, &[frames]);
    let registry = FeedRegistry::new(ShutdownToken::new());

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    registry
        .subscribe(&spec, move |event| match event {
            FeedEvent::Frame(_) => counter.fetch_add(1, Ordering::SeqCst) + 1 < 3,
            FeedEvent::Ended => panic!("declined subscriber must not see Ended"),
        })
        .unwrap();

    assert!(wait_until(TIMEOUT, || !registry.is_active(&spec)));
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(registry.stats().active_feeds, 0);

    let again = Arc::new(AtomicBool::new(false));
    let flag = again.clone();
    let sub = registry
        .subscribe(&spec, move |event| {
            if let FeedEvent::Frame(_) = event {
                flag.store(true, Ordering::SeqCst);
            }
            true
        })
        .unwrap();
    assert!(wait_until(TIMEOUT, || again.load(Ordering::SeqCst)));
    assert_eq!(launches(&log), 2);
    assert_eq!(registry.stats().processes_launched, 2);

    sub.cancel();
    assert!(wait_until(TIMEOUT, || !registry.is_active(&spec)));
}

#[test]
fn source_exit_delivers_ended_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut stream = fake_jpeg(3, 10);
    stream.extend(fake_jpeg(4, 10));
    let file = write_file(dir.path(), "two.bin", &stream);
    let spec = one_shot_decoder(&file);
    let registry = FeedRegistry::new(ShutdownToken::new());

    let events = Arc::new(Mutex::new(Vec::new()));
    let log = events.clone();
    registry
        .subscribe(&spec, move |event| {
            log.lock().unwrap().push(match event {
                FeedEvent::Frame(frame) => format!("frame:{}", frame[2]),
                FeedEvent::Ended => "ended".to_string(),
            });
            true
        })
        .unwrap();

    assert!(wait_until(TIMEOUT, || events.lock().unwrap().last().map(String::as_str) == Some("ended")));
    assert_eq!(*events.lock().unwrap(), vec!["frame:3", "frame:4", "ended"]);
    assert!(!registry.is_active(&spec));
}

#[test]
fn launch_failure_is_reported_to_the_subscriber() {
    let registry = FeedRegistry::new(ShutdownToken::new());
    let spec = ProcessSpec::new("/nonexistent/decoder", "-f mjpeg -");
    let err = registry.subscribe(&spec, |_| true).unwrap_err();
    assert!(format!("{:#}", err).contains("failed to launch"));
    assert!(!registry.is_active(&spec));
    assert_eq!(registry.stats().processes_launched, 0);
}

#[test]
fn shutdown_token_stops_the_reader() {
    let dir = tempfile::tempdir().unwrap();
    let frames = write_file(dir.path(), "frames.bin", &fake_jpeg(5, 20));
    let log = dir.path().join("launches.log");
    let spec = looping_decoder(&log, &[frames]);
    let shutdown = ShutdownToken::new();
    let registry = FeedRegistry::new(shutdown.clone());

    let ended = Arc::new(AtomicBool::new(false));
    let flag = ended.clone();
    registry
        .subscribe(&spec, move |event| {
            if event == FeedEvent::Ended {
                flag.store(true, Ordering::SeqCst);
            }
            true
        })
        .unwrap();
    assert!(registry.is_active(&spec));

    shutdown.trigger();
    assert!(wait_until(TIMEOUT, || ended.load(Ordering::SeqCst)));
    assert!(!registry.is_active(&spec));
}

#[test]
fn concurrent_subscribers_share_one_process() {
    const SUBSCRIBERS: usize = 16;
    let dir = tempfile::tempdir().unwrap();
    let frames = write_file(dir.path(), "frames.bin", &fake_jpeg(6, 40));
    let log = dir.path().join("launches.log");
    let spec = looping_decoder(&log, &[frames]);
    let registry = FeedRegistry::new(ShutdownToken::new());

    let barrier = Arc::new(Barrier::new(SUBSCRIBERS));
    let receiving = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..SUBSCRIBERS)
        .map(|_| {
            let registry = registry.clone();
            let spec = spec.clone();
            let barrier = barrier.clone();
            let receiving = receiving.clone();
            std::thread::spawn(move || {
                let mut first = true;
                barrier.wait();
                registry
                    .subscribe(&spec, move |event| {
                        if first && matches!(event, FeedEvent::Frame(_)) {
                            first = false;
                            receiving.fetch_add(1, Ordering::SeqCst);
                        }
                        true
                    })
                    .unwrap()
            })
        })
        .collect();
    let subscriptions: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

    assert!(wait_until(TIMEOUT, || receiving.load(Ordering::SeqCst) == SUBSCRIBERS));
    assert_eq!(launches(&log), 1);
    assert_eq!(registry.stats().processes_launched, 1);
    assert_eq!(registry.stats().active_feeds, 1);

    for subscription in &subscriptions {
        subscription.cancel();
    }
    assert!(wait_until(TIMEOUT, || !registry.is_active(&spec)));
}
