//! Timer scenarios

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rpcnet::{LocalError, Timer};

use common::*;

#[test]
fn test_cancel_before_deadline() {
    init_logging();

    let timer = Timer::new("test-timer").unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    let handle = timer
        .schedule(
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_millis(100),
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(timer.cancel(handle));
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!timer.cancel(handle));

    timer.destroy();
}

#[test]
fn test_repeated_task_never_overlaps() {
    init_logging();

    let timer = Timer::new("test-timer").unwrap();
    let starts = Arc::new(Mutex::new(Vec::new()));
    let recorded = starts.clone();
    let period = Duration::from_millis(20);
    let handle = timer
        .schedule_repeated(
            Arc::new(move || {
                recorded.lock().push(Instant::now());
                // Longer than the period
                std::thread::sleep(Duration::from_millis(50));
            }),
            period,
        )
        .unwrap();

    std::thread::sleep(Duration::from_millis(400));
    assert!(timer.cancel(handle));
    let starts = starts.lock().clone();
    assert!(starts.len() >= 2);
    for pair in starts.windows(2) {
        // Next run is scheduled a full period after the previous one ended
        assert!(pair[1] - pair[0] >= Duration::from_millis(50) + period);
    }

    timer.destroy();
}

#[test]
fn test_schedule_after_destroy() {
    init_logging();

    let timer = Timer::new("test-timer").unwrap();
    timer.destroy();
    assert!(timer.is_destroyed());
    assert_eq!(
        timer
            .schedule(Arc::new(|| {}), Duration::from_millis(1))
            .unwrap_err(),
        LocalError::CommunicatorDestroyed
    );
    timer.destroy();
}
