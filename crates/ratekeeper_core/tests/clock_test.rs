//! Tests for the clock implementations.

use chrono::{TimeZone, Utc};
use ratekeeper_core::{Clock, ManualClock, SystemClock};
use std::time::Duration;

#[tokio::test]
async fn test_manual_clock_sleep_advances_time() {
    let start = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let clock = ManualClock::new(start);

    clock.sleep(Duration::from_secs(90)).await;

    assert_eq!(clock.now(), Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 30).unwrap());
}

#[test]
fn test_manual_clock_clones_share_time() {
    let clock = ManualClock::default();
    let other = clock.clone();
    let before = clock.now();

    other.advance(Duration::from_millis(1500));

    assert_eq!((clock.now() - before).num_milliseconds(), 1500);
}

#[test]
fn test_manual_clock_set() {
    let clock = ManualClock::default();
    let target = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    clock.set(target);
    assert_eq!(clock.now(), target);
}

#[tokio::test]
async fn test_system_clock_sleep_waits() {
    let clock = SystemClock;
    let before = clock.now();
    clock.sleep(Duration::from_millis(20)).await;
    assert!((clock.now() - before).num_milliseconds() >= 15);
}
