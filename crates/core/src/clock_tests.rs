// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use chrono::TimeZone;

#[test]
fn system_clock_does_not_go_backwards() {
    let clock = SystemClock;
    let a = clock.now();
    let b = clock.now();
    assert!(b >= a);
}

#[test]
fn fake_clock_returns_what_was_set() {
    let start = Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap();
    let clock = FakeClock::new(start);
    assert_eq!(clock.now(), start);

    let later = Utc.with_ymd_and_hms(2021, 3, 2, 9, 30, 0).unwrap();
    clock.set(later);
    assert_eq!(clock.now(), later);
}

#[test]
fn fake_clock_advance_adds_duration() {
    let start = Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap();
    let clock = FakeClock::new(start);

    clock.advance(Duration::minutes(90));
    assert_eq!(clock.now(), start + Duration::minutes(90));
}

#[test]
fn fake_clock_clones_share_time() {
    let start = Utc.with_ymd_and_hms(2021, 3, 1, 12, 0, 0).unwrap();
    let clock = FakeClock::new(start);
    let view = clock.clone();

    clock.advance(Duration::seconds(61));
    assert_eq!(view.now(), start + Duration::seconds(61));
}
