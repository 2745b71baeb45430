//! The broadcast clock — the deterministic core of the virtual-live trick.
//!
//! A fixed, finite playlist is presented as an infinite broadcast by wrapping
//! wall-clock time modulo the playlist's total duration. The only inputs are
//! the persisted broadcast epoch and the duration table, so every client
//! sharing those computes the same position at the same instant. All
//! functions take `now` explicitly — nothing here reads the system clock
//! except the one-time epoch initialisation.

use serde::{Deserialize, Serialize};

use crate::catalog::TrackCatalog;
use crate::durations::DurationTable;

/// A computed point on the broadcast timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivePosition {
    pub track_index: usize,
    pub offset_secs: f64,
    pub total_elapsed_secs: f64,
}

impl LivePosition {
    pub fn start() -> Self {
        Self {
            track_index: 0,
            offset_secs: 0.0,
            total_elapsed_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BroadcastClock {
    epoch_ms: i64,
}

impl BroadcastClock {
    pub fn new(epoch_ms: i64) -> Self {
        Self { epoch_ms }
    }

    pub fn epoch_ms(&self) -> i64 {
        self.epoch_ms
    }

    /// Epoch for a fresh install: local midnight of the current day, so the
    /// broadcast reads as having started at the top of the day of first use.
    pub fn midnight_today_ms() -> i64 {
        let now = chrono::Local::now();
        let midnight = now.date_naive().and_time(chrono::NaiveTime::MIN);
        match midnight.and_local_timezone(chrono::Local) {
            chrono::LocalResult::Single(dt) => dt.timestamp_millis(),
            chrono::LocalResult::Ambiguous(dt, _) => dt.timestamp_millis(),
            // DST gap at midnight — fall back to now
            chrono::LocalResult::None => now.timestamp_millis(),
        }
    }

    /// Where the broadcast is at `now_ms`. Pure: same inputs, same answer.
    ///
    /// Elapsed time is wrapped modulo the cycle length, then the catalog is
    /// walked in order accumulating durations until the running total passes
    /// the wrapped position. A zero-length cycle, an empty catalog, or a
    /// floating-point edge that exhausts the walk all fall back to track 0
    /// at offset 0 — a radio that plays something beats one that errors.
    pub fn position_at(
        &self,
        now_ms: i64,
        catalog: &TrackCatalog,
        durations: &DurationTable,
    ) -> LivePosition {
        let elapsed_secs = ((now_ms - self.epoch_ms).max(0) as f64) / 1000.0;
        if catalog.is_empty() {
            return LivePosition::start();
        }

        let cycle_secs = durations.total(catalog);
        if !(cycle_secs > 0.0) {
            return LivePosition {
                total_elapsed_secs: elapsed_secs,
                ..LivePosition::start()
            };
        }

        let position_in_cycle = elapsed_secs % cycle_secs;
        let mut accumulated = 0.0;
        for i in 0..catalog.len() {
            let dur = durations.get(i, catalog);
            if accumulated + dur > position_in_cycle {
                return LivePosition {
                    track_index: i,
                    offset_secs: position_in_cycle - accumulated,
                    total_elapsed_secs: elapsed_secs,
                };
            }
            accumulated += dur;
        }

        LivePosition {
            total_elapsed_secs: elapsed_secs,
            ..LivePosition::start()
        }
    }
}

/// Roll `(track_index, offset_secs)` forward by `elapsed_secs` of broadcast
/// time, wrapping at the catalog end. This is the resume computation: the
/// position the station would have reached had it kept playing silently.
pub fn advance_from(
    track_index: usize,
    offset_secs: f64,
    elapsed_secs: f64,
    catalog: &TrackCatalog,
    durations: &DurationTable,
) -> (usize, f64) {
    if catalog.is_empty() {
        return (0, 0.0);
    }

    let n = catalog.len();
    let mut track = track_index % n;
    let mut offset = offset_secs.max(0.0);
    let mut remaining = elapsed_secs.max(0.0);

    while remaining > 0.0 {
        let dur = durations.get(track, catalog);
        let left_in_track = (dur - offset).max(0.0);
        if remaining < left_in_track {
            offset += remaining;
            break;
        }
        remaining -= left_in_track;
        track = (track + 1) % n;
        offset = 0.0;
    }

    (track, offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_track_table(catalog: &TrackCatalog) -> DurationTable {
        let mut t = DurationTable::new();
        t.set(0, 100.0);
        t.set(1, 100.0);
        let _ = catalog;
        t
    }

    #[test]
    fn test_position_is_deterministic() {
        let catalog = TrackCatalog::builtin(2);
        let durations = two_track_table(&catalog);
        let clock = BroadcastClock::new(0);
        let a = clock.position_at(123_456, &catalog, &durations);
        let b = clock.position_at(123_456, &catalog, &durations);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cycle_wraparound() {
        // 2 tracks of 100s, epoch 0, now 250s: 250 mod 200 = 50 → track 0 @ 50
        let catalog = TrackCatalog::builtin(2);
        let durations = two_track_table(&catalog);
        let clock = BroadcastClock::new(0);
        let pos = clock.position_at(250_000, &catalog, &durations);
        assert_eq!(pos.track_index, 0);
        assert!((pos.offset_secs - 50.0).abs() < 1e-9);
        assert!((pos.total_elapsed_secs - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_crosses_track_boundary() {
        let catalog = TrackCatalog::builtin(2);
        let durations = two_track_table(&catalog);
        let clock = BroadcastClock::new(0);
        let pos = clock.position_at(130_000, &catalog, &durations);
        assert_eq!(pos.track_index, 1);
        assert!((pos.offset_secs - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_now_before_epoch_clamps_to_start() {
        let catalog = TrackCatalog::builtin(2);
        let durations = two_track_table(&catalog);
        let clock = BroadcastClock::new(1_000_000);
        let pos = clock.position_at(500_000, &catalog, &durations);
        assert_eq!(pos.track_index, 0);
        assert_eq!(pos.offset_secs, 0.0);
        assert_eq!(pos.total_elapsed_secs, 0.0);
    }

    #[test]
    fn test_empty_catalog_falls_back() {
        let catalog = TrackCatalog::builtin(0);
        let durations = DurationTable::new();
        let clock = BroadcastClock::new(0);
        assert_eq!(
            clock.position_at(10_000, &catalog, &durations),
            LivePosition::start()
        );
    }

    #[test]
    fn test_advance_rolls_across_tracks() {
        // pause at track 0 @ 90, tracks 100s each, 30s gap:
        // 10s finishes track 0, 20s into track 1
        let catalog = TrackCatalog::builtin(2);
        let durations = two_track_table(&catalog);
        let (track, offset) = advance_from(0, 90.0, 30.0, &catalog, &durations);
        assert_eq!(track, 1);
        assert!((offset - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_advance_wraps_catalog_end() {
        let catalog = TrackCatalog::builtin(2);
        let durations = two_track_table(&catalog);
        // 90 + 130 = 220 → wraps the 200s cycle, lands on track 0 @ 20
        let (track, offset) = advance_from(0, 90.0, 130.0, &catalog, &durations);
        assert_eq!(track, 0);
        assert!((offset - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_advance_with_offset_past_duration() {
        // a stale snapshot past the (since-refined) track end rolls forward
        // instead of looping
        let catalog = TrackCatalog::builtin(2);
        let durations = two_track_table(&catalog);
        let (track, offset) = advance_from(0, 150.0, 10.0, &catalog, &durations);
        assert_eq!(track, 1);
        assert!((offset - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_midnight_epoch_is_before_now() {
        let epoch = BroadcastClock::midnight_today_ms();
        let now = chrono::Local::now().timestamp_millis();
        assert!(epoch <= now);
        // within the last 24h
        assert!(now - epoch < 24 * 3600 * 1000 + 3600 * 1000);
    }
}
