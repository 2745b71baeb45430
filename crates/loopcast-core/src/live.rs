//! Live/paused tracking.
//!
//! `LiveTracker` records whether playback is following the broadcast clock
//! or has drifted from it, and computes the correct landing point when a
//! paused station resumes. The liveness flag is a queryable value; state
//! change notification is the daemon's job (it diffs snapshots and
//! broadcasts), so there is no callback registry here.

use crate::catalog::TrackCatalog;
use crate::clock::{advance_from, BroadcastClock, LivePosition};
use crate::durations::DurationTable;

/// Actual playback within this many seconds of the computed live point (on
/// the same track) still counts as live.
pub const LIVE_THRESHOLD_SECS: f64 = 5.0;

/// Recorded at the moment playback pauses; consumed by the next resume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PauseSnapshot {
    pub wall_clock_ms: i64,
    pub track_index: usize,
    pub offset_secs: f64,
}

#[derive(Debug, Clone)]
pub struct LiveTracker {
    paused_at: Option<PauseSnapshot>,
    is_live: bool,
    threshold_secs: f64,
}

impl Default for LiveTracker {
    fn default() -> Self {
        Self::new(LIVE_THRESHOLD_SECS)
    }
}

impl LiveTracker {
    pub fn new(threshold_secs: f64) -> Self {
        Self {
            paused_at: None,
            is_live: true,
            threshold_secs,
        }
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    pub fn snapshot(&self) -> Option<PauseSnapshot> {
        self.paused_at
    }

    /// LIVE → PAUSED: remember where (and when) we stopped.
    pub fn pause(&mut self, now_ms: i64, track_index: usize, offset_secs: f64) {
        self.paused_at = Some(PauseSnapshot {
            wall_clock_ms: now_ms,
            track_index,
            offset_secs,
        });
        self.is_live = false;
    }

    /// PAUSED → LIVE: advance the snapshot by the wall-clock gap, as if the
    /// broadcast had kept playing silently. Without a snapshot (or with one
    /// referencing a track outside the catalog) this degrades to the clock's
    /// live computation.
    pub fn resume(
        &mut self,
        now_ms: i64,
        clock: &BroadcastClock,
        catalog: &TrackCatalog,
        durations: &DurationTable,
    ) -> LivePosition {
        let snapshot = match self.paused_at.take() {
            Some(s) if s.track_index < catalog.len() => s,
            _ => return self.go_live(now_ms, clock, catalog, durations),
        };

        let gap_secs = ((now_ms - snapshot.wall_clock_ms).max(0) as f64) / 1000.0;
        let (track_index, offset_secs) = advance_from(
            snapshot.track_index,
            snapshot.offset_secs,
            gap_secs,
            catalog,
            durations,
        );
        self.is_live = true;

        LivePosition {
            track_index,
            offset_secs,
            total_elapsed_secs: clock
                .position_at(now_ms, catalog, durations)
                .total_elapsed_secs,
        }
    }

    /// Jump to the live edge: discard any snapshot and recompute directly.
    pub fn go_live(
        &mut self,
        now_ms: i64,
        clock: &BroadcastClock,
        catalog: &TrackCatalog,
        durations: &DurationTable,
    ) -> LivePosition {
        self.paused_at = None;
        self.is_live = true;
        clock.position_at(now_ms, catalog, durations)
    }

    /// Seeking or manual track navigation: state stays LIVE, liveness drops.
    pub fn mark_diverged(&mut self) {
        self.is_live = false;
    }

    /// Drop a pending snapshot without resuming (stop, manual navigation).
    /// The next Play joins the live edge instead of advancing a stale point.
    pub fn discard_snapshot(&mut self) {
        self.paused_at = None;
    }

    /// Liveness detector — run on every position sample. Same track within
    /// the threshold → live; anything else → diverged. Advisory only.
    pub fn check(&mut self, actual_track: usize, actual_offset_secs: f64, live: &LivePosition) -> bool {
        self.is_live = actual_track == live.track_index
            && (actual_offset_secs - live.offset_secs).abs() < self.threshold_secs;
        self.is_live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (BroadcastClock, TrackCatalog, DurationTable) {
        let catalog = TrackCatalog::builtin(2);
        let mut durations = DurationTable::new();
        durations.set(0, 100.0);
        durations.set(1, 100.0);
        (BroadcastClock::new(0), catalog, durations)
    }

    #[test]
    fn test_pause_then_resume_advances() {
        let (clock, catalog, durations) = fixture();
        let mut tracker = LiveTracker::default();

        tracker.pause(1_000_000, 0, 90.0);
        assert!(!tracker.is_live());
        assert!(tracker.is_paused());

        let pos = tracker.resume(1_030_000, &clock, &catalog, &durations);
        assert_eq!(pos.track_index, 1);
        assert!((pos.offset_secs - 20.0).abs() < 1e-9);
        assert!(tracker.is_live());
        assert!(!tracker.is_paused());
    }

    #[test]
    fn test_resume_without_snapshot_goes_live() {
        let (clock, catalog, durations) = fixture();
        let mut tracker = LiveTracker::default();
        let pos = tracker.resume(250_000, &clock, &catalog, &durations);
        assert_eq!(pos, clock.position_at(250_000, &catalog, &durations));
    }

    #[test]
    fn test_resume_with_out_of_range_snapshot_goes_live() {
        let (clock, catalog, durations) = fixture();
        let mut tracker = LiveTracker::default();
        tracker.pause(0, 17, 50.0); // catalog has shrunk out from under us
        let pos = tracker.resume(250_000, &clock, &catalog, &durations);
        assert_eq!(pos, clock.position_at(250_000, &catalog, &durations));
        assert!(tracker.is_live());
    }

    #[test]
    fn test_go_live_discards_snapshot() {
        let (clock, catalog, durations) = fixture();
        let mut tracker = LiveTracker::default();
        tracker.pause(0, 0, 90.0);
        tracker.mark_diverged();

        let pos = tracker.go_live(250_000, &clock, &catalog, &durations);
        assert_eq!(pos, clock.position_at(250_000, &catalog, &durations));
        assert!(tracker.is_live());
        assert!(tracker.snapshot().is_none());
    }

    #[test]
    fn test_liveness_threshold() {
        let (clock, catalog, durations) = fixture();
        let mut tracker = LiveTracker::default();
        let live = clock.position_at(50_000, &catalog, &durations); // track 0 @ 50

        assert!(tracker.check(0, 52.0, &live));
        assert!(tracker.check(0, 54.9, &live));
        assert!(!tracker.check(0, 56.0, &live));
        // different track: never live, offset regardless
        assert!(!tracker.check(1, 50.0, &live));
    }

    #[test]
    fn test_seek_clears_liveness_until_convergence() {
        let (clock, catalog, durations) = fixture();
        let mut tracker = LiveTracker::default();
        tracker.mark_diverged();
        assert!(!tracker.is_live());

        // natural convergence restores the flag
        let live = clock.position_at(50_000, &catalog, &durations);
        assert!(tracker.check(0, 50.0, &live));
    }
}
