//! Per-track duration cache.
//!
//! Starts empty and is refined as tracks load and report their measured
//! duration. Reads never fail: a missing entry falls back to the catalog
//! estimate, then to the hard-coded default. The cycle length therefore
//! shifts slightly as more tracks get measured — an accepted, bounded
//! inaccuracy rather than something to reconcile across clients.

use std::collections::HashMap;

use crate::catalog::{TrackCatalog, DEFAULT_TRACK_SECS};

#[derive(Debug, Clone, Default)]
pub struct DurationTable {
    measured: HashMap<usize, f64>,
}

impl DurationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a measured duration. Non-finite or non-positive input is a
    /// silent no-op — malformed metadata must not disturb scheduling.
    pub fn set(&mut self, index: usize, secs: f64) {
        if secs.is_finite() && secs > 0.0 {
            self.measured.insert(index, secs);
        }
    }

    pub fn measured(&self, index: usize) -> Option<f64> {
        self.measured.get(&index).copied()
    }

    /// Measured value → catalog estimate → default. Always a valid answer,
    /// even before any track has loaded.
    pub fn get(&self, index: usize, catalog: &TrackCatalog) -> f64 {
        self.measured
            .get(&index)
            .copied()
            .or_else(|| catalog.estimated_duration(index))
            .unwrap_or(DEFAULT_TRACK_SECS)
    }

    /// Total cycle length. O(N), side-effect-free; called on every position
    /// computation.
    pub fn total(&self, catalog: &TrackCatalog) -> f64 {
        (0..catalog.len()).map(|i| self.get(i, catalog)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_chain() {
        let catalog = TrackCatalog::builtin(3);
        let mut table = DurationTable::new();
        assert_eq!(table.get(0, &catalog), 3600.0);

        table.set(0, 1234.5);
        assert_eq!(table.get(0, &catalog), 1234.5);
        assert_eq!(table.get(1, &catalog), 3600.0);

        // out-of-catalog index still answers with the default
        assert_eq!(table.get(99, &catalog), 3600.0);
    }

    #[test]
    fn test_invalid_durations_are_ignored() {
        let catalog = TrackCatalog::builtin(2);
        let mut table = DurationTable::new();
        let before = table.total(&catalog);

        table.set(0, 0.0);
        table.set(0, -5.0);
        table.set(0, f64::NAN);
        table.set(0, f64::INFINITY);

        assert_eq!(table.total(&catalog), before);
        assert!(table.measured(0).is_none());
    }

    #[test]
    fn test_refinement_is_idempotent() {
        let catalog = TrackCatalog::builtin(2);
        let mut table = DurationTable::new();
        table.set(0, 100.0);
        let once = table.total(&catalog);
        table.set(0, 100.0);
        assert_eq!(table.total(&catalog), once);
    }

    #[test]
    fn test_total_shifts_as_measurements_arrive() {
        // Documented choice: the cycle length is a monotonically refining
        // estimate, not a constant pinned at catalog load.
        let catalog = TrackCatalog::builtin(2);
        let mut table = DurationTable::new();
        assert_eq!(table.total(&catalog), 7200.0);
        table.set(0, 1800.0);
        assert_eq!(table.total(&catalog), 5400.0);
        table.set(0, 2000.0);
        assert_eq!(table.total(&catalog), 5600.0);
    }
}
