//! Adaptive capacity thresholds
//!
//! Free-space floors scale with node size: a percentage of total capacity,
//! but never less than an absolute minimum. Small nodes keep a meaningful
//! emergency margin and very large nodes waste almost nothing.

use archivum_common::{CapacityStatus, GB};

const WARNING_PCT: u64 = 15;
const CRITICAL_PCT: u64 = 8;
const FULL_PCT: u64 = 2;

const WARNING_FLOOR: u64 = 150 * GB;
const CRITICAL_FLOOR: u64 = 80 * GB;
const FULL_FLOOR: u64 = 20 * GB;

/// Free-space floors for one node size, in bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CapacityThresholds {
    pub total: u64,
    pub warning_free: u64,
    pub critical_free: u64,
    pub full_free: u64,
}

impl CapacityThresholds {
    /// Thresholds for a node of `total` bytes
    #[must_use]
    pub fn for_total(total: u64) -> Self {
        Self {
            total,
            warning_free: percent_of(total, WARNING_PCT).max(WARNING_FLOOR),
            critical_free: percent_of(total, CRITICAL_PCT).max(CRITICAL_FLOOR),
            full_free: percent_of(total, FULL_PCT).max(FULL_FLOOR),
        }
    }

    /// Status for a node with `free` bytes left.
    ///
    /// OK above the warning floor, FULL strictly below the full floor.
    #[must_use]
    pub const fn status_for(&self, free: u64) -> CapacityStatus {
        if free > self.warning_free {
            CapacityStatus::Ok
        } else if free > self.critical_free {
            CapacityStatus::Warning
        } else if free >= self.full_free {
            CapacityStatus::Critical
        } else {
            CapacityStatus::Full
        }
    }

    /// Fraction of total capacity usable before the node turns FULL
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn full_threshold_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.total.saturating_sub(self.full_free) as f64 / self.total as f64
    }
}

fn percent_of(total: u64, pct: u64) -> u64 {
    let scaled = u128::from(total) * u128::from(pct) / 100;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivum_common::TB;

    #[test]
    fn test_small_node_uses_absolute_floors() {
        let t = CapacityThresholds::for_total(500 * GB);
        assert_eq!(t.warning_free, 150 * GB);
        assert_eq!(t.critical_free, 80 * GB);
        assert_eq!(t.full_free, 20 * GB);
    }

    #[test]
    fn test_large_node_uses_percentages() {
        let t = CapacityThresholds::for_total(100 * TB);
        assert_eq!(t.warning_free, 15 * TB);
        assert_eq!(t.critical_free, 8 * TB);
        assert_eq!(t.full_free, 2 * TB);
    }

    #[test]
    fn test_status_bands() {
        let t = CapacityThresholds::for_total(TB);
        assert_eq!(t.status_for(200 * GB), CapacityStatus::Ok);
        assert_eq!(t.status_for(150 * GB), CapacityStatus::Warning);
        assert_eq!(t.status_for(100 * GB), CapacityStatus::Warning);
        assert_eq!(t.status_for(50 * GB), CapacityStatus::Critical);
        assert_eq!(t.status_for(20 * GB), CapacityStatus::Critical);
        assert_eq!(t.status_for(19 * GB), CapacityStatus::Full);
        assert_eq!(t.status_for(0), CapacityStatus::Full);
    }

    #[test]
    fn test_full_fraction_rises_with_bounded_waste() {
        let sizes = [500 * GB, TB, 10 * TB, 100 * TB];
        let fractions: Vec<f64> = sizes
            .iter()
            .map(|&s| CapacityThresholds::for_total(s).full_threshold_fraction())
            .collect();

        for pair in fractions.windows(2) {
            assert!(pair[1] >= pair[0], "{fractions:?}");
        }
        for (&size, &fraction) in sizes.iter().zip(&fractions) {
            if size >= TB {
                assert!(1.0 - fraction <= 0.02 + 1e-9, "{size}: {fraction}");
            }
        }
        assert!(fractions[0] < fractions[1]);
    }
}
