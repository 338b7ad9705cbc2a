use serde::{Deserialize, Serialize};

/// Persisted per-path record. Keyed in the MetaStore by the path relative to the
/// mount point, with no leading separator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Absolute backend path of the tier currently owning this file.
    pub tier_path: String,
    /// Accesses since the last popularity computation; reset every pass.
    pub access_count: u64,
    /// Smoothed accesses-per-hour.
    pub popularity: f64,
    pub pinned: bool,
}

impl FileMeta {
    pub fn new(tier_path: impl Into<String>) -> Self {
        Self {
            tier_path: tier_path.into(),
            access_count: 0,
            popularity: 0.0,
            pinned: false,
        }
    }

    pub fn touch(&mut self) {
        self.access_count += 1;
    }
}

/// Tuning constants for the popularity formula, fixed at startup (§1 treats them as
/// an external, configurable collaborator).
#[derive(Debug, Clone, Copy)]
pub struct PopularityConstants {
    pub start_damping: f64,
    pub damping: f64,
    pub multiplier: f64,
    /// time, in seconds, over which `age * slope` ramps from `start_damping` to `damping`.
    pub reach_full_damping_after: f64,
}

impl PopularityConstants {
    pub fn slope(&self) -> f64 {
        (self.damping - self.start_damping) / self.reach_full_damping_after
    }
}

impl Default for PopularityConstants {
    fn default() -> Self {
        Self {
            start_damping: 50_000.0,
            damping: 1_000_000.0,
            multiplier: 3600.0,
            reach_full_damping_after: 604_800.0,
        }
    }
}

/// One popularity update, performed once per FileView per pass. `ctime` and `now` are
/// in seconds (wall clock, since ctime itself is wall clock — see the open question on
/// mixing clocks); `period_secs` is the steady-clock delta since the previous pass.
pub fn calc_popularity(
    constants: &PopularityConstants,
    access_count: u64,
    popularity_old: f64,
    ctime_secs: f64,
    now_secs: f64,
    period_secs: f64,
) -> f64 {
    debug_assert!(period_secs > 0.0);
    let usage_frequency = if access_count > 0 {
        access_count as f64 / period_secs
    } else {
        0.0
    };
    let age = (now_secs - ctime_secs) + period_secs / 2.0;
    let damping = (age * constants.slope() + constants.start_damping).min(constants.damping) / period_secs;
    constants.multiplier * usage_frequency / damping + (1.0 - 1.0 / damping) * popularity_old
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_increments_access_count() {
        let mut m = FileMeta::new("/fast");
        assert_eq!(m.access_count, 0);
        m.touch();
        m.touch();
        assert_eq!(m.access_count, 2);
    }

    #[test]
    fn slope_matches_original_constants() {
        let c = PopularityConstants::default();
        let expected = (1_000_000.0 - 50_000.0) / 604_800.0;
        assert!((c.slope() - expected).abs() < 1e-9);
    }

    #[test]
    fn popularity_zero_accesses_decays_toward_zero() {
        let c = PopularityConstants::default();
        let p = calc_popularity(&c, 0, 100.0, 0.0, 1000.0, 1000.0);
        assert!(p < 100.0);
        assert!(p >= 0.0);
    }

    #[test]
    fn popularity_grows_with_access_count() {
        let c = PopularityConstants::default();
        let low = calc_popularity(&c, 1, 0.0, 0.0, 1000.0, 1000.0);
        let high = calc_popularity(&c, 100, 0.0, 0.0, 1000.0, 1000.0);
        assert!(high > low);
    }
}
