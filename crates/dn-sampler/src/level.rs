//! Likelihood threshold levels.
//!
//! A level is an immutable threshold plus Metropolis-Hastings and transit
//! counters. `log_x`, the log of the prior mass estimated to lie above
//! the threshold, is derived from visit/exceed counts and never set
//! directly.

use crate::likelihood::LogLikelihood;
use serde::{Deserialize, Serialize};

/// One rung of the nested-likelihood ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Level {
    threshold: LogLikelihood,
    log_x: f64,
    accepts: u64,
    tries: u64,
    visits: u64,
    exceeds: u64,
}

impl Level {
    /// Create a level at `threshold` with zeroed counters.
    pub fn new(threshold: LogLikelihood) -> Self {
        Self { threshold, log_x: 0.0, accepts: 0, tries: 0, visits: 0, exceeds: 0 }
    }

    /// The ladder's first level, with threshold `(-inf, 0)`.
    pub fn floor() -> Self {
        Self::new(LogLikelihood::floor())
    }

    /// Likelihood threshold.
    pub fn threshold(&self) -> LogLikelihood {
        self.threshold
    }

    /// Log prior mass above this level's threshold (`0` for the floor).
    pub fn log_x(&self) -> f64 {
        self.log_x
    }

    /// Accepted particle perturbations at this level.
    pub fn accepts(&self) -> u64 {
        self.accepts
    }

    /// Attempted particle perturbations at this level.
    pub fn tries(&self) -> u64 {
        self.tries
    }

    /// Particle transits through this level.
    pub fn visits(&self) -> u64 {
        self.visits
    }

    /// Transits that crossed the next-higher threshold.
    pub fn exceeds(&self) -> u64 {
        self.exceeds
    }

    /// Add to the accept counter.
    pub fn increment_accepts(&mut self, n: u64) {
        self.accepts += n;
    }

    /// Add to the try counter.
    pub fn increment_tries(&mut self, n: u64) {
        self.tries += n;
    }

    /// Add to the visit counter.
    pub fn increment_visits(&mut self, n: u64) {
        self.visits += n;
    }

    /// Add to the exceed counter.
    pub fn increment_exceeds(&mut self, n: u64) {
        self.exceeds += n;
    }

    /// Damp accumulated visit statistics once the ladder is complete.
    ///
    /// Every visit/exceed count is scaled by
    /// `regularisation / (regularisation + max_visits)` where `max_visits`
    /// is the ladder-wide maximum, so the noisy early history stops
    /// dominating the mass estimates.
    pub fn renormalise_visits(levels: &mut [Level], regularisation: f64) {
        let max_visits = levels.iter().map(|l| l.visits).max().unwrap_or(0);
        let factor = regularisation / (regularisation + max_visits as f64);
        for level in levels {
            level.visits = (level.visits as f64 * factor) as u64;
            level.exceeds = (level.exceeds as f64 * factor) as u64;
        }
    }

    /// Recompute every `log_x` from the current counters.
    ///
    /// Laplace-smoothed estimate of the mass ratio between adjacent
    /// levels: the floor keeps `log_x = 0`, and each level above adds
    /// `ln((exceeds + regularisation/compression) / (visits +
    /// regularisation))` to its predecessor. The ratio is strictly below
    /// one (`exceeds ≤ visits` and `compression > 1`), so `log_x` is
    /// strictly decreasing up the ladder.
    pub fn recalculate_log_x(levels: &mut [Level], compression: f64, regularisation: f64) {
        levels[0].log_x = 0.0;
        for j in 1..levels.len() {
            let below_exceeds = levels[j - 1].exceeds as f64;
            let below_visits = levels[j - 1].visits as f64;
            levels[j].log_x = levels[j - 1].log_x
                + ((below_exceeds + regularisation / compression)
                    / (below_visits + regularisation))
                    .ln();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ladder(n: usize) -> Vec<Level> {
        let mut levels = vec![Level::floor()];
        for j in 1..n {
            levels.push(Level::new(LogLikelihood::new(j as f64, 0.5)));
        }
        levels
    }

    #[test]
    fn test_counters_start_zero() {
        let level = Level::floor();
        assert_eq!(level.accepts(), 0);
        assert_eq!(level.tries(), 0);
        assert_eq!(level.visits(), 0);
        assert_eq!(level.exceeds(), 0);
        assert_eq!(level.log_x(), 0.0);
    }

    #[test]
    fn test_recalculate_log_x_with_no_counts() {
        // With empty counters the smoothing alone gives exactly one unit
        // of log-compression per level.
        let mut levels = ladder(4);
        let e = std::f64::consts::E;
        Level::recalculate_log_x(&mut levels, e, 100.0);
        for (j, level) in levels.iter().enumerate() {
            assert_relative_eq!(level.log_x(), -(j as f64), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_log_x_strictly_decreasing() {
        let mut levels = ladder(6);
        levels[0].increment_visits(1000);
        levels[0].increment_exceeds(1000); // exceeds == visits still compresses
        levels[1].increment_visits(500);
        levels[1].increment_exceeds(180);
        levels[2].increment_visits(10);
        levels[2].increment_exceeds(0);
        Level::recalculate_log_x(&mut levels, std::f64::consts::E, 100.0);
        assert_eq!(levels[0].log_x(), 0.0);
        for j in 1..levels.len() {
            assert!(
                levels[j].log_x() < levels[j - 1].log_x(),
                "log_x must strictly decrease: {} vs {}",
                levels[j].log_x(),
                levels[j - 1].log_x()
            );
        }
    }

    #[test]
    fn test_recalculate_log_x_deterministic() {
        let mut a = ladder(5);
        a[1].increment_visits(123);
        a[1].increment_exceeds(45);
        let mut b = a.clone();
        Level::recalculate_log_x(&mut a, std::f64::consts::E, 250.0);
        Level::recalculate_log_x(&mut b, std::f64::consts::E, 250.0);
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.log_x(), y.log_x());
        }
    }

    #[test]
    fn test_renormalise_visits_scales_by_max() {
        let mut levels = ladder(3);
        levels[0].increment_visits(9000);
        levels[0].increment_exceeds(3000);
        levels[1].increment_visits(1000);
        levels[1].increment_exceeds(400);
        Level::renormalise_visits(&mut levels, 1000.0);
        // factor = 1000 / (1000 + 9000) = 0.1
        assert_eq!(levels[0].visits(), 900);
        assert_eq!(levels[0].exceeds(), 300);
        assert_eq!(levels[1].visits(), 100);
        assert_eq!(levels[1].exceeds(), 40);
        // MH statistics untouched
        assert_eq!(levels[0].accepts(), 0);
        assert_eq!(levels[0].tries(), 0);
    }
}
