//! A flat likelihood progresses through tiebreakers alone.
//!
//! With `log L ≡ 0` every threshold has value 0 and the ladder climbs in
//! tiebreaker space only. The automatic completion test sees zero-width
//! gaps, so it must declare the ladder done as soon as its minimum window
//! is available, at exactly 50 levels.

use dn_sampler::{Model, Options, Rng, Sampler};
use serde::{Deserialize, Serialize};
use std::io;

/// One bounded coordinate with a likelihood that is identically zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatModel {
    x: f64,
}

impl Model for FlatModel {
    fn from_prior(rng: &mut Rng) -> Self {
        Self { x: rng.rand() }
    }

    fn perturb(&mut self, rng: &mut Rng) -> f64 {
        self.x = (self.x + rng.randh()).rem_euclid(1.0);
        0.0
    }

    fn log_likelihood(&self) -> f64 {
        0.0
    }

    fn print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        write!(out, "{}", self.x)
    }

    fn description(&self) -> String {
        "x".to_string()
    }
}

#[test]
fn flat_likelihood_completes_by_tiebreaker_only() {
    let options = Options {
        num_particles: 5,
        new_level_interval: 60,
        save_interval: 100,
        thread_steps: 100,
        max_num_levels: 0,
        lambda: 10.0,
        beta: 100.0,
        max_num_saves: 800,
        ..Options::default()
    };
    let mut sampler = Sampler::<FlatModel>::new(1, std::f64::consts::E, options, false).unwrap();
    sampler.initialise(2, false).unwrap();
    sampler.run(u32::MAX).unwrap();

    let levels = sampler.levels_snapshot();
    assert!(
        sampler.ladder_complete(),
        "auto detection must fire once the gap window is available ({} levels)",
        levels.len()
    );
    // The n-gap test needs n >= 30, which first holds at 50 levels; all
    // gaps are zero, so completion happens exactly there.
    assert_eq!(levels.len(), 50);

    // Value gaps are all zero; progress lives in the tiebreakers.
    for pair in levels.windows(2) {
        assert!(pair[0].threshold() < pair[1].threshold());
    }
    for level in &levels[1..] {
        assert_eq!(level.threshold().value(), 0.0);
        assert!((0.0..1.0).contains(&level.threshold().tiebreaker()));
    }
    let tiebreakers: Vec<f64> = levels[1..].iter().map(|l| l.threshold().tiebreaker()).collect();
    for pair in tiebreakers.windows(2) {
        assert!(pair[0] < pair[1], "tiebreaker thresholds must increase");
    }

    // Once complete, the ladder never grows again: the remaining saves
    // ran with 50 levels and the particles still move.
    assert!(sampler.count_saves() <= 800);
    for assignment in sampler.level_assignments_snapshot() {
        assert!(assignment < 50);
    }
}
