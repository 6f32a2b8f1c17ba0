//! Lagging-particle recovery.
//!
//! Particles whose likelihood ceiling is far below the advancing ladder
//! fall behind the push and must be replaced by copies of healthy
//! donors. The model below makes lagging certain: particles starting in
//! the left half of the prior can barely move, while the right half
//! climbs freely and drives level creation past the laggards.

use dn_sampler::{Model, Options, Rng, Sampler};
use serde::{Deserialize, Serialize};
use std::io;

/// `log L = x` on a uniform prior over [0, 20], with proposals that are
/// effectively frozen for `x < 10`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HalfFrozen {
    x: f64,
}

impl Model for HalfFrozen {
    fn from_prior(rng: &mut Rng) -> Self {
        Self { x: 20.0 * rng.rand() }
    }

    fn perturb(&mut self, rng: &mut Rng) -> f64 {
        let step = if self.x < 10.0 { 1e-3 } else { 20.0 };
        self.x = (self.x + step * rng.randh()).rem_euclid(20.0);
        0.0
    }

    fn log_likelihood(&self) -> f64 {
        self.x
    }

    fn print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        write!(out, "{}", self.x)
    }

    fn description(&self) -> String {
        "x".to_string()
    }
}

#[test]
fn stranded_particles_are_replaced() {
    let options = Options {
        num_particles: 10,
        new_level_interval: 100,
        save_interval: 100,
        thread_steps: 100,
        max_num_levels: 25,
        lambda: 1.0,
        beta: 100.0,
        max_num_saves: 150,
        ..Options::default()
    };
    let mut sampler = Sampler::<HalfFrozen>::new(1, std::f64::consts::E, options, false).unwrap();
    sampler.initialise(6, false).unwrap();
    assert_eq!(sampler.replacements(), 0);
    sampler.run(u32::MAX).unwrap();

    // With λ = 1 a particle a handful of levels behind the top is killed
    // with near-certainty at each level creation, and half the ensemble
    // starts frozen.
    assert!(
        sampler.replacements() >= 1,
        "expected at least one lagging-particle replacement, got {}",
        sampler.replacements()
    );

    // Replacement copies donor state wholesale, so the usual invariants
    // survive it.
    let levels = sampler.levels_snapshot();
    let logls = sampler.log_likelihoods_snapshot();
    let assignments = sampler.level_assignments_snapshot();
    assert_eq!(logls.len(), 10);
    for (logl, &assignment) in logls.iter().zip(&assignments) {
        assert!(assignment < levels.len());
        assert!(levels[assignment].threshold() < *logl);
    }
    for pair in levels.windows(2) {
        assert!(pair[0].threshold() < pair[1].threshold());
    }
}

#[test]
fn replacement_count_is_monotone_over_restarts() {
    // The counter is part of the persisted state: a restored run never
    // loses replacements.
    let dir = tempfile::tempdir().unwrap();
    let options = Options {
        num_particles: 10,
        new_level_interval: 100,
        save_interval: 100,
        thread_steps: 100,
        max_num_levels: 25,
        lambda: 1.0,
        beta: 100.0,
        max_num_saves: 80,
        sample_file: dir.path().join("sample.txt"),
        sample_info_file: dir.path().join("sample_info.txt"),
        levels_file: dir.path().join("levels.txt"),
        best_particle_file: dir.path().join("best_particle.txt"),
        best_likelihood_file: dir.path().join("best_likelihood.txt"),
        checkpoint_file: dir.path().join("checkpoint.json"),
        write_exact_representation: false,
    };
    let mut sampler =
        Sampler::<HalfFrozen>::new(1, std::f64::consts::E, options.clone(), true).unwrap();
    sampler.initialise(6, false).unwrap();
    sampler.run(u32::MAX).unwrap();
    let after_first = sampler.replacements();
    drop(sampler);

    let mut resumed = Sampler::<HalfFrozen>::new(
        1,
        std::f64::consts::E,
        Options { max_num_saves: 150, ..options },
        true,
    )
    .unwrap();
    resumed.initialise(6, true).unwrap();
    assert_eq!(resumed.replacements(), after_first);
    resumed.run(u32::MAX).unwrap();
    assert!(resumed.replacements() >= after_first);
}
