//! Minimal end-to-end run: a 2-D Gaussian under a uniform prior.
//!
//! Writes sample.txt, sample_info.txt, levels.txt, the best-particle
//! records and a restartable checkpoint into the working directory.
//!
//! Run with: cargo run -p dn-sampler --example gaussian

use dn_sampler::{Model, Options, Rng, Sampler};
use serde::{Deserialize, Serialize};
use std::io;

const SCALE: f64 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Gaussian2D {
    x0: f64,
    x1: f64,
}

fn wrap(x: f64, lo: f64, hi: f64) -> f64 {
    lo + (x - lo).rem_euclid(hi - lo)
}

impl Model for Gaussian2D {
    fn from_prior(rng: &mut Rng) -> Self {
        Self {
            x0: -SCALE + 2.0 * SCALE * rng.rand(),
            x1: -SCALE + 2.0 * SCALE * rng.rand(),
        }
    }

    fn perturb(&mut self, rng: &mut Rng) -> f64 {
        self.x0 = wrap(self.x0 + SCALE * rng.randh(), -SCALE, SCALE);
        self.x1 = wrap(self.x1 + SCALE * rng.randh(), -SCALE, SCALE);
        0.0
    }

    fn log_likelihood(&self) -> f64 {
        -0.5 * (2.0 * std::f64::consts::PI).ln() - 0.5 * (self.x0 * self.x0 + self.x1 * self.x1)
    }

    fn print(&self, out: &mut dyn io::Write) -> io::Result<()> {
        write!(out, "{} {}", self.x0, self.x1)
    }

    fn description(&self) -> String {
        "x0 x1".to_string()
    }
}

fn main() -> dn_sampler::Result<()> {
    let options = Options {
        num_particles: 5,
        new_level_interval: 1000,
        save_interval: 1000,
        thread_steps: 100,
        max_num_levels: 0,
        lambda: 10.0,
        beta: 100.0,
        max_num_saves: 100,
        ..Options::default()
    };

    let mut sampler = Sampler::<Gaussian2D>::new(1, std::f64::consts::E, options, true)?;
    sampler.initialise(1, false)?;
    sampler.run(10)?;

    let levels = sampler.levels_snapshot();
    println!("saves:        {}", sampler.count_saves());
    println!("mcmc steps:   {}", sampler.count_mcmc_steps());
    println!("levels:       {}", levels.len());
    println!("top log_X:    {:.4}", levels.last().map(|l| l.log_x()).unwrap_or(0.0));
    if let Some(best) = sampler.best_log_likelihood() {
        println!("best log L:   {:.6}", best.value());
    }
    Ok(())
}
