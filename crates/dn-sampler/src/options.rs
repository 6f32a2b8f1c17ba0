//! Run configuration.

use dn_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for one sampling run.
///
/// The numeric fields mirror the classic `OPTIONS` file in its fixed
/// order; [`Options::from_file`] reads that format. Output paths and the
/// float-rendering switch have no file representation and keep their
/// defaults unless set by the embedding caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Particles per worker thread.
    pub num_particles: usize,
    /// Number of staged likelihoods that triggers a new level.
    pub new_level_interval: usize,
    /// MCMC steps between saves.
    pub save_interval: u64,
    /// MCMC steps each thread runs per lockstep iteration.
    pub thread_steps: u64,
    /// Level cap; `0` enables automatic ladder-completion detection.
    pub max_num_levels: usize,
    /// Backtracking scale length of the level push.
    pub lambda: f64,
    /// Strength of the uniform-exploration term once the ladder is
    /// complete.
    pub beta: f64,
    /// Stop after this many saves; `0` is unbounded.
    pub max_num_saves: u32,
    /// Sample rows (append).
    pub sample_file: PathBuf,
    /// Sample metadata rows (append).
    pub sample_info_file: PathBuf,
    /// Level table (overwritten each save).
    pub levels_file: PathBuf,
    /// Best-ever particle rows (append).
    pub best_particle_file: PathBuf,
    /// Best-ever likelihood records (append).
    pub best_likelihood_file: PathBuf,
    /// Checkpoint artifact for exact restart.
    pub checkpoint_file: PathBuf,
    /// Render output floats as lossless hexadecimal instead of
    /// 16-significant-digit scientific notation.
    pub write_exact_representation: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_particles: 5,
            new_level_interval: 10_000,
            save_interval: 10_000,
            thread_steps: 100,
            max_num_levels: 0,
            lambda: 10.0,
            beta: 100.0,
            max_num_saves: 10_000,
            sample_file: PathBuf::from("sample.txt"),
            sample_info_file: PathBuf::from("sample_info.txt"),
            levels_file: PathBuf::from("levels.txt"),
            best_particle_file: PathBuf::from("best_particle.txt"),
            best_likelihood_file: PathBuf::from("best_likelihood.txt"),
            checkpoint_file: PathBuf::from("checkpoint.json"),
            write_exact_representation: false,
        }
    }
}

impl Options {
    /// Read the eight numeric fields from an `OPTIONS`-format file:
    /// one value per line in declaration order, `#` starting a comment.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_options_text(&text)
    }

    fn from_options_text(text: &str) -> Result<Self> {
        let values: Vec<&str> = text
            .lines()
            .map(|line| line.split('#').next().unwrap_or("").trim())
            .filter(|line| !line.is_empty())
            .collect();
        if values.len() != 8 {
            return Err(Error::Config(format!(
                "expected 8 option values, found {}",
                values.len()
            )));
        }

        fn parse<T: std::str::FromStr>(raw: &str, name: &str) -> Result<T> {
            raw.parse()
                .map_err(|_| Error::Config(format!("invalid value for {name}: {raw:?}")))
        }

        Ok(Self {
            num_particles: parse(values[0], "num_particles")?,
            new_level_interval: parse(values[1], "new_level_interval")?,
            save_interval: parse(values[2], "save_interval")?,
            thread_steps: parse(values[3], "thread_steps")?,
            max_num_levels: parse(values[4], "max_num_levels")?,
            lambda: parse(values[5], "lambda")?,
            beta: parse(values[6], "beta")?,
            max_num_saves: parse(values[7], "max_num_saves")?,
            ..Self::default()
        })
    }

    /// Check the option set against the run's compression ratio.
    pub fn validate(&self, compression: f64) -> Result<()> {
        if self.num_particles == 0 {
            return Err(Error::Config("num_particles must be at least 1".into()));
        }
        if self.new_level_interval == 0 {
            return Err(Error::Config("new_level_interval must be at least 1".into()));
        }
        if self.save_interval == 0 {
            return Err(Error::Config("save_interval must be at least 1".into()));
        }
        if self.thread_steps == 0 {
            return Err(Error::Config("thread_steps must be at least 1".into()));
        }
        if !(self.lambda > 0.0) {
            return Err(Error::Config("lambda must be positive".into()));
        }
        if !(self.beta >= 0.0) {
            return Err(Error::Config("beta must be non-negative".into()));
        }
        if !(compression > 1.0) {
            return Err(Error::Config("compression must exceed 1".into()));
        }
        // Automatic ladder completion measures gaps in units of e-folds;
        // any other compression requires a fixed level count.
        if self.max_num_levels == 0 && (compression - std::f64::consts::E).abs() > 1e-6 {
            return Err(Error::Config(
                "a compression other than e requires a fixed max_num_levels".into(),
            ));
        }
        Ok(())
    }
}
