//! Checkpoint serialization for exact restart.
//!
//! The checkpoint is one JSON text artifact holding everything a restart
//! needs to replay the identical trajectory: counters, adaptive state,
//! the particle ensemble, likelihoods, level assignments, the ladder,
//! the staged above-threshold values, and every per-thread RNG state.
//! serde_json renders finite floats with shortest-roundtrip precision, so
//! the restored values are bit-identical; non-finite likelihood values
//! use the string spelling from [`crate::likelihood`].
//!
//! Writes are crash-safe: serialize to `<path>.next`, flush, close, then
//! rename over the live file.

use crate::level::Level;
use crate::likelihood::LogLikelihood;
use crate::options::Options;
use dn_core::{Error, Model, Result, Rng};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// The best particle seen so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BestRecord<M> {
    /// Its likelihood value.
    pub logl: LogLikelihood,
    /// The particle itself.
    pub particle: M,
}

/// Full sampler state for exact restart.
#[derive(Serialize, Deserialize)]
#[serde(bound(serialize = "M: Serialize", deserialize = "M: DeserializeOwned"))]
pub struct Checkpoint<M> {
    /// Options at checkpoint time. Recorded for the log only: a restart
    /// uses the caller's options, which is how a finished run's
    /// `max_num_saves` gets raised.
    pub options: Options,
    /// Saves completed.
    pub count_saves: u32,
    /// Total MCMC steps taken.
    pub count_mcmc_steps: u64,
    /// MCMC steps since the last save.
    pub mcmc_steps_since_save: u64,
    /// Compression deviation measure driving the work ratio.
    pub difficulty: f64,
    /// Current work-rate coefficient.
    pub work_ratio: f64,
    /// Whether outputs were being written.
    pub save_to_disk: bool,
    /// Worker thread count; a restart must match it.
    pub num_threads: usize,
    /// Target compression ratio.
    pub compression: f64,
    /// Effective level cap. Nonzero once the ladder is complete, so
    /// completion survives a restart even under auto detection.
    pub max_num_levels: usize,
    /// The particle ensemble, thread slices concatenated in order.
    pub particles: Vec<M>,
    /// Likelihood value of each particle.
    pub log_likelihoods: Vec<LogLikelihood>,
    /// Level assignment of each particle.
    pub level_assignments: Vec<usize>,
    /// The level ladder.
    pub levels: Vec<Level>,
    /// Staged likelihoods above the top threshold.
    pub all_above: Vec<LogLikelihood>,
    /// Per-thread RNG states.
    pub rngs: Vec<Rng>,
    /// Best-ever record, if any save has happened.
    pub best: Option<BestRecord<M>>,
    /// Lagging-particle replacements so far.
    pub replacements: u64,
}

impl<M: Model> Checkpoint<M> {
    /// Write atomically: serialize to `<path>.next`, then rename.
    pub fn write(&self, path: &Path) -> Result<()> {
        let staging = staging_path(path);
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            serde_json::to_writer(&mut out, self)?;
            out.flush()?;
        }
        std::fs::rename(&staging, path)?;
        Ok(())
    }

    /// Read a checkpoint; failures are fatal for a requested restart.
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Checkpoint(format!("cannot open {}: {e}", path.display())))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Checkpoint(format!("cannot parse {}: {e}", path.display())))
    }
}

/// The temporary path a checkpoint is staged at before the rename.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut staged = path.as_os_str().to_os_string();
    staged.push(".next");
    PathBuf::from(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dn_core::Rng as CoreRng;
    use std::io;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Point {
        x: f64,
        y: f64,
    }

    impl Model for Point {
        fn from_prior(rng: &mut CoreRng) -> Self {
            Self { x: rng.rand(), y: rng.rand() }
        }

        fn perturb(&mut self, rng: &mut CoreRng) -> f64 {
            self.x += rng.randh();
            0.0
        }

        fn log_likelihood(&self) -> f64 {
            -(self.x * self.x + self.y * self.y)
        }

        fn print(&self, out: &mut dyn io::Write) -> io::Result<()> {
            write!(out, "{} {}", self.x, self.y)
        }

        fn description(&self) -> String {
            "x y".to_string()
        }
    }

    fn sample_checkpoint() -> Checkpoint<Point> {
        let mut rng = CoreRng::with_seed(11);
        let particles: Vec<Point> = (0..4).map(|_| Point::from_prior(&mut rng)).collect();
        let log_likelihoods: Vec<LogLikelihood> =
            particles.iter().map(|p| LogLikelihood::new(p.log_likelihood(), rng.rand())).collect();
        let mut levels = vec![Level::floor(), Level::new(LogLikelihood::new(-0.5, 0.3))];
        levels[0].increment_visits(100);
        levels[0].increment_exceeds(37);
        Checkpoint {
            options: Options::default(),
            count_saves: 3,
            count_mcmc_steps: 1200,
            mcmc_steps_since_save: 200,
            difficulty: 0.015,
            work_ratio: 1.0,
            save_to_disk: true,
            num_threads: 2,
            compression: std::f64::consts::E,
            max_num_levels: 0,
            best: Some(BestRecord { logl: log_likelihoods[0], particle: particles[0].clone() }),
            particles,
            log_likelihoods,
            level_assignments: vec![0, 1, 0, 1],
            levels,
            all_above: vec![LogLikelihood::new(-0.2, 0.9)],
            rngs: vec![CoreRng::with_seed(1), CoreRng::with_seed(2)],
            replacements: 5,
        }
    }

    #[test]
    fn test_roundtrip_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let checkpoint = sample_checkpoint();
        checkpoint.write(&path).unwrap();
        let restored = Checkpoint::<Point>::read(&path).unwrap();

        assert_eq!(restored.count_saves, checkpoint.count_saves);
        assert_eq!(restored.count_mcmc_steps, checkpoint.count_mcmc_steps);
        assert_eq!(restored.difficulty, checkpoint.difficulty);
        assert_eq!(restored.particles, checkpoint.particles);
        assert_eq!(restored.log_likelihoods, checkpoint.log_likelihoods);
        assert_eq!(restored.level_assignments, checkpoint.level_assignments);
        assert_eq!(restored.all_above, checkpoint.all_above);
        assert_eq!(restored.rngs, checkpoint.rngs);
        assert_eq!(restored.replacements, checkpoint.replacements);
        assert_eq!(restored.levels.len(), checkpoint.levels.len());
        for (a, b) in restored.levels.iter().zip(&checkpoint.levels) {
            assert_eq!(a.threshold(), b.threshold());
            assert_eq!(a.visits(), b.visits());
            assert_eq!(a.exceeds(), b.exceeds());
        }
    }

    #[test]
    fn test_restored_rng_streams_bit_equal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut checkpoint = sample_checkpoint();
        // Advance the generators so the state is mid-stream.
        for rng in &mut checkpoint.rngs {
            for _ in 0..17 {
                rng.randh();
            }
        }
        checkpoint.write(&path).unwrap();
        let mut restored = Checkpoint::<Point>::read(&path).unwrap();
        for (a, b) in restored.rngs.iter_mut().zip(&mut checkpoint.rngs) {
            for _ in 0..50 {
                assert_eq!(a.rand(), b.rand());
                assert_eq!(a.randn(), b.randn());
            }
        }
    }

    #[test]
    fn test_write_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        sample_checkpoint().write(&path).unwrap();
        assert!(path.exists());
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_read_missing_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let err = Checkpoint::<Point>::read(&missing).err().expect("read must fail");
        assert!(matches!(err, Error::Checkpoint(_)), "unexpected error: {err}");
    }

    #[test]
    fn test_read_garbage_is_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        std::fs::write(&path, "not json at all").unwrap();
        assert!(matches!(Checkpoint::<Point>::read(&path), Err(Error::Checkpoint(_))));
    }
}
