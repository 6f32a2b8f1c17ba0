//! # dn-sampler
//!
//! Diffusive nested sampling engine.
//!
//! The engine explores a user-defined probability model (the [`Model`]
//! contract from `dn-core`) by building an adaptive ladder of nested
//! likelihood thresholds and running a fixed ensemble of particles across
//! them with barrier-synchronized worker threads. It produces the raw
//! artifacts (sample rows, level table, checkpoints) that downstream
//! posterior-weighting consumes; it does not itself estimate evidence.
//!
//! ## Architecture
//!
//! One module per concern: [`likelihood`] and [`level`] are the ladder
//! primitives, [`options`] the run configuration, [`barrier`] the N-party
//! rendezvous bounding the three phases of each iteration, [`output`] the
//! text artifact emission, [`checkpoint`] exact-restart serialization, and
//! [`sampler`] the parallel driver tying them together.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::needless_range_loop)]

/// Reusable N-party barrier for lockstep worker phases.
pub mod barrier;
/// Checkpoint serialization for exact restart.
pub mod checkpoint;
/// Likelihood threshold levels and their mass bookkeeping.
pub mod level;
/// Totally ordered likelihood values with tiebreakers.
pub mod likelihood;
/// Run configuration.
pub mod options;
/// Output file emission and float rendering.
pub mod output;
/// The parallel sampling driver.
pub mod sampler;

pub use dn_core::{Error, Model, Result, Rng};
pub use level::Level;
pub use likelihood::LogLikelihood;
pub use options::Options;
pub use sampler::Sampler;
