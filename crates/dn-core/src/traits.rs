//! Core traits for diffnest
//!
//! This module defines the contract between the sampling engine and a
//! user-supplied probability model. The engine is generic over the model
//! type, so monomorphization keeps the MCMC inner loop free of virtual
//! dispatch.

use crate::rng::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;

/// A sampleable probability model.
///
/// The serde bounds carry the model's full state through checkpoints; a
/// restored run must replay the identical trajectory, so `Serialize`
/// must capture everything `perturb` can touch.
pub trait Model: Clone + Send + Serialize + DeserializeOwned {
    /// Draw an initial state from the prior.
    fn from_prior(rng: &mut Rng) -> Self;

    /// Propose an in-place move. Returns the log Hastings ratio
    /// adjustment (typically ≤ 0).
    ///
    /// The engine perturbs a clone and commits it on acceptance, so a
    /// rejected proposal reverts by simply dropping the clone.
    fn perturb(&mut self, rng: &mut Rng) -> f64;

    /// Log-likelihood of the current state.
    fn log_likelihood(&self) -> f64;

    /// Write the sampleable state as one human-readable output row.
    fn print(&self, out: &mut dyn io::Write) -> io::Result<()>;

    /// Column header matching [`Model::print`].
    fn description(&self) -> String;
}
