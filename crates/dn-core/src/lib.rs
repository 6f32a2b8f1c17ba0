//! # dn-core
//!
//! Core types, traits, and error handling for diffnest.
//!
//! This crate provides:
//! - Common error types
//! - The model contract every sampleable problem satisfies
//! - A seedable, serializable RNG with the proposal variates the
//!   sampler depends on

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod rng;
pub mod traits;

pub use error::{Error, Result};
pub use rng::Rng;
pub use traits::Model;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
