//! Totally ordered likelihood values.
//!
//! A likelihood value is a pair `(value, tiebreaker)` compared
//! lexicographically. The tiebreaker lives in `[0, 1)` and is the only
//! mechanism that orders states in flat-likelihood regions; in
//! particular every particle starts above the ladder's floor level, whose
//! threshold is `(-inf, 0)`.

use dn_core::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A log-likelihood with a tiebreaker in `[0, 1)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LogLikelihood {
    #[serde(with = "f64_text")]
    value: f64,
    tiebreaker: f64,
}

impl LogLikelihood {
    /// Create a likelihood value.
    pub fn new(value: f64, tiebreaker: f64) -> Self {
        Self { value, tiebreaker }
    }

    /// The floor value `(-inf, 0)`, below every reachable state.
    pub fn floor() -> Self {
        Self { value: f64::NEG_INFINITY, tiebreaker: 0.0 }
    }

    /// Raw log-likelihood.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Tiebreaker in `[0, 1)`.
    pub fn tiebreaker(&self) -> f64 {
        self.tiebreaker
    }

    /// Move the tiebreaker by a heavy-tailed step, reflected back into
    /// `[0, 1)`. The value itself never changes here.
    pub fn perturb_tiebreaker(&mut self, rng: &mut Rng) {
        self.tiebreaker = reflect_unit(self.tiebreaker + rng.randh());
    }
}

impl PartialEq for LogLikelihood {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LogLikelihood {}

impl PartialOrd for LogLikelihood {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogLikelihood {
    fn cmp(&self, other: &Self) -> Ordering {
        // NaN is excluded by the model contract; total_cmp keeps the
        // order total anyway.
        self.value
            .total_cmp(&other.value)
            .then_with(|| self.tiebreaker.total_cmp(&other.tiebreaker))
    }
}

/// Fold `t` into `[0, 1)` by reflection at both ends.
fn reflect_unit(t: f64) -> f64 {
    let r = t.rem_euclid(2.0);
    if r < 1.0 { r } else { (2.0 - r).clamp(0.0, 1.0 - f64::EPSILON) }
}

/// Serde representation for log-likelihood values.
///
/// JSON has no literal for non-finite floats, but the ladder floor is
/// `-inf` and flat models can keep it around forever, so checkpoints spell
/// non-finite values as strings and finite ones as plain numbers (which
/// serde_json round-trips losslessly).
mod f64_text {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            s.serialize_f64(*v)
        } else if v.is_nan() {
            s.serialize_str("nan")
        } else if *v > 0.0 {
            s.serialize_str("inf")
        } else {
            s.serialize_str("-inf")
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        struct F64Visitor;

        impl Visitor<'_> for F64Visitor {
            type Value = f64;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a float or one of \"inf\", \"-inf\", \"nan\"")
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<f64, E> {
                Ok(v)
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<f64, E> {
                Ok(v as f64)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<f64, E> {
                match v {
                    "inf" => Ok(f64::INFINITY),
                    "-inf" => Ok(f64::NEG_INFINITY),
                    "nan" => Ok(f64::NAN),
                    other => Err(de::Error::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        d.deserialize_any(F64Visitor)
    }
}
