//! Collaborator contracts: prior, likelihood, and the tempered target.
//!
//! The engine consumes log densities and i.i.d. prior draws; it never looks
//! inside the model. A likelihood backed by a distributed forward model may
//! coordinate its own sub-group communicator internally — every rank of a
//! sub group calls `ln_likelihood` for the same position in the same order.

use ndarray::{Array1, ArrayView1};
use rand::RngCore;
use temper_core::errors::{TemperError, TemperResult};

/// Log prior density over the parameter space. May return `-∞` outside the
/// support.
pub trait LogPrior {
    /// Dimension of the parameter space.
    fn dim(&self) -> usize;

    fn ln_prior(&self, theta: &ArrayView1<f64>) -> f64;
}

/// I.i.d. sampling from the prior, used for the level-0 cold start.
pub trait PriorSampler {
    fn sample_prior(&self, rng: &mut dyn RngCore) -> Array1<f64>;
}

/// Log likelihood of the observed data at a parameter vector. May return
/// `-∞`; `NaN` is a fatal error at the call site.
pub trait LogLikelihood {
    fn ln_likelihood(&self, theta: &ArrayView1<f64>) -> f64;
}

/// Prior and likelihood values at one position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetValue {
    pub ln_prior: f64,
    pub ln_likelihood: f64,
}

impl TargetValue {
    /// Log density of the tempered target `π(θ) · L(θ)^β`.
    pub fn ln_target(&self, exponent: f64) -> f64 {
        self.ln_prior + exponent * self.ln_likelihood
    }
}

/// A prior/likelihood pair evaluated under a fixed tempering exponent.
pub struct TemperedTarget<'a, P, L> {
    prior: &'a P,
    likelihood: &'a L,
    exponent: f64,
    full_rank: usize,
}

impl<'a, P: LogPrior, L: LogLikelihood> TemperedTarget<'a, P, L> {
    pub fn new(prior: &'a P, likelihood: &'a L, exponent: f64, full_rank: usize) -> Self {
        Self {
            prior,
            likelihood,
            exponent,
            full_rank,
        }
    }

    pub fn exponent(&self) -> f64 {
        self.exponent
    }

    pub fn evaluate(&self, theta: &ArrayView1<f64>) -> TemperResult<TargetValue> {
        let ln_likelihood = self.likelihood.ln_likelihood(theta);
        if ln_likelihood.is_nan() {
            return Err(TemperError::NonFiniteLikelihood {
                rank: self.full_rank,
            });
        }
        Ok(TargetValue {
            ln_prior: self.prior.ln_prior(theta),
            ln_likelihood,
        })
    }
}
