//! Multi-level tempered sampling for Bayesian calibration.
//!
//! Given a prior over a parameter vector and a log-likelihood evaluated
//! against observed data, the engine produces weighted samples from the
//! posterior together with an estimate of the log model evidence. The
//! posterior is approached through a sequence of tempered distributions
//! `π(θ) · L(θ)^β` with exponents chosen adaptively from the effective
//! sample size of the importance weights between consecutive levels; each
//! level resamples seeds across the cluster and regrows the chain with an
//! adaptively scaled Metropolis–Hastings proposal.

pub mod calibrate;
pub mod distributions;
pub mod driver;
pub mod metropolis;
pub mod options;
pub mod planner;
mod seeding;
pub mod target;

pub use calibrate::{CalibrationProblem, PosteriorSolution};
pub use driver::{MultilevelSampler, SamplingOutput};
pub use options::{LevelOptions, SamplerOptions};
pub use target::{LogLikelihood, LogPrior, PriorSampler};

pub use temper_core::errors::{TemperError, TemperResult};
pub use temper_core::transport::{LocalCluster, ProcessTopology};
