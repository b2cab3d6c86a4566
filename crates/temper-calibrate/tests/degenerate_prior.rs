//! A prior that collapses to a single point produces a singular weighted
//! covariance; the driver must fail with a rank-identified factorization
//! error instead of looping or crashing.

use ndarray::{array, Array1, ArrayView1};
use rand::RngCore;
use temper_calibrate::target::{LogLikelihood, LogPrior, PriorSampler};
use temper_calibrate::{
    LevelOptions, MultilevelSampler, ProcessTopology, SamplerOptions, TemperError,
};
use temper_core::output::NullSink;

struct PointPrior;

impl LogPrior for PointPrior {
    fn dim(&self) -> usize {
        2
    }

    fn ln_prior(&self, _theta: &ArrayView1<f64>) -> f64 {
        0.0
    }
}

impl PriorSampler for PointPrior {
    fn sample_prior(&self, _rng: &mut dyn RngCore) -> Array1<f64> {
        array![1.0, -1.0]
    }
}

struct AnyLikelihood;

impl LogLikelihood for AnyLikelihood {
    fn ln_likelihood(&self, theta: &ArrayView1<f64>) -> f64 {
        -theta.dot(theta)
    }
}

#[test]
fn collapsed_prior_surfaces_a_factorization_error() {
    let topology = ProcessTopology::single();
    let mut defaults = LevelOptions::default();
    defaults.raw_chain_size = 128;
    defaults.totally_mute = true;
    let options = SamplerOptions::with_defaults(3, defaults);
    let sampler = MultilevelSampler::new(&topology, &PointPrior, &AnyLikelihood, options);

    match sampler.generate(&mut NullSink) {
        Err(TemperError::NotPositiveDefinite { rank, context }) => {
            assert_eq!(rank, 0);
            assert!(context.contains("covariance"), "context: {context}");
        }
        other => panic!("expected a factorization failure, got {other:?}"),
    }
}
