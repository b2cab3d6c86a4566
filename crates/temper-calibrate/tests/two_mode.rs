//! Bimodal target under a uniform prior: the chain must populate both
//! modes and every level's η search must settle.

use ndarray::{array, Array1, ArrayView1};
use temper_calibrate::distributions::UniformBox;
use temper_calibrate::target::LogLikelihood;
use temper_calibrate::{LevelOptions, MultilevelSampler, ProcessTopology, SamplerOptions};
use temper_core::output::NullSink;

struct TwoModeLikelihood;

impl LogLikelihood for TwoModeLikelihood {
    fn ln_likelihood(&self, theta: &ArrayView1<f64>) -> f64 {
        let r0: f64 = theta.iter().map(|x| x * x).sum();
        let r1: f64 = theta
            .iter()
            .zip([3.0, 3.0])
            .map(|(x, m)| (x - m) * (x - m))
            .sum();
        ((-0.5 * r0).exp() + (-0.5 * r1).exp()).ln()
    }
}

#[test]
fn both_modes_are_visited() {
    let topology = ProcessTopology::single();
    let prior = UniformBox::new(array![-5.0, -5.0], array![5.0, 5.0]);
    let likelihood = TwoModeLikelihood;

    let mut defaults = LevelOptions::default();
    defaults.raw_chain_size = 8192;
    defaults.min_effective_size_ratio = 0.5;
    defaults.max_effective_size_ratio = 0.9;
    defaults.min_rejection_rate = 0.25;
    defaults.max_rejection_rate = 0.45;
    defaults.totally_mute = true;
    let options = SamplerOptions::with_defaults(1234, defaults);

    let sampler = MultilevelSampler::new(&topology, &prior, &likelihood, options);
    let output = sampler.generate(&mut NullSink).unwrap();

    assert_eq!(*output.exponents.last().unwrap(), 1.0);
    for pair in output.exponents.windows(2) {
        assert!(pair[1] > pair[0]);
    }

    let near = |p: &Array1<f64>, cx: f64, cy: f64| {
        let dx = p[0] - cx;
        let dy = p[1] - cy;
        (dx * dx + dy * dy).sqrt() < 1.5
    };
    let near_origin = output
        .chain
        .positions()
        .iter()
        .filter(|p| near(p, 0.0, 0.0))
        .count();
    let near_shifted = output
        .chain
        .positions()
        .iter()
        .filter(|p| near(p, 3.0, 3.0))
        .count();
    assert!(near_origin > 0, "no samples near the origin mode");
    assert!(near_shifted > 0, "no samples near the shifted mode");

    // The modes are symmetric, so neither should swallow the whole chain.
    let total = output.chain.len();
    assert!(near_origin + near_shifted > total / 2);
    let share = near_origin as f64 / (near_origin + near_shifted) as f64;
    assert!(
        (0.15..=0.85).contains(&share),
        "mode occupancy is badly skewed: {share}"
    );
}
