//! End-to-end run on a conjugate Gaussian problem.
//!
//! Prior `N(0, I₂)`, likelihood `N((1,1) | θ, 0.25·I₂)`. The posterior is
//! analytic: mean `0.8·(1,1)`, covariance `0.2·I₂`, and the model evidence
//! is `N((1,1); 0, 1.25·I₂)`.

use is_close::is_close;
use ndarray::array;
use temper_calibrate::distributions::{GaussianMeanLikelihood, IndependentGaussian};
use temper_calibrate::{LevelOptions, MultilevelSampler, ProcessTopology, SamplerOptions};
use temper_core::output::NullSink;

fn options(seed: u64) -> SamplerOptions {
    let mut defaults = LevelOptions::default();
    defaults.raw_chain_size = 4096;
    defaults.min_effective_size_ratio = 0.5;
    defaults.max_effective_size_ratio = 0.9;
    defaults.min_rejection_rate = 0.25;
    defaults.max_rejection_rate = 0.45;
    defaults.totally_mute = true;
    SamplerOptions::with_defaults(seed, defaults)
}

fn analytic_log_evidence() -> f64 {
    // ∫ N(θ; 0, I) N(y; θ, σ²I) dθ = N(y; 0, (1 + σ²) I) at y = (1, 1),
    // σ² = 0.25.
    let var: f64 = 1.25;
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    2.0 * (-0.5 * (ln_2pi + var.ln()) - 1.0 / (2.0 * var))
}

#[test]
fn posterior_matches_the_conjugate_solution() {
    let topology = ProcessTopology::single();
    let prior = IndependentGaussian::standard(2);
    let likelihood = GaussianMeanLikelihood::new(array![1.0, 1.0], 0.5);
    let sampler = MultilevelSampler::new(&topology, &prior, &likelihood, options(42));
    let output = sampler.generate(&mut NullSink).unwrap();

    assert!(
        (2..=6).contains(&output.levels),
        "expected a handful of levels, got {}",
        output.levels
    );
    assert_eq!(*output.exponents.last().unwrap(), 1.0);

    let n = output.chain.len() as f64;
    let mut mean = array![0.0, 0.0];
    for p in output.chain.positions() {
        mean += p;
    }
    mean /= n;
    assert!(is_close!(mean[0], 0.8, abs_tol = 0.05), "mean_x = {}", mean[0]);
    assert!(is_close!(mean[1], 0.8, abs_tol = 0.05), "mean_y = {}", mean[1]);

    let mut cov = [[0.0f64; 2]; 2];
    for p in output.chain.positions() {
        let dx = p[0] - mean[0];
        let dy = p[1] - mean[1];
        cov[0][0] += dx * dx;
        cov[0][1] += dx * dy;
        cov[1][0] += dy * dx;
        cov[1][1] += dy * dy;
    }
    let frobenius = {
        let mut acc = 0.0;
        for i in 0..2 {
            for j in 0..2 {
                let expected = if i == j { 0.2 } else { 0.0 };
                let diff = cov[i][j] / (n - 1.0) - expected;
                acc += diff * diff;
            }
        }
        acc.sqrt()
    };
    assert!(frobenius < 0.05, "covariance Frobenius error {frobenius}");

    let ln_z_err = (output.log_evidence - analytic_log_evidence()).abs();
    assert!(ln_z_err < 0.15, "log evidence error {ln_z_err}");
}

#[test]
fn evidence_factors_sum_to_the_estimate() {
    let topology = ProcessTopology::single();
    let prior = IndependentGaussian::standard(2);
    let likelihood = GaussianMeanLikelihood::new(array![1.0, 1.0], 0.5);
    let sampler = MultilevelSampler::new(&topology, &prior, &likelihood, options(7));
    let output = sampler.generate(&mut NullSink).unwrap();
    let sum: f64 = output.log_evidence_factors.iter().sum();
    assert_eq!(sum, output.log_evidence);
    assert_eq!(output.log_evidence_factors.len(), output.levels as usize);
}

#[test]
fn delayed_rejection_and_adaptation_still_recover_the_posterior() {
    let topology = ProcessTopology::single();
    let prior = IndependentGaussian::standard(2);
    let likelihood = GaussianMeanLikelihood::new(array![1.0, 1.0], 0.5);
    let mut opts = options(99);
    opts.defaults.dr_max_num_extra_stages = 1;
    opts.defaults.am_adapt_interval = 100;
    opts.defaults.am_init_non_adapt_interval = 200;
    let sampler = MultilevelSampler::new(&topology, &prior, &likelihood, opts);
    let output = sampler.generate(&mut NullSink).unwrap();
    let n = output.chain.len() as f64;
    let mut mean = array![0.0, 0.0];
    for p in output.chain.positions() {
        mean += p;
    }
    mean /= n;
    assert!(is_close!(mean[0], 0.8, abs_tol = 0.08), "mean_x = {}", mean[0]);
    assert!(is_close!(mean[1], 0.8, abs_tol = 0.08), "mean_y = {}", mean[1]);
}
