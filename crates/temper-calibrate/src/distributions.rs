//! Standard priors and likelihoods for calibration problems and tests.

use ndarray::{Array1, ArrayView1};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;

use crate::target::{LogLikelihood, LogPrior, PriorSampler};

/// Independent Gaussian prior, one (mean, std) pair per coordinate.
#[derive(Debug, Clone)]
pub struct IndependentGaussian {
    mean: Array1<f64>,
    std_dev: Array1<f64>,
}

impl IndependentGaussian {
    /// # Panics
    ///
    /// Panics when the mean and standard deviation lengths differ or a
    /// standard deviation is not positive.
    pub fn new(mean: Array1<f64>, std_dev: Array1<f64>) -> Self {
        assert_eq!(mean.len(), std_dev.len(), "mean/std length mismatch");
        assert!(
            std_dev.iter().all(|s| *s > 0.0),
            "standard deviations must be positive"
        );
        Self { mean, std_dev }
    }

    /// Standard normal prior of dimension `dim`.
    pub fn standard(dim: usize) -> Self {
        Self::new(Array1::zeros(dim), Array1::ones(dim))
    }
}

impl LogPrior for IndependentGaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn ln_prior(&self, theta: &ArrayView1<f64>) -> f64 {
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        theta
            .iter()
            .zip(self.mean.iter().zip(self.std_dev.iter()))
            .map(|(x, (m, s))| {
                let z = (x - m) / s;
                -0.5 * (ln_2pi + z * z) - s.ln()
            })
            .sum()
    }
}

impl PriorSampler for IndependentGaussian {
    fn sample_prior(&self, rng: &mut dyn RngCore) -> Array1<f64> {
        Array1::from_iter(self.mean.iter().zip(self.std_dev.iter()).map(|(m, s)| {
            let z: f64 = rng.sample(StandardNormal);
            m + s * z
        }))
    }
}

/// Uniform prior over an axis-aligned box.
#[derive(Debug, Clone)]
pub struct UniformBox {
    lower: Array1<f64>,
    upper: Array1<f64>,
    ln_density: f64,
}

impl UniformBox {
    /// # Panics
    ///
    /// Panics when the bound lengths differ or any lower bound is not
    /// strictly below its upper bound.
    pub fn new(lower: Array1<f64>, upper: Array1<f64>) -> Self {
        assert_eq!(lower.len(), upper.len(), "bound length mismatch");
        assert!(
            lower.iter().zip(upper.iter()).all(|(a, b)| a < b),
            "lower bounds must be strictly below upper bounds"
        );
        let ln_volume: f64 = lower
            .iter()
            .zip(upper.iter())
            .map(|(a, b)| (b - a).ln())
            .sum();
        Self {
            lower,
            upper,
            ln_density: -ln_volume,
        }
    }
}

impl LogPrior for UniformBox {
    fn dim(&self) -> usize {
        self.lower.len()
    }

    fn ln_prior(&self, theta: &ArrayView1<f64>) -> f64 {
        let inside = theta
            .iter()
            .zip(self.lower.iter().zip(self.upper.iter()))
            .all(|(x, (a, b))| x >= a && x <= b);
        if inside {
            self.ln_density
        } else {
            f64::NEG_INFINITY
        }
    }
}

impl PriorSampler for UniformBox {
    fn sample_prior(&self, rng: &mut dyn RngCore) -> Array1<f64> {
        Array1::from_iter(
            self.lower
                .iter()
                .zip(self.upper.iter())
                .map(|(a, b)| rng.gen_range(*a..*b)),
        )
    }
}

/// Gaussian likelihood of a single observation vector with isotropic noise:
/// `ln N(y | θ, σ²·I)`.
#[derive(Debug, Clone)]
pub struct GaussianMeanLikelihood {
    observation: Array1<f64>,
    noise_std: f64,
}

impl GaussianMeanLikelihood {
    /// # Panics
    ///
    /// Panics when the noise standard deviation is not positive.
    pub fn new(observation: Array1<f64>, noise_std: f64) -> Self {
        assert!(noise_std > 0.0, "noise standard deviation must be positive");
        Self {
            observation,
            noise_std,
        }
    }
}

impl LogLikelihood for GaussianMeanLikelihood {
    fn ln_likelihood(&self, theta: &ArrayView1<f64>) -> f64 {
        let d = self.observation.len() as f64;
        let ln_2pi = (2.0 * std::f64::consts::PI).ln();
        let ssq: f64 = self
            .observation
            .iter()
            .zip(theta.iter())
            .map(|(y, t)| (y - t) * (y - t))
            .sum();
        -0.5 * d * ln_2pi - d * self.noise_std.ln() - 0.5 * ssq / (self.noise_std * self.noise_std)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use is_close::is_close;
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn standard_gaussian_density_at_origin() {
        let prior = IndependentGaussian::standard(2);
        let ln_p = prior.ln_prior(&array![0.0, 0.0].view());
        assert!(is_close!(ln_p, -(2.0 * std::f64::consts::PI).ln()));
    }

    #[test]
    fn gaussian_samples_track_mean_and_spread() {
        let prior = IndependentGaussian::new(array![1.0, -2.0], array![0.5, 2.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let n = 20_000;
        let mut sum = array![0.0, 0.0];
        for _ in 0..n {
            sum += &prior.sample_prior(&mut rng);
        }
        let mean = sum / n as f64;
        assert!(is_close!(mean[0], 1.0, abs_tol = 0.02));
        assert!(is_close!(mean[1], -2.0, abs_tol = 0.06));
    }

    #[test]
    fn uniform_box_density_and_support() {
        let prior = UniformBox::new(array![-5.0, -5.0], array![5.0, 5.0]);
        assert!(is_close!(
            prior.ln_prior(&array![0.0, 0.0].view()),
            -(100.0f64).ln()
        ));
        assert_eq!(
            prior.ln_prior(&array![6.0, 0.0].view()),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn uniform_samples_stay_inside_the_box() {
        let prior = UniformBox::new(array![-1.0, 2.0], array![1.0, 3.0]);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for _ in 0..1000 {
            let x = prior.sample_prior(&mut rng);
            assert!(prior.ln_prior(&x.view()).is_finite());
        }
    }

    #[test]
    fn gaussian_likelihood_peaks_at_observation() {
        let lik = GaussianMeanLikelihood::new(array![1.0, 1.0], 0.5);
        let at_obs = lik.ln_likelihood(&array![1.0, 1.0].view());
        let off = lik.ln_likelihood(&array![0.0, 0.0].view());
        assert!(at_obs > off);
        // ln N(y|y, σ²I) = -d/2·ln(2π) - d·ln σ
        let expected = -(2.0 * std::f64::consts::PI).ln() - 2.0 * (0.5f64).ln();
        assert!(is_close!(at_obs, expected));
    }
}
