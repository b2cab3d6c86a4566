//! Adaptive Metropolis–Hastings chain generator.
//!
//! Produces a short chain from a seed position under a Gaussian random-walk
//! proposal. Two optional refinements, both switched per call through the
//! options value:
//!
//! - **Delayed rejection**: after a rejected proposal, up to K further
//!   proposals with progressively shrunken covariances; acceptance uses the
//!   recursive multi-stage probability that preserves detailed balance.
//! - **Adaptive covariance**: after an initial non-adaptive stretch, the
//!   proposal covariance is periodically replaced by the regularized
//!   empirical covariance of the chain generated so far.
//!
//! Pilot chains (used only to estimate rejection rates) pass a derived
//! options value with both refinements off.

use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use tracing::warn;

use temper_core::errors::{TemperError, TemperResult};
use temper_core::linear_algebra::{
    cholesky_lower, ln_gaussian_from_factor, lower_times_vec, scale_lower_in_place,
};

use crate::options::LevelOptions;
use crate::target::{LogLikelihood, LogPrior, TargetValue, TemperedTarget};

/// Gaussian random-walk proposal held as a cached Cholesky factor.
#[derive(Debug, Clone)]
pub struct GaussianProposal {
    chol: Array2<f64>,
}

impl GaussianProposal {
    pub fn from_covariance(
        covariance: &Array2<f64>,
        full_rank: usize,
        context: &str,
    ) -> TemperResult<Self> {
        match cholesky_lower(covariance) {
            Some(chol) => Ok(Self { chol }),
            None => Err(TemperError::NotPositiveDefinite {
                rank: full_rank,
                context: context.to_string(),
            }),
        }
    }

    pub fn dim(&self) -> usize {
        self.chol.nrows()
    }

    /// Proposal with covariance `η · Σ`, produced by scaling the cached
    /// factor by `√η` instead of refactoring.
    pub fn scaled(&self, eta: f64) -> Self {
        let mut chol = self.chol.clone();
        scale_lower_in_place(&mut chol, eta.sqrt());
        Self { chol }
    }

    /// Proposal with covariance `Σ / divisor²`, for delayed-rejection
    /// stages.
    fn shrunk(&self, divisor: f64) -> Self {
        let mut chol = self.chol.clone();
        scale_lower_in_place(&mut chol, 1.0 / divisor);
        Self { chol }
    }

    pub fn draw(&self, center: &ArrayView1<f64>, rng: &mut ChaCha8Rng) -> Array1<f64> {
        let z = Array1::from_iter((0..self.dim()).map(|_| rng.sample::<f64, _>(StandardNormal)));
        center + &lower_times_vec(&self.chol, &z.view())
    }

    fn ln_density(&self, x: &ArrayView1<f64>, center: &ArrayView1<f64>) -> f64 {
        ln_gaussian_from_factor(x, center, &self.chol)
    }
}

/// Chain produced by one `generate_sequence` call, with its parallel scalar
/// sequences and the number of rejected transitions.
#[derive(Debug, Clone)]
pub struct GeneratedChain {
    pub positions: Vec<Array1<f64>>,
    pub ln_likelihoods: Vec<f64>,
    pub ln_targets: Vec<f64>,
    pub rejections: u64,
}

/// Streaming mean and scatter of the chain, for covariance adaptation.
struct RunningMoments {
    count: usize,
    mean: Array1<f64>,
    scatter: Array2<f64>,
}

impl RunningMoments {
    fn new(dim: usize) -> Self {
        Self {
            count: 0,
            mean: Array1::zeros(dim),
            scatter: Array2::zeros((dim, dim)),
        }
    }

    fn update(&mut self, x: &ArrayView1<f64>) {
        self.count += 1;
        let delta = x - &self.mean;
        self.mean.scaled_add(1.0 / self.count as f64, &delta);
        let delta2 = x - &self.mean;
        let n = delta.len();
        for i in 0..n {
            for j in 0..n {
                self.scatter[[i, j]] += delta[i] * delta2[j];
            }
        }
    }

    fn covariance(&self) -> Option<Array2<f64>> {
        if self.count < 2 {
            return None;
        }
        Some(&self.scatter / (self.count - 1) as f64)
    }
}

fn accept_probability(ln_new: f64, ln_old: f64) -> f64 {
    if ln_new == f64::NEG_INFINITY {
        return 0.0;
    }
    if ln_old == f64::NEG_INFINITY {
        return 1.0;
    }
    (ln_new - ln_old).exp().min(1.0)
}

#[derive(Clone)]
struct DrPoint {
    position: Array1<f64>,
    ln_target: f64,
}

/// Multi-stage delayed-rejection acceptance probability.
///
/// `trajectory[0]` is the current position, `trajectory[1..]` the candidates
/// proposed so far; `stage_proposals[i]` is the proposal that generated
/// candidate `i + 1`. Evaluated recursively in the log domain.
fn dr_alpha(trajectory: &[DrPoint], stage_proposals: &[GaussianProposal]) -> f64 {
    let k = trajectory.len() - 1;
    if k == 1 {
        return accept_probability(trajectory[1].ln_target, trajectory[0].ln_target);
    }
    if trajectory[k].ln_target == f64::NEG_INFINITY {
        return 0.0;
    }
    let mut ln_num = trajectory[k].ln_target;
    let mut ln_den = trajectory[0].ln_target;
    for i in 1..k {
        let q = &stage_proposals[i - 1];
        ln_num += q.ln_density(
            &trajectory[k - i].position.view(),
            &trajectory[k].position.view(),
        );
        ln_den += q.ln_density(
            &trajectory[i].position.view(),
            &trajectory[0].position.view(),
        );
        let reversed: Vec<DrPoint> = (0..=i).map(|j| trajectory[k - j].clone()).collect();
        let alpha_num = dr_alpha(&reversed, stage_proposals);
        let alpha_den = dr_alpha(&trajectory[..=i], stage_proposals);
        if alpha_den >= 1.0 {
            return 1.0;
        }
        if alpha_num >= 1.0 {
            return 0.0;
        }
        ln_num += (1.0 - alpha_num).ln();
        ln_den += (1.0 - alpha_den).ln();
    }
    (ln_num - ln_den).exp().min(1.0)
}

/// Ladder of per-stage proposals: index 0 is the main proposal, index `s`
/// the stage-`s` delayed-rejection proposal.
fn build_ladder(base: &GaussianProposal, options: &LevelOptions) -> Vec<GaussianProposal> {
    let mut ladder = vec![base.clone()];
    for stage in 0..options.dr_max_num_extra_stages {
        let scale = options
            .dr_stage_scales
            .get(stage)
            .or(options.dr_stage_scales.last())
            .copied()
            .unwrap_or(1.0);
        ladder.push(base.shrunk(scale));
    }
    ladder
}

/// Generates `num_positions` chain positions from `seed_position`.
///
/// Every emitted position is the outcome of one accept/reject decision
/// (the seed is the starting state and is not emitted), so a chain of
/// length `n` makes exactly `n` proposals and `rejections ≤ n`.
pub fn generate_sequence<P: LogPrior, L: LogLikelihood>(
    seed_position: &ArrayView1<f64>,
    num_positions: usize,
    proposal: &GaussianProposal,
    target: &TemperedTarget<'_, P, L>,
    options: &LevelOptions,
    rng: &mut ChaCha8Rng,
) -> TemperResult<GeneratedChain> {
    let dim = seed_position.len();
    let exponent = target.exponent();

    let mut positions = Vec::with_capacity(num_positions);
    let mut ln_likelihoods = Vec::with_capacity(num_positions);
    let mut ln_targets = Vec::with_capacity(num_positions);
    let mut rejections = 0u64;

    let mut current = seed_position.to_owned();
    let mut current_value = target.evaluate(&current.view())?;

    let mut moments = RunningMoments::new(dim);
    moments.update(&current.view());

    let mut ladder = build_ladder(proposal, options);

    while positions.len() < num_positions {
        let accepted = advance(
            &mut current,
            &mut current_value,
            &ladder,
            target,
            options,
            rng,
        )?;
        if !accepted {
            rejections += 1;
        }
        record(
            &mut positions,
            &mut ln_likelihoods,
            &mut ln_targets,
            &current,
            &current_value,
            exponent,
        );
        moments.update(&current.view());

        let emitted = positions.len();
        if options.am_adapt_interval > 0
            && emitted >= options.am_init_non_adapt_interval
            && (emitted - options.am_init_non_adapt_interval) % options.am_adapt_interval == 0
        {
            adapt_proposal(&mut ladder, &moments, options);
        }
    }

    Ok(GeneratedChain {
        positions,
        ln_likelihoods,
        ln_targets,
        rejections,
    })
}

fn record(
    positions: &mut Vec<Array1<f64>>,
    ln_likelihoods: &mut Vec<f64>,
    ln_targets: &mut Vec<f64>,
    position: &Array1<f64>,
    value: &TargetValue,
    exponent: f64,
) {
    positions.push(position.clone());
    ln_likelihoods.push(value.ln_likelihood);
    ln_targets.push(value.ln_target(exponent));
}

/// One transition: plain Metropolis plus optional delayed-rejection
/// stages. Returns whether a candidate was accepted.
fn advance<P: LogPrior, L: LogLikelihood>(
    current: &mut Array1<f64>,
    current_value: &mut TargetValue,
    ladder: &[GaussianProposal],
    target: &TemperedTarget<'_, P, L>,
    options: &LevelOptions,
    rng: &mut ChaCha8Rng,
) -> TemperResult<bool> {
    let exponent = target.exponent();
    let mut trajectory = vec![DrPoint {
        position: current.clone(),
        ln_target: current_value.ln_target(exponent),
    }];

    let max_stages = 1 + options.dr_max_num_extra_stages;
    for stage in 0..max_stages {
        let candidate = ladder[stage].draw(&current.view(), rng);
        let value = target.evaluate(&candidate.view())?;
        trajectory.push(DrPoint {
            position: candidate.clone(),
            ln_target: value.ln_target(exponent),
        });

        let alpha = dr_alpha(&trajectory, ladder);
        if rng.gen::<f64>() < alpha {
            *current = candidate;
            *current_value = value;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Replaces the ladder with one built from the chain's regularized
/// empirical covariance. A factorization failure is a recoverable numeric
/// degeneracy: the previous proposal stays in effect.
fn adapt_proposal(
    ladder: &mut Vec<GaussianProposal>,
    moments: &RunningMoments,
    options: &LevelOptions,
) {
    let Some(mut covariance) = moments.covariance() else {
        return;
    };
    for i in 0..covariance.nrows() {
        covariance[[i, i]] += options.am_epsilon;
    }
    match cholesky_lower(&covariance) {
        Some(chol) => {
            *ladder = build_ladder(&GaussianProposal { chol }, options);
        }
        None => {
            warn!("adapted covariance is not positive definite; keeping previous proposal");
        }
    }
}
