//! Calibration problem: prior + likelihood + driver, wired together.
//!
//! A thin convenience layer for the common case of one prior, one
//! likelihood, and one multi-level run. Output files go wherever the
//! default level options point; the `"."` sentinel keeps everything in
//! memory.

use ndarray::{Array1, Array2};

use temper_core::errors::TemperResult;
use temper_core::output::{FileSink, NullSink, ResultSink, NO_OUTPUT_FILE};
use temper_core::sequences::{ScalarSequence, VectorSequence};
use temper_core::transport::ProcessTopology;

use crate::driver::MultilevelSampler;
use crate::options::SamplerOptions;
use crate::target::{LogLikelihood, LogPrior, PriorSampler};

/// Posterior sample and evidence estimate from a completed run.
#[derive(Debug, Clone)]
pub struct PosteriorSolution {
    pub chain: VectorSequence,
    pub ln_likelihoods: ScalarSequence,
    pub log_evidence: f64,
    pub exponents: Vec<f64>,
    pub levels: u32,
}

impl PosteriorSolution {
    /// Posterior mean of the local chain partition.
    pub fn posterior_mean(&self) -> Option<Array1<f64>> {
        self.chain.mean()
    }

    /// Sample covariance of the local chain partition.
    pub fn posterior_covariance(&self) -> Option<Array2<f64>> {
        let mean = self.chain.mean()?;
        let n = self.chain.len();
        if n < 2 {
            return None;
        }
        let dim = mean.len();
        let mut cov = Array2::<f64>::zeros((dim, dim));
        for position in self.chain.positions() {
            let diff = position - &mean;
            for i in 0..dim {
                for j in 0..dim {
                    cov[[i, j]] += diff[i] * diff[j];
                }
            }
        }
        Some(cov / (n - 1) as f64)
    }
}

/// Bayesian calibration of a forward model: solves for the posterior of
/// `θ` under `π(θ) · L(θ)` with the multi-level driver.
pub struct CalibrationProblem<'a, P, L> {
    topology: &'a ProcessTopology,
    prior: &'a P,
    likelihood: &'a L,
    options: SamplerOptions,
}

impl<'a, P, L> CalibrationProblem<'a, P, L>
where
    P: LogPrior + PriorSampler + Sync,
    L: LogLikelihood + Sync,
{
    pub fn new(
        topology: &'a ProcessTopology,
        prior: &'a P,
        likelihood: &'a L,
        options: SamplerOptions,
    ) -> Self {
        Self {
            topology,
            prior,
            likelihood,
            options,
        }
    }

    /// Runs the multi-level sampler, writing to a file sink when the
    /// default data output name is set.
    pub fn solve(&self) -> TemperResult<PosteriorSolution> {
        let defaults = &self.options.defaults;
        let mut sink: Box<dyn ResultSink> = if defaults.data_output_file_name == NO_OUTPUT_FILE {
            Box::new(NullSink)
        } else {
            Box::new(FileSink::create(
                &defaults.data_output_file_name,
                self.topology.full_rank,
                defaults.data_output_allowed_ranks.clone(),
            )?)
        };
        self.solve_with_sink(sink.as_mut())
    }

    /// Same as [`solve`](Self::solve) but with a caller-provided sink.
    pub fn solve_with_sink(&self, sink: &mut dyn ResultSink) -> TemperResult<PosteriorSolution> {
        let sampler = MultilevelSampler::new(
            self.topology,
            self.prior,
            self.likelihood,
            self.options.clone(),
        );
        let output = sampler.generate(sink)?;
        Ok(PosteriorSolution {
            chain: output.chain,
            ln_likelihoods: output.ln_likelihoods,
            log_evidence: output.log_evidence,
            exponents: output.exponents,
            levels: output.levels,
        })
    }
}
