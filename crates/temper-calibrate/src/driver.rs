//! Multi-level sampling driver.
//!
//! Level 0 draws i.i.d. from the prior. Each subsequent level runs a
//! nine-step pipeline that tempers the likelihood a little further and
//! regrows the chain from resampled seeds:
//!
//! 1. negotiate the global chain size;
//! 2. roll the current sequences into the "previous" slots and compute
//!    each rank's inclusive bounds into the global weight vector;
//! 3. choose the next tempering exponent by bisection on the effective
//!    sample size of the importance weights, and bank this level's
//!    log-evidence factor;
//! 4. build the weighted covariance of the previous chain;
//! 5.–7. diagnostic hooks;
//! 8. tune the scalar multiplier η applied to the proposal covariance so
//!    short pilot chains hit the configured rejection window;
//! 9. diagnostic hook; then regrow the chain from resampled seeds through
//!    the adaptive Metropolis generator.
//!
//! Every decision value (exponent, evidence factor, η, planner choice,
//! loop predicates) is verified identical across inter-group ranks; any
//! disagreement aborts the run.

use std::time::Instant;

use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info};

use temper_core::errors::{TemperError, TemperResult};
use temper_core::linear_algebra::weighted_outer_accumulate;
use temper_core::output::{ResultSink, NO_OUTPUT_FILE};
use temper_core::sequences::{ScalarSequence, VectorSequence};
use temper_core::transport::{check_same_value_across_ranks, Communicator, ProcessTopology};

use crate::metropolis::{generate_sequence, GaussianProposal, GeneratedChain};
use crate::options::{LevelOptions, SamplerOptions};
use crate::planner::{
    decide_on_balanced, prepare_balanced_links, prepare_unbalanced_links, sample_index_counters,
    LinkedChain,
};
use crate::seeding::{
    derive_seed, SALT_CHAIN, SALT_PILOT_CHAIN, SALT_PILOT_RESAMPLE, SALT_PRIOR_DRAWS,
    SALT_RESAMPLE,
};
use crate::target::{LogLikelihood, LogPrior, PriorSampler, TemperedTarget};

/// Attempt bound for the η search of step 8.
const MAX_ETA_ATTEMPTS: usize = 60;
/// Attempt bound for the exponent bisection of step 3.
const MAX_EXPONENT_ATTEMPTS: usize = 100;
/// Bound on the number of tempered levels.
const MAX_LEVELS: u32 = 1000;

/// Tag used to funnel per-rank weight slices to the inter root.
const TAG_GATHER_WEIGHTS: u64 = u64::MAX - 1;

/// Everything the driver hands back once the exponent reaches 1.
#[derive(Debug, Clone)]
pub struct SamplingOutput {
    /// Final-level chain (the posterior sample), local partition.
    pub chain: VectorSequence,
    pub ln_likelihoods: ScalarSequence,
    pub ln_targets: ScalarSequence,
    /// Tempering exponents, one entry per level starting at `β₀ = 0`.
    pub exponents: Vec<f64>,
    /// Accepted proposal multipliers, one per tempered level.
    pub etas: Vec<f64>,
    /// Per-level log-evidence factors; their sum is `log_evidence`.
    pub log_evidence_factors: Vec<f64>,
    pub log_evidence: f64,
    /// Number of tempered levels run (level 0 excluded).
    pub levels: u32,
}

/// The three parallel sequences a level accumulates.
struct LevelState {
    chain: VectorSequence,
    ln_likelihoods: ScalarSequence,
    ln_targets: ScalarSequence,
}

impl LevelState {
    fn new() -> Self {
        Self {
            chain: VectorSequence::new("rawChain"),
            ln_likelihoods: ScalarSequence::new("rawLogLikelihood"),
            ln_targets: ScalarSequence::new("rawLogTarget"),
        }
    }

    fn reset_as_current(&mut self) {
        self.chain.reset("rawChain");
        self.ln_likelihoods.reset("rawLogLikelihood");
        self.ln_targets.reset("rawLogTarget");
    }

    fn append_generated(&mut self, generated: GeneratedChain) {
        for position in generated.positions {
            self.chain.append(position);
        }
        for v in generated.ln_likelihoods {
            self.ln_likelihoods.push(v);
        }
        for v in generated.ln_targets {
            self.ln_targets.push(v);
        }
    }

    fn check_parallel_sizes(&self, rank: usize, context: &str) -> TemperResult<()> {
        if self.chain.len() != self.ln_likelihoods.len()
            || self.chain.len() != self.ln_targets.len()
        {
            return Err(TemperError::SizeMismatch {
                rank,
                context: context.to_string(),
            });
        }
        Ok(())
    }

    /// Burned-in and thinned copy of the chain.
    fn filtered(&self, options: &LevelOptions) -> VectorSequence {
        let discard =
            (self.chain.len() as f64 * options.filtered_chain_discard_fraction) as usize;
        let mut filtered = VectorSequence::new("filteredChain");
        for position in self.chain.positions()[discard..]
            .iter()
            .step_by(options.filtered_chain_lag)
        {
            filtered.append(position.clone());
        }
        filtered
    }
}

/// The multi-level sampling driver.
///
/// Runs on inter-group representatives; sub-group workers cooperate inside
/// the user's [`LogLikelihood`] implementation, which may drive the
/// sub-group communicator for distributed forward models.
pub struct MultilevelSampler<'a, P, L> {
    topology: &'a ProcessTopology,
    prior: &'a P,
    likelihood: &'a L,
    options: SamplerOptions,
}

impl<'a, P, L> MultilevelSampler<'a, P, L>
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

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    /// Runs all levels and returns the posterior chain with the
    /// log-evidence estimate.
    pub fn generate(&self, sink: &mut dyn ResultSink) -> TemperResult<SamplingOutput> {
        self.options.validate()?;
        if self.prior.dim() == 0 {
            return Err(TemperError::InvalidOptions(
                "empty parameter space".to_string(),
            ));
        }
        let inter = self.topology.inter.as_deref().ok_or_else(|| {
            TemperError::InvalidOptions(
                "the driver runs on inter-group representatives only; sub-group workers \
                 cooperate inside the likelihood"
                    .to_string(),
            )
        })?;

        let mut curr = LevelState::new();
        let mut prev = LevelState::new();
        let mut ln_z_factors: Vec<f64> = Vec::new();
        let mut exponents = vec![0.0];
        let mut etas = Vec::new();

        self.run_level_zero(inter, &mut curr, sink)?;

        let mut exponent = 0.0;
        let mut eta = 1.0;
        let mut level = 0u32;
        while exponent < 1.0 {
            level += 1;
            if level > MAX_LEVELS {
                return Err(TemperError::InternalLogic {
                    rank: self.topology.full_rank,
                    context: "tempering exponent failed to reach 1".to_string(),
                });
            }
            let (new_exponent, new_eta) = self.run_level(
                inter,
                level,
                exponent,
                eta,
                &mut curr,
                &mut prev,
                &mut ln_z_factors,
                sink,
            )?;
            exponent = new_exponent;
            eta = new_eta;
            exponents.push(exponent);
            etas.push(eta);
        }

        let log_evidence: f64 = ln_z_factors.iter().sum();
        sink.record_log_evidence(log_evidence)?;
        if !self.options.options_for_level(level).totally_mute {
            info!(levels = level, log_evidence, "sampling complete");
        }

        curr.check_parallel_sizes(self.topology.full_rank, "final chain")?;
        Ok(SamplingOutput {
            chain: curr.chain,
            ln_likelihoods: curr.ln_likelihoods,
            ln_targets: curr.ln_targets,
            exponents,
            etas,
            log_evidence_factors: ln_z_factors,
            log_evidence,
            levels: level,
        })
    }

    /// Level 0: i.i.d. prior draws with their likelihood values. The
    /// recorded log-target is the full `ln π + ln L` (β₀ = 0; the value is
    /// diagnostic, the level-1 weights use the likelihood sequence alone).
    fn run_level_zero(
        &self,
        inter: &dyn Communicator,
        curr: &mut LevelState,
        sink: &mut dyn ResultSink,
    ) -> TemperResult<()> {
        let options = self.options.options_for_level(0);
        let started = Instant::now();
        if !options.totally_mute {
            info!(
                level = 0,
                chain_size = options.raw_chain_size,
                "beginning level"
            );
        }
        let unified_requested = inter.allreduce_sum_u64(options.raw_chain_size as u64)?;

        let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(
            self.options.seed,
            SALT_PRIOR_DRAWS,
            self.topology.full_rank as u64,
        ));
        for _ in 0..options.raw_chain_size {
            let position = self.prior.sample_prior(&mut rng);
            let ln_likelihood = self.likelihood.ln_likelihood(&position.view());
            if ln_likelihood.is_nan() {
                return Err(TemperError::NonFiniteLikelihood {
                    rank: self.topology.full_rank,
                });
            }
            let ln_prior = self.prior.ln_prior(&position.view());
            curr.chain.append(position);
            curr.ln_likelihoods.push(ln_likelihood);
            curr.ln_targets.push(ln_prior + ln_likelihood);
        }
        if curr.chain.len() != options.raw_chain_size {
            return Err(TemperError::SizeMismatch {
                rank: self.topology.full_rank,
                context: "level 0 chain generated with invalid size".to_string(),
            });
        }
        curr.check_parallel_sizes(self.topology.full_rank, "level 0")?;
        self.emit_level_output(0, options, curr, sink)?;
        if !options.totally_mute {
            info!(
                level = 0,
                unified_requested,
                elapsed_s = started.elapsed().as_secs_f64(),
                "ending level"
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_level(
        &self,
        inter: &dyn Communicator,
        level: u32,
        prev_exponent: f64,
        prev_eta: f64,
        curr: &mut LevelState,
        prev: &mut LevelState,
        ln_z_factors: &mut Vec<f64>,
        sink: &mut dyn ResultSink,
    ) -> TemperResult<(f64, f64)> {
        let options = self.options.options_for_level(level);
        let full_rank = self.topology.full_rank;
        let started = Instant::now();
        if !options.totally_mute {
            info!(
                level,
                chain_size = options.raw_chain_size,
                "beginning level"
            );
        }

        // Step 1 of 9: size negotiation.
        let unified_requested = inter.allreduce_sum_u64(options.raw_chain_size as u64)?;

        // Step 2 of 9: roll sequences and compute weight index bounds.
        std::mem::swap(curr, prev);
        curr.reset_as_current();
        prev.check_parallel_sizes(full_rank, "step 2 rolled sequences")?;
        let (first, last, all_bounds) = self.weight_index_bounds(inter, prev.chain.len())?;

        // Step 3 of 9: next exponent, importance weights, evidence factor.
        let (exponent, weights, ln_z) =
            self.choose_exponent(inter, level, options, prev, prev_exponent)?;
        ln_z_factors.push(ln_z);
        check_same_value_across_ranks(
            inter,
            full_rank,
            ln_z,
            1e-16,
            "step 3 log evidence factor",
        )?;
        sink.record_log_evidence_factor(level, ln_z)?;

        // Step 4 of 9: weighted covariance of the previous chain.
        let unified_cov = self.weighted_covariance(inter, prev, &weights)?;

        // Steps 5–7 of 9: hooks.
        self.hook_step5(level);
        self.hook_step6(level);
        self.hook_step7(level);

        // Step 8 of 9: η scaling of the proposal.
        let unified_weights = self.gather_weights_at_root(inter, &weights)?;
        let unified_weight_len = prev.chain.unified_len(inter)?;
        let (proposal, eta) = self.scale_proposal(
            inter,
            level,
            options,
            prev,
            (first, last),
            &all_bounds,
            &unified_weights,
            unified_weight_len,
            &unified_cov,
            exponent,
            prev_eta,
        )?;

        // Step 9 of 9: hook.
        self.hook_step9(level);

        // Regrow the chain from resampled seeds.
        self.generate_level_chain(
            inter,
            level,
            options,
            prev,
            curr,
            (first, last),
            &all_bounds,
            &unified_weights,
            unified_weight_len,
            &proposal,
            exponent,
            unified_requested,
            sink,
        )?;

        if !options.totally_mute {
            info!(
                level,
                exponent,
                eta,
                log_evidence_factor = ln_z,
                elapsed_s = started.elapsed().as_secs_f64(),
                "ending level"
            );
        }
        Ok((exponent, eta))
    }

    /// Inclusive per-rank bounds into the global weight vector, by a
    /// serialized prefix relay: rank 0 starts at 0, each subsequent rank
    /// receives the successor of its predecessor's last index. The two
    /// barriers pin the relay between the surrounding collectives. Every
    /// rank then learns all bounds through one broadcast per rank.
    fn weight_index_bounds(
        &self,
        inter: &dyn Communicator,
        local_len: usize,
    ) -> TemperResult<(u64, u64, Vec<(u64, u64)>)> {
        let rank = inter.rank();
        let size = inter.size();
        if local_len == 0 {
            // Inclusive bounds cannot represent an empty partition.
            return Err(TemperError::InternalLogic {
                rank: self.topology.full_rank,
                context: "rank holds an empty chain partition".to_string(),
            });
        }
        inter.barrier()?;
        let mut first = 0u64;
        if rank > 0 {
            let msg = inter.recv_u64s(rank - 1, (rank - 1) as u64)?;
            first = *msg.first().ok_or_else(|| TemperError::Transport {
                rank: self.topology.full_rank,
                context: "empty prefix relay message".to_string(),
            })?;
        }
        let last = first + local_len as u64 - 1;
        if rank + 1 < size {
            inter.send_u64s(&[last + 1], rank + 1, rank as u64)?;
        }
        inter.barrier()?;

        let mut all_bounds = Vec::with_capacity(size);
        for root in 0..size {
            let mut buf = [first, last];
            inter.broadcast_u64s(&mut buf, root)?;
            all_bounds.push((buf[0], buf[1]));
        }
        Ok((first, last, all_bounds))
    }

    /// Step 3: bisection on the tempering exponent so the effective sample
    /// size ratio of the importance weights lands in the configured
    /// window. Tries the full step to 1 first and accepts it whenever the
    /// ratio clears the window midpoint. Returns the exponent, the
    /// normalized local weights, and the level's log-evidence factor.
    fn choose_exponent(
        &self,
        inter: &dyn Communicator,
        level: u32,
        options: &LevelOptions,
        prev: &LevelState,
        prev_exponent: f64,
    ) -> TemperResult<(f64, Vec<f64>, f64)> {
        let full_rank = self.topology.full_rank;
        let prev_ll = prev.ln_likelihoods.values();
        let unified_n = prev.ln_likelihoods.unified_len(inter)? as f64;
        let mean_ratio = options.mean_effective_size_ratio();

        let mut bracket = [prev_exponent, 1.0];
        let mut now_exponent = 1.0;
        let mut now_ratio = 0.0;
        let mut weights = vec![0.0; prev_ll.len()];
        let mut ln_z = 0.0;
        let mut attempt = 0usize;
        let mut test_result = false;

        while !test_result {
            if attempt > MAX_EXPONENT_ATTEMPTS {
                return Err(TemperError::InternalLogic {
                    rank: full_rank,
                    context: "exponent bisection failed to settle".to_string(),
                });
            }
            if attempt > 0 {
                if now_ratio > mean_ratio {
                    bracket[0] = now_exponent;
                } else {
                    bracket[1] = now_exponent;
                }
                now_exponent = 0.5 * (bracket[0] + bracket[1]);
            }
            let aux_exponent = if prev_exponent != 0.0 {
                now_exponent / prev_exponent - 1.0
            } else {
                now_exponent
            };

            let mut local_max = f64::NEG_INFINITY;
            for (w, ll) in weights.iter_mut().zip(prev_ll) {
                *w = ll * aux_exponent;
                local_max = local_max.max(*w);
            }
            let omega_max = inter.allreduce_max_f64(local_max)?;

            let mut local_sum = 0.0;
            for w in weights.iter_mut() {
                *w = (*w - omega_max).exp();
                local_sum += *w;
            }
            let unified_sum = inter.allreduce_sum_f64(local_sum)?;
            ln_z = unified_sum.ln() + omega_max - unified_n.ln();

            let mut local_sq = 0.0;
            for w in weights.iter_mut() {
                *w /= unified_sum;
                local_sq += *w * *w;
            }
            let unified_sq = inter.allreduce_sum_f64(local_sq)?;
            let effective_size = 1.0 / unified_sq;
            now_ratio = effective_size / unified_n;
            if now_ratio > 1.0 + 1e-8 {
                return Err(TemperError::EffectiveSizeOutOfRange {
                    rank: full_rank,
                    ratio: now_ratio,
                });
            }

            let full_step_clears_midpoint = now_exponent == 1.0 && now_ratio > mean_ratio;
            let in_window = now_ratio >= options.min_effective_size_ratio
                && now_ratio <= options.max_effective_size_ratio;
            test_result = full_step_clears_midpoint || in_window;

            debug!(
                level,
                attempt,
                exponent = now_exponent,
                effective_size_ratio = now_ratio,
                "exponent bisection"
            );
            attempt += 1;

            check_same_value_across_ranks(inter, full_rank, now_exponent, 0.0, "step 3 exponent")?;
            check_same_value_across_ranks(
                inter,
                full_rank,
                if test_result { 1.0 } else { 0.0 },
                0.0,
                "step 3 test result",
            )?;
        }
        Ok((now_exponent, weights, ln_z))
    }

    /// Step 4: weighted mean and covariance accumulated over the local
    /// partition, then element-wise reduce-summed into the unified matrix
    /// every inter rank holds.
    fn weighted_covariance(
        &self,
        inter: &dyn Communicator,
        prev: &LevelState,
        weights: &[f64],
    ) -> TemperResult<Array2<f64>> {
        let dim = self.prior.dim();
        let mut weighted_mean = Array1::<f64>::zeros(dim);
        for (w, x) in weights.iter().zip(prev.chain.positions()) {
            weighted_mean.scaled_add(*w, x);
        }
        let mut local_cov = Array2::<f64>::zeros((dim, dim));
        for (w, x) in weights.iter().zip(prev.chain.positions()) {
            let diff = x - &weighted_mean;
            weighted_outer_accumulate(&mut local_cov, *w, &diff.view());
        }
        let mut unified = Array2::<f64>::zeros((dim, dim));
        for i in 0..dim {
            for j in 0..dim {
                unified[[i, j]] = inter.allreduce_sum_f64(local_cov[[i, j]])?;
            }
        }
        Ok(unified)
    }

    fn hook_step5(&self, _level: u32) {}

    fn hook_step6(&self, _level: u32) {}

    fn hook_step7(&self, _level: u32) {}

    fn hook_step9(&self, _level: u32) {}

    /// Assembles the full normalized weight vector on the inter root, in
    /// rank order (which is global index order).
    fn gather_weights_at_root(
        &self,
        inter: &dyn Communicator,
        weights: &[f64],
    ) -> TemperResult<Option<Vec<f64>>> {
        if inter.rank() == 0 {
            let mut unified = weights.to_vec();
            for r in 1..inter.size() {
                unified.extend(inter.recv_f64s(r, TAG_GATHER_WEIGHTS)?);
            }
            Ok(Some(unified))
        } else {
            inter.send_f64s(weights, 0, TAG_GATHER_WEIGHTS)?;
            Ok(None)
        }
    }

    /// Multinomial resampling at the inter root, broadcast to everyone.
    fn resample_counters(
        &self,
        inter: &dyn Communicator,
        unified_weights: &Option<Vec<f64>>,
        unified_len: usize,
        num_draws: u64,
        seed: u64,
    ) -> TemperResult<Vec<u64>> {
        let mut counters = vec![0u64; unified_len];
        if inter.rank() == 0 {
            let weights = unified_weights
                .as_ref()
                .ok_or_else(|| TemperError::InternalLogic {
                    rank: self.topology.full_rank,
                    context: "inter root holds no unified weight vector".to_string(),
                })?;
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            counters = sample_index_counters(&mut rng, weights, num_draws);
            if counters.len() != unified_len {
                return Err(TemperError::InternalLogic {
                    rank: self.topology.full_rank,
                    context: "wrong output size from index resampling".to_string(),
                });
            }
        }
        inter.broadcast_u64s(&mut counters, 0)?;
        Ok(counters)
    }

    /// One planner invocation: the balanced/unbalanced decision (verified
    /// identical everywhere) followed by plan construction.
    #[allow(clippy::too_many_arguments)]
    fn plan_links(
        &self,
        inter: &dyn Communicator,
        counters: &[u64],
        bounds: (u64, u64),
        all_bounds: &[(u64, u64)],
        prev: &LevelState,
        threshold: f64,
    ) -> TemperResult<Vec<LinkedChain>> {
        let full_rank = self.topology.full_rank;
        let balanced = decide_on_balanced(inter, counters, bounds.0, bounds.1, threshold)?;
        check_same_value_across_ranks(
            inter,
            full_rank,
            if balanced { 1.0 } else { 0.0 },
            0.0,
            "balanced planner decision",
        )?;
        if balanced {
            prepare_balanced_links(inter, counters, all_bounds, &prev.chain, full_rank)
        } else {
            Ok(prepare_unbalanced_links(
                counters,
                bounds.0,
                bounds.1,
                &prev.chain,
            ))
        }
    }

    /// Grows every linked chain assigned to this rank, in parallel with
    /// one derived RNG stream per link, and returns the total rejections.
    /// When `out` is given the chains are appended in link order.
    fn run_linked_chains(
        &self,
        links: &[LinkedChain],
        proposal: &GaussianProposal,
        exponent: f64,
        options: &LevelOptions,
        base_seed: u64,
        mut out: Option<&mut LevelState>,
    ) -> TemperResult<u64> {
        let target = TemperedTarget::new(
            self.prior,
            self.likelihood,
            exponent,
            self.topology.full_rank,
        );
        let results: Vec<TemperResult<GeneratedChain>> = links
            .par_iter()
            .map(|link| {
                let mut rng = ChaCha8Rng::seed_from_u64(derive_seed(
                    base_seed,
                    SALT_CHAIN,
                    link.global_index,
                ));
                generate_sequence(
                    &link.seed.view(),
                    link.num_positions as usize,
                    proposal,
                    &target,
                    options,
                    &mut rng,
                )
            })
            .collect();

        let mut rejections = 0u64;
        for result in results {
            let generated = result?;
            rejections += generated.rejections;
            if let Some(state) = out.as_deref_mut() {
                state.append_generated(generated);
            }
        }
        Ok(rejections)
    }

    /// Step 8: finds η so the pilot rejection rate lands in the window.
    ///
    /// Starts in expansion mode (×4 / ÷4 moves, driven by the below-range
    /// flag, which starts `true` by convention before any pilot has run)
    /// and switches to bisection the first time the flag flips between
    /// consecutive pilots. Pilot chains run with derived options: mute, no
    /// delayed rejection, no adaptation, no statistics.
    #[allow(clippy::too_many_arguments)]
    fn scale_proposal(
        &self,
        inter: &dyn Communicator,
        level: u32,
        options: &LevelOptions,
        prev: &LevelState,
        bounds: (u64, u64),
        all_bounds: &[(u64, u64)],
        unified_weights: &Option<Vec<f64>>,
        unified_weight_len: usize,
        unified_cov: &Array2<f64>,
        exponent: f64,
        prev_eta: f64,
    ) -> TemperResult<(GaussianProposal, f64)> {
        let full_rank = self.topology.full_rank;
        let base = GaussianProposal::from_covariance(
            unified_cov,
            full_rank,
            "level proposal covariance",
        )?;

        let pilot_options = options.pilot();
        let pilot_len = options.pilot_chain_size() as u64;
        let pilot_draws = pilot_len * inter.size() as u64;
        let mean_rejection = options.mean_rejection_rate();

        let mut before_eta = prev_eta;
        let mut before_rejection = 0.0;
        // Convention: the search starts as if the last pilot had landed
        // below the window, which biases the first expansion step upward.
        let mut before_below = true;
        let mut now_eta = prev_eta;
        let mut now_rejection = 0.0;
        let mut now_below;
        let mut eta_bracket = [before_eta, 1.0];
        let mut rejection_bracket = [0.0, 0.0];
        let mut use_middle_point = false;

        let mut attempt = 0usize;
        let mut test_result = false;
        while !test_result {
            if attempt >= MAX_ETA_ATTEMPTS {
                return Err(TemperError::InternalLogic {
                    rank: full_rank,
                    context: format!(
                        "proposal scaling failed to settle within {MAX_ETA_ATTEMPTS} pilot attempts"
                    ),
                });
            }
            if now_rejection < options.min_rejection_rate {
                now_below = true;
            } else if now_rejection > options.max_rejection_rate {
                now_below = false;
            } else {
                return Err(TemperError::InternalLogic {
                    rank: full_rank,
                    context: "rejection rate inside the window must have ended the loop"
                        .to_string(),
                });
            }

            if attempt > 0 {
                if !use_middle_point {
                    if attempt == 1 || before_below == now_below {
                        // Still expanding.
                    } else {
                        use_middle_point = true;
                        eta_bracket = [before_eta.min(now_eta), before_eta.max(now_eta)];
                        if before_below && !now_below && eta_bracket[0] == before_eta {
                            rejection_bracket = [before_rejection, now_rejection];
                        } else if before_below && !now_below {
                            rejection_bracket = [now_rejection, before_rejection];
                        }
                    }
                }
                before_eta = now_eta;
                before_rejection = now_rejection;
                before_below = now_below;
                if !use_middle_point {
                    if before_below {
                        now_eta *= 4.0;
                    } else {
                        now_eta /= 4.0;
                    }
                    debug!(level, attempt, eta = now_eta, "eta expansion step");
                } else {
                    if now_rejection > mean_rejection {
                        if rejection_bracket[0] > mean_rejection {
                            eta_bracket[0] = now_eta;
                        } else {
                            eta_bracket[1] = now_eta;
                        }
                    } else if rejection_bracket[0] < mean_rejection {
                        eta_bracket[0] = now_eta;
                    } else {
                        eta_bracket[1] = now_eta;
                    }
                    now_eta = 0.5 * (eta_bracket[0] + eta_bracket[1]);
                    debug!(
                        level,
                        attempt,
                        eta = now_eta,
                        lo = eta_bracket[0],
                        hi = eta_bracket[1],
                        "eta bisection step"
                    );
                }
            }

            let scaled = base.scaled(now_eta);
            let counters = self.resample_counters(
                inter,
                unified_weights,
                unified_weight_len,
                pilot_draws,
                derive_seed(
                    self.options.seed,
                    SALT_PILOT_RESAMPLE,
                    ((level as u64) << 32) | attempt as u64,
                ),
            )?;
            let links = self.plan_links(
                inter,
                &counters,
                bounds,
                all_bounds,
                prev,
                options.load_balance_threshold,
            )?;
            let rejections = self.run_linked_chains(
                &links,
                &scaled,
                exponent,
                &pilot_options,
                derive_seed(
                    self.options.seed,
                    SALT_PILOT_CHAIN,
                    ((level as u64) << 32) | attempt as u64,
                ),
                None,
            )?;
            let unified_rejections = inter.allreduce_sum_u64(rejections)?;
            now_rejection = unified_rejections as f64 / pilot_draws as f64;

            test_result = now_rejection >= options.min_rejection_rate
                && now_rejection <= options.max_rejection_rate;
            check_same_value_across_ranks(
                inter,
                full_rank,
                if test_result { 1.0 } else { 0.0 },
                0.0,
                "step 8 test result",
            )?;
            // Sub-group workers do not evaluate pilot statistics but still
            // need the loop predicate.
            let mut flag = [u64::from(test_result)];
            self.topology.sub.broadcast_u64s(&mut flag, 0)?;
            test_result = flag[0] != 0;

            debug!(
                level,
                attempt,
                eta = now_eta,
                rejection_rate = now_rejection,
                "eta pilot"
            );
            attempt += 1;
            check_same_value_across_ranks(inter, full_rank, now_eta, 1e-16, "step 8 eta")?;
        }

        let proposal = if now_eta != 1.0 {
            base.scaled(now_eta)
        } else {
            base
        };
        if !options.totally_mute {
            info!(
                level,
                eta = now_eta,
                rejection_rate = now_rejection,
                "accepted proposal scaling"
            );
        }
        Ok((proposal, now_eta))
    }

    /// Final phase of a level: resample seeds from the accepted weights and
    /// regrow the chain under the scaled proposal with full options.
    #[allow(clippy::too_many_arguments)]
    fn generate_level_chain(
        &self,
        inter: &dyn Communicator,
        level: u32,
        options: &LevelOptions,
        prev: &LevelState,
        curr: &mut LevelState,
        bounds: (u64, u64),
        all_bounds: &[(u64, u64)],
        unified_weights: &Option<Vec<f64>>,
        unified_weight_len: usize,
        proposal: &GaussianProposal,
        exponent: f64,
        unified_requested: u64,
        sink: &mut dyn ResultSink,
    ) -> TemperResult<()> {
        let full_rank = self.topology.full_rank;
        let counters = self.resample_counters(
            inter,
            unified_weights,
            unified_weight_len,
            unified_requested,
            derive_seed(self.options.seed, SALT_RESAMPLE, level as u64),
        )?;
        let links = self.plan_links(
            inter,
            &counters,
            bounds,
            all_bounds,
            prev,
            options.load_balance_threshold,
        )?;
        let rejections = self.run_linked_chains(
            links.as_slice(),
            proposal,
            exponent,
            options,
            derive_seed(self.options.seed, SALT_CHAIN, level as u64),
            Some(curr),
        )?;
        curr.check_parallel_sizes(full_rank, "generated level chain")?;
        let unified_generated = curr.chain.unified_len(inter)? as u64;
        if unified_generated != unified_requested {
            return Err(TemperError::SizeMismatch {
                rank: full_rank,
                context: format!(
                    "generated {unified_generated} chain positions, requested {unified_requested}"
                ),
            });
        }
        let unified_rejections = inter.allreduce_sum_u64(rejections)?;
        if !options.totally_mute {
            info!(
                level,
                rejection_rate = unified_rejections as f64 / unified_requested as f64,
                "generated level chain"
            );
        }
        self.emit_level_output(level, options, curr, sink)
    }

    /// Statistics logging, raw chain output, and the optional filtered
    /// chain, honoring the "do not write" filename sentinel.
    fn emit_level_output(
        &self,
        level: u32,
        options: &LevelOptions,
        state: &LevelState,
        sink: &mut dyn ResultSink,
    ) -> TemperResult<()> {
        if options.raw_chain_compute_stats && !options.totally_mute {
            let chain_stats = state.chain.compute_stats();
            let ll_stats = state.ln_likelihoods.compute_stats();
            info!(level, ?chain_stats, ?ll_stats, "raw chain statistics");
        }
        if options.raw_chain_data_output_file_name != NO_OUTPUT_FILE {
            sink.append_vector_sequence(level, &state.chain)?;
            sink.append_scalar_sequence(level, &state.ln_likelihoods)?;
            sink.append_scalar_sequence(level, &state.ln_targets)?;
        }
        if options.filtered_chain_generate && options.data_output_file_name != NO_OUTPUT_FILE {
            let filtered = state.filtered(options);
            sink.append_vector_sequence(level, &filtered)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{GaussianMeanLikelihood, IndependentGaussian};
    use is_close::is_close;
    use ndarray::array;
    use temper_core::output::{MemorySink, NullSink};
    use temper_core::transport::LocalCluster;

    fn toy_sampler_options(chain_size: usize, seed: u64) -> SamplerOptions {
        let mut defaults = LevelOptions::default();
        defaults.raw_chain_size = chain_size;
        defaults.min_effective_size_ratio = 0.5;
        defaults.max_effective_size_ratio = 0.9;
        defaults.min_rejection_rate = 0.25;
        defaults.max_rejection_rate = 0.45;
        defaults.totally_mute = true;
        SamplerOptions::with_defaults(seed, defaults)
    }

    fn seeded_prev_state(ln_likelihoods: &[f64]) -> LevelState {
        let mut state = LevelState::new();
        for (i, ll) in ln_likelihoods.iter().enumerate() {
            state.chain.append(array![i as f64, -(i as f64)]);
            state.ln_likelihoods.push(*ll);
            state.ln_targets.push(*ll);
        }
        state
    }

    #[test]
    fn weights_normalize_globally_after_step3() {
        let sums = LocalCluster::run(2, |topo| {
            let prior = IndependentGaussian::standard(2);
            let likelihood = GaussianMeanLikelihood::new(array![0.0, 0.0], 1.0);
            let sampler = MultilevelSampler::new(
                &topo,
                &prior,
                &likelihood,
                toy_sampler_options(4, 3),
            );
            let inter = topo.inter.as_deref().unwrap();
            let rank = inter.rank() as f64;
            let prev = seeded_prev_state(&[
                -0.5 - rank,
                -1.0 - rank,
                -2.0 - rank,
                -4.0 - rank,
            ]);
            let options = sampler.options.options_for_level(1).clone();
            let (exponent, weights, _) = sampler
                .choose_exponent(inter, 1, &options, &prev, 0.0)
                .unwrap();
            assert!(exponent > 0.0 && exponent <= 1.0);
            let local: f64 = weights.iter().sum();
            inter.allreduce_sum_f64(local).unwrap()
        });
        for total in sums {
            assert!(is_close!(total, 1.0, abs_tol = 1e-10));
        }
    }

    #[test]
    fn log_sum_exp_shift_matches_direct_evaluation() {
        let topo = ProcessTopology::single();
        let prior = IndependentGaussian::standard(2);
        let likelihood = GaussianMeanLikelihood::new(array![0.0, 0.0], 1.0);
        let sampler =
            MultilevelSampler::new(&topo, &prior, &likelihood, toy_sampler_options(4, 3));
        let inter = topo.inter.as_deref().unwrap();
        let ln_likelihoods = [-0.25, -0.5, -0.75, -1.25];
        let prev = seeded_prev_state(&ln_likelihoods);
        let options = sampler.options.options_for_level(1).clone();
        let (exponent, _, ln_z) = sampler
            .choose_exponent(inter, 1, &options, &prev, 0.0)
            .unwrap();
        let direct: f64 = ln_likelihoods
            .iter()
            .map(|ll| (ll * exponent).exp())
            .sum::<f64>();
        let expected = (direct / ln_likelihoods.len() as f64).ln();
        assert!(is_close!(ln_z, expected, rel_tol = 1e-12));
    }

    #[test]
    fn exponent_schedule_is_monotonic_and_ends_at_one() {
        let topo = ProcessTopology::single();
        let prior = IndependentGaussian::standard(2);
        let likelihood = GaussianMeanLikelihood::new(array![1.0, 1.0], 0.5);
        let sampler =
            MultilevelSampler::new(&topo, &prior, &likelihood, toy_sampler_options(512, 10));
        let output = sampler.generate(&mut NullSink).unwrap();
        assert_eq!(output.exponents[0], 0.0);
        for pair in output.exponents.windows(2) {
            assert!(pair[1] > pair[0], "exponents must increase: {pair:?}");
        }
        assert_eq!(*output.exponents.last().unwrap(), 1.0);
        assert_eq!(output.levels as usize, output.etas.len());
        assert_eq!(output.levels as usize + 1, output.exponents.len());
    }

    #[test]
    fn prefix_bounds_chain_across_ranks() {
        let bounds = LocalCluster::run(3, |topo| {
            let prior = IndependentGaussian::standard(1);
            let likelihood = GaussianMeanLikelihood::new(array![0.0], 1.0);
            let sampler = MultilevelSampler::new(
                &topo,
                &prior,
                &likelihood,
                toy_sampler_options(4, 0),
            );
            let inter = topo.inter.as_deref().unwrap();
            // Uneven partitions: rank r holds r + 2 positions.
            let local_len = inter.rank() + 2;
            let (first, last, all) = sampler.weight_index_bounds(inter, local_len).unwrap();
            assert_eq!(all.len(), 3);
            (first, last, all)
        });
        assert_eq!(bounds[0].0, 0);
        assert_eq!(bounds[0].1, 1);
        assert_eq!(bounds[1].0, 2);
        assert_eq!(bounds[1].1, 4);
        assert_eq!(bounds[2].0, 5);
        assert_eq!(bounds[2].1, 8);
        // Every rank reports the identical bound table, and each first is
        // its predecessor's last plus one.
        for (_, _, all) in &bounds {
            assert_eq!(all, &bounds[0].2);
            for pair in all.windows(2) {
                assert_eq!(pair[1].0, pair[0].1 + 1);
            }
        }
    }

    #[test]
    fn weighted_covariance_matches_hand_computation() {
        let topo = ProcessTopology::single();
        let prior = IndependentGaussian::standard(2);
        let likelihood = GaussianMeanLikelihood::new(array![0.0, 0.0], 1.0);
        let sampler =
            MultilevelSampler::new(&topo, &prior, &likelihood, toy_sampler_options(4, 0));
        let inter = topo.inter.as_deref().unwrap();
        let mut prev = LevelState::new();
        prev.chain.append(array![1.0, 0.0]);
        prev.chain.append(array![-1.0, 0.0]);
        let weights = [0.5, 0.5];
        let cov = sampler
            .weighted_covariance(inter, &prev, &weights)
            .unwrap();
        // mean = 0, cov = 0.5·(1) + 0.5·(1) = 1 on the x axis.
        assert!(is_close!(cov[[0, 0]], 1.0));
        assert!(is_close!(cov[[0, 1]], 0.0, abs_tol = 1e-15));
        assert!(is_close!(cov[[1, 1]], 0.0, abs_tol = 1e-15));
    }

    #[test]
    fn degenerate_covariance_is_fatal_with_rank_identity() {
        let zero = Array2::<f64>::zeros((2, 2));
        let err = GaussianProposal::from_covariance(&zero, 4, "level proposal")
            .err()
            .unwrap();
        match err {
            TemperError::NotPositiveDefinite { rank, .. } => assert_eq!(rank, 4),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn level_zero_is_deterministic_for_a_fixed_seed() {
        let run = |seed| {
            let topo = ProcessTopology::single();
            let prior = IndependentGaussian::standard(2);
            let likelihood = GaussianMeanLikelihood::new(array![1.0, 1.0], 0.5);
            let sampler = MultilevelSampler::new(
                &topo,
                &prior,
                &likelihood,
                toy_sampler_options(64, seed),
            );
            let inter = topo.inter.as_deref().unwrap();
            let mut state = LevelState::new();
            sampler
                .run_level_zero(inter, &mut state, &mut NullSink)
                .unwrap();
            (
                state.chain.positions().to_vec(),
                state.ln_likelihoods.values().to_vec(),
            )
        };
        let (chain_a, ll_a) = run(5);
        let (chain_b, ll_b) = run(5);
        assert_eq!(chain_a, chain_b);
        assert_eq!(ll_a, ll_b);
        let (chain_c, _) = run(6);
        assert_ne!(chain_a, chain_c);
    }

    #[test]
    fn empty_parameter_space_is_fatal_at_start() {
        struct EmptyPrior;
        impl LogPrior for EmptyPrior {
            fn dim(&self) -> usize {
                0
            }
            fn ln_prior(&self, _theta: &ndarray::ArrayView1<f64>) -> f64 {
                0.0
            }
        }
        impl PriorSampler for EmptyPrior {
            fn sample_prior(&self, _rng: &mut dyn rand::RngCore) -> Array1<f64> {
                Array1::zeros(0)
            }
        }
        let topo = ProcessTopology::single();
        let likelihood = GaussianMeanLikelihood::new(array![0.0], 1.0);
        let sampler =
            MultilevelSampler::new(&topo, &EmptyPrior, &likelihood, toy_sampler_options(8, 0));
        assert!(matches!(
            sampler.generate(&mut NullSink),
            Err(TemperError::InvalidOptions(_))
        ));
    }

    #[test]
    fn raw_chain_output_honors_the_sentinel() {
        let topo = ProcessTopology::single();
        let prior = IndependentGaussian::standard(1);
        let likelihood = GaussianMeanLikelihood::new(array![0.2], 1.0);

        let mut options = toy_sampler_options(64, 1);
        options.defaults.raw_chain_data_output_file_name = "out".to_string();
        let sampler = MultilevelSampler::new(&topo, &prior, &likelihood, options);
        let mut sink = MemorySink::default();
        sampler.generate(&mut sink).unwrap();
        assert!(!sink.vector_sequences.is_empty());
        assert!(sink.log_evidence.is_some());

        let muted = MultilevelSampler::new(
            &topo,
            &prior,
            &likelihood,
            toy_sampler_options(64, 1),
        );
        let mut silent_sink = MemorySink::default();
        muted.generate(&mut silent_sink).unwrap();
        assert!(silent_sink.vector_sequences.is_empty());
        // Evidence factors are always recorded.
        assert!(silent_sink.log_evidence.is_some());
        assert!(!silent_sink.log_evidence_factors.is_empty());
    }

    #[test]
    fn filtered_chain_discards_and_thins() {
        let mut state = LevelState::new();
        for i in 0..10 {
            state.chain.append(array![i as f64]);
            state.ln_likelihoods.push(0.0);
            state.ln_targets.push(0.0);
        }
        let mut options = LevelOptions::default();
        options.filtered_chain_discard_fraction = 0.5;
        options.filtered_chain_lag = 2;
        let filtered = state.filtered(&options);
        assert_eq!(filtered.len(), 3);
        assert_eq!(filtered.position(0)[0], 5.0);
        assert_eq!(filtered.position(1)[0], 7.0);
        assert_eq!(filtered.position(2)[0], 9.0);
    }
}
