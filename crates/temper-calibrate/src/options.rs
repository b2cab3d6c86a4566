//! Per-level sampling options.
//!
//! Every level of the driver reads its knobs from a [`LevelOptions`] value;
//! [`SamplerOptions`] holds the run-wide defaults plus whole-struct
//! per-level overrides. Validation is fatal before the first level runs.

use std::collections::BTreeMap;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use temper_core::errors::{TemperError, TemperResult};
use temper_core::output::NO_OUTPUT_FILE;

/// Options governing one level of the multi-level driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelOptions {
    /// Requested number of chain positions on this rank.
    /// Default: 1000
    pub raw_chain_size: usize,

    /// Lower edge of the effective-sample-size ratio window used when
    /// choosing the next tempering exponent.
    /// Default: 0.85
    pub min_effective_size_ratio: f64,

    /// Upper edge of the effective-sample-size ratio window.
    /// Default: 0.91
    pub max_effective_size_ratio: f64,

    /// Lower edge of the pilot-chain rejection-rate window used when
    /// scaling the proposal covariance.
    /// Default: 0.50
    pub min_rejection_rate: f64,

    /// Upper edge of the pilot-chain rejection-rate window.
    /// Default: 0.75
    pub max_rejection_rate: f64,

    /// Target coefficient of variation of the pilot rejection estimate;
    /// sets the pilot chain length.
    /// Default: 0.25
    pub cov_rejection_rate: f64,

    /// Number of extra delayed-rejection stages after a rejected proposal.
    /// Default: 0 (off)
    pub dr_max_num_extra_stages: usize,

    /// Per-stage shrink divisors for delayed-rejection proposals; stage `s`
    /// proposes with covariance `Σ / scale²`. The last entry is reused for
    /// deeper stages.
    /// Default: `[5.0, 10.0, 20.0]`
    pub dr_stage_scales: Vec<f64>,

    /// Period of the adaptive-covariance update inside the chain
    /// generator; 0 disables adaptation (plain Metropolis with fixed Σ).
    /// Default: 0
    pub am_adapt_interval: usize,

    /// Number of initial positions generated before adaptation may start.
    /// Default: 100
    pub am_init_non_adapt_interval: usize,

    /// Diagonal regularization added to the adapted covariance.
    /// Default: 1e-5
    pub am_epsilon: f64,

    /// Compute and log summary statistics of the raw chain.
    /// Default: false
    pub raw_chain_compute_stats: bool,

    /// Emit a filtered (burned-in and thinned) copy of the raw chain.
    /// Default: false
    pub filtered_chain_generate: bool,

    /// Fraction of the raw chain discarded before thinning.
    /// Default: 0.5
    pub filtered_chain_discard_fraction: f64,

    /// Keep every `lag`-th position of the remainder.
    /// Default: 1
    pub filtered_chain_lag: usize,

    /// Suppress all per-level logging. Pilot chains always run mute.
    /// Default: false
    pub totally_mute: bool,

    /// Output location for level data; `"."` means "do not write".
    /// Default: `"."`
    pub data_output_file_name: String,

    /// Ranks allowed to write to the data output.
    /// Default: `{0}`
    pub data_output_allowed_ranks: IndexSet<usize>,

    /// Output location for the raw chain; `"."` means "do not write".
    /// Default: `"."`
    pub raw_chain_data_output_file_name: String,

    /// Relative spread of per-rank load above which seed assignment
    /// switches from the unbalanced to the balanced planner.
    /// Default: 1.0
    pub load_balance_threshold: f64,
}

impl Default for LevelOptions {
    fn default() -> Self {
        Self {
            raw_chain_size: 1000,
            min_effective_size_ratio: 0.85,
            max_effective_size_ratio: 0.91,
            min_rejection_rate: 0.50,
            max_rejection_rate: 0.75,
            cov_rejection_rate: 0.25,
            dr_max_num_extra_stages: 0,
            dr_stage_scales: vec![5.0, 10.0, 20.0],
            am_adapt_interval: 0,
            am_init_non_adapt_interval: 100,
            am_epsilon: 1e-5,
            raw_chain_compute_stats: false,
            filtered_chain_generate: false,
            filtered_chain_discard_fraction: 0.5,
            filtered_chain_lag: 1,
            totally_mute: false,
            data_output_file_name: NO_OUTPUT_FILE.to_string(),
            data_output_allowed_ranks: IndexSet::from([0]),
            raw_chain_data_output_file_name: NO_OUTPUT_FILE.to_string(),
            load_balance_threshold: 1.0,
        }
    }
}

impl LevelOptions {
    pub fn validate(&self) -> TemperResult<()> {
        if self.raw_chain_size == 0 {
            return Err(TemperError::InvalidOptions(
                "raw_chain_size must be positive".to_string(),
            ));
        }
        if !(self.min_effective_size_ratio > 0.0)
            || !(self.max_effective_size_ratio <= 1.0)
            || self.min_effective_size_ratio >= self.max_effective_size_ratio
        {
            return Err(TemperError::InvalidOptions(format!(
                "effective size ratio window [{}, {}] is inverted or outside (0, 1]",
                self.min_effective_size_ratio, self.max_effective_size_ratio
            )));
        }
        if !(self.min_rejection_rate > 0.0)
            || !(self.max_rejection_rate < 1.0)
            || self.min_rejection_rate >= self.max_rejection_rate
        {
            return Err(TemperError::InvalidOptions(format!(
                "rejection rate window [{}, {}] is inverted or outside (0, 1)",
                self.min_rejection_rate, self.max_rejection_rate
            )));
        }
        if !(self.cov_rejection_rate > 0.0) {
            return Err(TemperError::InvalidOptions(
                "cov_rejection_rate must be positive".to_string(),
            ));
        }
        if self.dr_stage_scales.is_empty() && self.dr_max_num_extra_stages > 0 {
            return Err(TemperError::InvalidOptions(
                "delayed rejection requires at least one stage scale".to_string(),
            ));
        }
        if self.dr_stage_scales.iter().any(|s| !(*s > 1.0)) {
            return Err(TemperError::InvalidOptions(
                "delayed rejection stage scales must exceed 1".to_string(),
            ));
        }
        if !(self.am_epsilon > 0.0) {
            return Err(TemperError::InvalidOptions(
                "am_epsilon must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.filtered_chain_discard_fraction) {
            return Err(TemperError::InvalidOptions(
                "filtered_chain_discard_fraction must lie in [0, 1)".to_string(),
            ));
        }
        if self.filtered_chain_lag == 0 {
            return Err(TemperError::InvalidOptions(
                "filtered_chain_lag must be at least 1".to_string(),
            ));
        }
        if !(self.load_balance_threshold > 0.0) {
            return Err(TemperError::InvalidOptions(
                "load_balance_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Derived options for a pilot chain: mute, no statistics, no filtered
    /// chain, no delayed rejection, no adaptation. The parent value is
    /// never touched, so there is nothing to restore when a pilot run
    /// fails.
    pub fn pilot(&self) -> LevelOptions {
        LevelOptions {
            totally_mute: true,
            raw_chain_size: 0,
            raw_chain_compute_stats: false,
            filtered_chain_generate: false,
            dr_max_num_extra_stages: 0,
            am_adapt_interval: 0,
            ..self.clone()
        }
    }

    /// Midpoint of the effective-sample-size window.
    pub fn mean_effective_size_ratio(&self) -> f64 {
        0.5 * (self.min_effective_size_ratio + self.max_effective_size_ratio)
    }

    /// Midpoint of the rejection-rate window.
    pub fn mean_rejection_rate(&self) -> f64 {
        0.5 * (self.min_rejection_rate + self.max_rejection_rate)
    }

    /// Pilot chain length per rank, from the target coefficient of
    /// variation of the rejection estimate.
    pub fn pilot_chain_size(&self) -> usize {
        let mean_rej = self.mean_rejection_rate();
        let c2 = self.cov_rejection_rate * self.cov_rejection_rate;
        1 + ((1.0 - mean_rej) / (mean_rej * c2)) as usize
    }
}

/// Run-wide options: the master seed, level defaults, and whole-struct
/// per-level overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerOptions {
    /// Master RNG seed; every stream in the run derives from it.
    pub seed: u64,
    pub defaults: LevelOptions,
    pub overrides: BTreeMap<u32, LevelOptions>,
}

impl SamplerOptions {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            defaults: LevelOptions::default(),
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_defaults(seed: u64, defaults: LevelOptions) -> Self {
        Self {
            seed,
            defaults,
            overrides: BTreeMap::new(),
        }
    }

    pub fn options_for_level(&self, level: u32) -> &LevelOptions {
        self.overrides.get(&level).unwrap_or(&self.defaults)
    }

    pub fn validate(&self) -> TemperResult<()> {
        self.defaults.validate()?;
        for opts in self.overrides.values() {
            opts.validate()?;
        }
        Ok(())
    }
}
