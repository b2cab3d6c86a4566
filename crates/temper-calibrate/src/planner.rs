//! Link planner: turns resampled seed indices into per-rank work.
//!
//! Resampling draws a multiset of global indices into the previous level's
//! chain; each distinct index becomes a *linked chain* (seed position plus
//! a chain length equal to its multiplicity). Two assignment strategies:
//!
//! - **Unbalanced**: every rank keeps the seeds it already owns. No data
//!   movement, but a skewed weight vector concentrates work on few ranks.
//! - **Balanced**: work units are packed longest-first onto the least
//!   loaded rank; seeds assigned away from their owner are shipped
//!   point-to-point.
//!
//! All ranks run the same deterministic computations on the same broadcast
//! counters, so the plan (and the balanced/unbalanced decision) agrees
//! everywhere without further negotiation.

use ndarray::Array1;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use temper_core::errors::{TemperError, TemperResult};
use temper_core::sequences::VectorSequence;
use temper_core::transport::Communicator;

/// One chain to grow: a seed position and how many positions to produce.
#[derive(Debug, Clone)]
pub struct LinkedChain {
    pub global_index: u64,
    pub seed: Array1<f64>,
    pub num_positions: u64,
}

/// Multinomial resampling of `num_draws` indices from a normalized weight
/// vector; returns one multiplicity counter per index. Runs on the inter
/// root only; callers broadcast the counters.
pub fn sample_index_counters(
    rng: &mut ChaCha8Rng,
    weights: &[f64],
    num_draws: u64,
) -> Vec<u64> {
    let mut cdf = Vec::with_capacity(weights.len());
    let mut acc = 0.0;
    for w in weights {
        acc += w;
        cdf.push(acc);
    }
    let mut counters = vec![0u64; weights.len()];
    for _ in 0..num_draws {
        let u: f64 = rng.gen::<f64>() * acc;
        let idx = cdf.partition_point(|c| *c <= u).min(weights.len() - 1);
        counters[idx] += 1;
    }
    counters
}

/// Per-rank total chain length under the unbalanced plan.
fn unbalanced_load(counters: &[u64], first: u64, last: u64) -> u64 {
    counters[first as usize..=last as usize].iter().sum()
}

/// Collective decision between the two strategies. Every rank computes the
/// identical value from three reductions over its local unbalanced load.
pub fn decide_on_balanced(
    inter: &dyn Communicator,
    counters: &[u64],
    first: u64,
    last: u64,
    threshold: f64,
) -> TemperResult<bool> {
    if inter.size() == 1 {
        return Ok(false);
    }
    let load = unbalanced_load(counters, first, last) as f64;
    let max = inter.allreduce_max_f64(load)?;
    let min = inter.allreduce_min_f64(load)?;
    let total = inter.allreduce_sum_f64(load)?;
    let mean = total / inter.size() as f64;
    if mean <= 0.0 {
        return Ok(false);
    }
    Ok((max - min) / mean > threshold)
}

/// Unbalanced plan: seeds whose global index falls in this rank's
/// `[first, last]` range, lengths from the counters.
pub fn prepare_unbalanced_links(
    counters: &[u64],
    first: u64,
    last: u64,
    prev_chain: &VectorSequence,
) -> Vec<LinkedChain> {
    let mut links = Vec::new();
    for g in first..=last {
        let count = counters[g as usize];
        if count > 0 {
            links.push(LinkedChain {
                global_index: g,
                seed: prev_chain.position((g - first) as usize).clone(),
                num_positions: count,
            });
        }
    }
    links
}

/// A work unit whose seed lives on `source_rank` but runs on `target_rank`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Exchange {
    global_index: u64,
    source_rank: usize,
    target_rank: usize,
}

/// Greedy balanced assignment: work units sorted by length descending
/// (ties by global index) go to the least loaded rank, lowest rank first.
/// Returns this rank's assigned units and the cross-rank exchanges.
fn balanced_assignment(
    counters: &[u64],
    all_bounds: &[(u64, u64)],
) -> (Vec<(u64, u64, usize)>, Vec<Exchange>) {
    let num_ranks = all_bounds.len();
    let owner_of = |g: u64| -> usize {
        all_bounds
            .iter()
            .position(|(first, last)| g >= *first && g <= *last)
            .unwrap_or(num_ranks - 1)
    };

    let mut units: Vec<(u64, u64)> = counters
        .iter()
        .enumerate()
        .filter(|(_, c)| **c > 0)
        .map(|(g, c)| (g as u64, *c))
        .collect();
    units.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let mut loads = vec![0u64; num_ranks];
    let mut assignment = Vec::with_capacity(units.len());
    let mut exchanges = Vec::new();
    for (g, len) in units {
        let mut target = 0;
        for r in 1..num_ranks {
            if loads[r] < loads[target] {
                target = r;
            }
        }
        loads[target] += len;
        assignment.push((g, len, target));
        let source = owner_of(g);
        if source != target {
            exchanges.push(Exchange {
                global_index: g,
                source_rank: source,
                target_rank: target,
            });
        }
    }
    exchanges.sort_by_key(|e| e.global_index);
    (assignment, exchanges)
}

/// Balanced plan: computes the global assignment, ships seeds whose owner
/// differs from their assigned rank, and returns this rank's links.
///
/// Exchanges are executed in global-index order on every rank, so the
/// pairwise sends and receives match up without deadlock.
pub fn prepare_balanced_links(
    inter: &dyn Communicator,
    counters: &[u64],
    all_bounds: &[(u64, u64)],
    prev_chain: &VectorSequence,
    full_rank: usize,
) -> TemperResult<Vec<LinkedChain>> {
    let me = inter.rank();
    let my_first = all_bounds[me].0;
    let (assignment, exchanges) = balanced_assignment(counters, all_bounds);

    let mut shipped: Vec<(u64, Array1<f64>)> = Vec::new();
    for ex in &exchanges {
        if ex.source_rank == me {
            let local = (ex.global_index - my_first) as usize;
            let seed = prev_chain.position(local);
            inter.send_f64s(
                seed.as_slice().ok_or(TemperError::Transport {
                    rank: full_rank,
                    context: "seed vector is not contiguous".to_string(),
                })?,
                ex.target_rank,
                ex.global_index,
            )?;
        }
        if ex.target_rank == me {
            let data = inter.recv_f64s(ex.source_rank, ex.global_index)?;
            shipped.push((ex.global_index, Array1::from_vec(data)));
        }
    }

    let mut links = Vec::new();
    for (g, len, target) in assignment {
        if target != me {
            continue;
        }
        let (first, last) = all_bounds[me];
        let seed = if g >= first && g <= last {
            prev_chain.position((g - first) as usize).clone()
        } else {
            shipped
                .iter()
                .find(|(idx, _)| *idx == g)
                .map(|(_, seed)| seed.clone())
                .ok_or(TemperError::InternalLogic {
                    rank: full_rank,
                    context: format!("seed {g} assigned here but never shipped"),
                })?
        };
        links.push(LinkedChain {
            global_index: g,
            seed,
            num_positions: len,
        });
    }
    Ok(links)
}
