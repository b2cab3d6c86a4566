//! Chain storage: append-only sequences of parameter vectors and scalars.
//!
//! Each level of the sampling driver records three parallel sequences: the
//! chain positions, the log-likelihood at each position, and the log-target
//! at each position. Sequences are partitioned across inter-group ranks;
//! `unified_*` queries reduce over the whole group.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::errors::TemperResult;
use crate::transport::Communicator;

/// Summary statistics of one scalar stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

fn stats_of(values: impl Iterator<Item = f64> + Clone, n: usize) -> SequenceStats {
    if n == 0 {
        return SequenceStats {
            mean: f64::NAN,
            std_dev: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
        };
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let var = if n > 1 {
        values.clone().map(|v| (v - mean) * (v - mean)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };
    SequenceStats {
        mean,
        std_dev: var.sqrt(),
        min: values.clone().fold(f64::INFINITY, f64::min),
        max: values.fold(f64::NEG_INFINITY, f64::max),
    }
}

/// Named append-only sequence of parameter vectors (the local partition of
/// a level's chain).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSequence {
    name: String,
    positions: Vec<Array1<f64>>,
}

impl VectorSequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            positions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn append(&mut self, position: Array1<f64>) {
        self.positions.push(position);
    }

    pub fn position(&self, i: usize) -> &Array1<f64> {
        &self.positions[i]
    }

    pub fn positions(&self) -> &[Array1<f64>] {
        &self.positions
    }

    /// Clears the contents and renames the sequence; used when a level's
    /// sequences are rolled into the "previous" slots.
    pub fn reset(&mut self, name: impl Into<String>) {
        self.positions.clear();
        self.name = name.into();
    }

    /// Total length across all ranks of the group.
    pub fn unified_len(&self, comm: &dyn Communicator) -> TemperResult<usize> {
        Ok(comm.allreduce_sum_u64(self.len() as u64)? as usize)
    }

    /// Per-coordinate summary statistics of the local partition.
    pub fn compute_stats(&self) -> Vec<SequenceStats> {
        let dim = self.positions.first().map(|p| p.len()).unwrap_or(0);
        (0..dim)
            .map(|j| {
                stats_of(
                    self.positions.iter().map(move |p| p[j]),
                    self.positions.len(),
                )
            })
            .collect()
    }

    /// Mean of the local partition, `None` when empty.
    pub fn mean(&self) -> Option<Array1<f64>> {
        let first = self.positions.first()?;
        let mut acc = Array1::<f64>::zeros(first.len());
        for p in &self.positions {
            acc += p;
        }
        Some(acc / self.positions.len() as f64)
    }
}

/// Named append-only sequence of scalars, parallel to a [`VectorSequence`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarSequence {
    name: String,
    values: Vec<f64>,
}

impl ScalarSequence {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn reset(&mut self, name: impl Into<String>) {
        self.values.clear();
        self.name = name.into();
    }

    pub fn unified_len(&self, comm: &dyn Communicator) -> TemperResult<usize> {
        Ok(comm.allreduce_sum_u64(self.len() as u64)? as usize)
    }

    /// Minimum and maximum over the whole group (empty partitions
    /// contribute the identity elements).
    pub fn unified_min_max(&self, comm: &dyn Communicator) -> TemperResult<(f64, f64)> {
        let local_min = self.values.iter().copied().fold(f64::INFINITY, f64::min);
        let local_max = self
            .values
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        Ok((
            comm.allreduce_min_f64(local_min)?,
            comm.allreduce_max_f64(local_max)?,
        ))
    }

    pub fn compute_stats(&self) -> SequenceStats {
        stats_of(self.values.iter().copied(), self.values.len())
    }
}
