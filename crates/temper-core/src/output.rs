//! Result sinks.
//!
//! The driver emits per-level raw chains, their scalar companions, and the
//! per-level log-evidence factors through a [`ResultSink`]. Persisting
//! anything beyond that is out of scope for the engine.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use serde::Serialize;

use crate::errors::{TemperError, TemperResult};
use crate::sequences::{ScalarSequence, VectorSequence};

/// Filename sentinel meaning "do not write".
pub const NO_OUTPUT_FILE: &str = ".";

pub trait ResultSink {
    fn append_vector_sequence(&mut self, level: u32, seq: &VectorSequence) -> TemperResult<()>;
    fn append_scalar_sequence(&mut self, level: u32, seq: &ScalarSequence) -> TemperResult<()>;
    fn record_log_evidence_factor(&mut self, level: u32, ln_z: f64) -> TemperResult<()>;
    fn record_log_evidence(&mut self, ln_z: f64) -> TemperResult<()>;
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn append_vector_sequence(&mut self, _level: u32, _seq: &VectorSequence) -> TemperResult<()> {
        Ok(())
    }

    fn append_scalar_sequence(&mut self, _level: u32, _seq: &ScalarSequence) -> TemperResult<()> {
        Ok(())
    }

    fn record_log_evidence_factor(&mut self, _level: u32, _ln_z: f64) -> TemperResult<()> {
        Ok(())
    }

    fn record_log_evidence(&mut self, _ln_z: f64) -> TemperResult<()> {
        Ok(())
    }
}

/// Keeps everything in memory; used by tests and by callers that post-process
/// the output themselves.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub vector_sequences: Vec<(u32, VectorSequence)>,
    pub scalar_sequences: Vec<(u32, ScalarSequence)>,
    pub log_evidence_factors: Vec<(u32, f64)>,
    pub log_evidence: Option<f64>,
}

impl ResultSink for MemorySink {
    fn append_vector_sequence(&mut self, level: u32, seq: &VectorSequence) -> TemperResult<()> {
        self.vector_sequences.push((level, seq.clone()));
        Ok(())
    }

    fn append_scalar_sequence(&mut self, level: u32, seq: &ScalarSequence) -> TemperResult<()> {
        self.scalar_sequences.push((level, seq.clone()));
        Ok(())
    }

    fn record_log_evidence_factor(&mut self, level: u32, ln_z: f64) -> TemperResult<()> {
        self.log_evidence_factors.push((level, ln_z));
        Ok(())
    }

    fn record_log_evidence(&mut self, ln_z: f64) -> TemperResult<()> {
        self.log_evidence = Some(ln_z);
        Ok(())
    }
}

/// Writes one bincode document per appended sequence under a directory.
///
/// Only ranks listed in `allowed_ranks` write; everything else is a silent
/// no-op, so every rank can drive the sink unconditionally.
pub struct FileSink {
    dir: PathBuf,
    rank: usize,
    allowed_ranks: IndexSet<usize>,
}

impl FileSink {
    pub fn create(
        dir: impl AsRef<Path>,
        rank: usize,
        allowed_ranks: IndexSet<usize>,
    ) -> TemperResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| TemperError::Output {
            rank,
            message: format!("creating {}: {e}", dir.display()),
        })?;
        Ok(Self {
            dir,
            rank,
            allowed_ranks,
        })
    }

    fn write_allowed(&self) -> bool {
        self.allowed_ranks.contains(&self.rank)
    }

    fn write_document<T: Serialize>(&self, file_name: &str, value: &T) -> TemperResult<()> {
        let path = self.dir.join(file_name);
        let file = File::create(&path).map_err(|e| TemperError::Output {
            rank: self.rank,
            message: format!("creating {}: {e}", path.display()),
        })?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, value).map_err(|e| TemperError::Output {
            rank: self.rank,
            message: format!("serializing {}: {e}", path.display()),
        })?;
        writer.flush().map_err(|e| TemperError::Output {
            rank: self.rank,
            message: format!("flushing {}: {e}", path.display()),
        })
    }
}

impl ResultSink for FileSink {
    fn append_vector_sequence(&mut self, level: u32, seq: &VectorSequence) -> TemperResult<()> {
        if !self.write_allowed() {
            return Ok(());
        }
        let file_name = format!("level{level}_{}_rank{}.bin", seq.name(), self.rank);
        self.write_document(&file_name, seq)
    }

    fn append_scalar_sequence(&mut self, level: u32, seq: &ScalarSequence) -> TemperResult<()> {
        if !self.write_allowed() {
            return Ok(());
        }
        let file_name = format!("level{level}_{}_rank{}.bin", seq.name(), self.rank);
        self.write_document(&file_name, seq)
    }

    fn record_log_evidence_factor(&mut self, level: u32, ln_z: f64) -> TemperResult<()> {
        if !self.write_allowed() {
            return Ok(());
        }
        self.write_document(&format!("level{level}_lnEvidenceFactor.bin"), &ln_z)
    }

    fn record_log_evidence(&mut self, ln_z: f64) -> TemperResult<()> {
        if !self.write_allowed() {
            return Ok(());
        }
        self.write_document("lnEvidence.bin", &ln_z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample_sequences() -> (VectorSequence, ScalarSequence) {
        let mut chain = VectorSequence::new("rawChain");
        chain.append(array![1.0, 2.0]);
        chain.append(array![3.0, 4.0]);
        let mut ll = ScalarSequence::new("rawLogLikelihood");
        ll.push(-0.5);
        ll.push(-1.5);
        (chain, ll)
    }

    #[test]
    fn memory_sink_captures_everything() {
        let (chain, ll) = sample_sequences();
        let mut sink = MemorySink::default();
        sink.append_vector_sequence(1, &chain).unwrap();
        sink.append_scalar_sequence(1, &ll).unwrap();
        sink.record_log_evidence_factor(1, -0.25).unwrap();
        sink.record_log_evidence(-0.25).unwrap();
        assert_eq!(sink.vector_sequences.len(), 1);
        assert_eq!(sink.scalar_sequences[0].1.values(), &[-0.5, -1.5]);
        assert_eq!(sink.log_evidence, Some(-0.25));
    }

    #[test]
    fn file_sink_round_trips_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, ll) = sample_sequences();
        let mut allowed = IndexSet::new();
        allowed.insert(0);
        let mut sink = FileSink::create(dir.path(), 0, allowed).unwrap();
        sink.append_vector_sequence(2, &chain).unwrap();
        sink.append_scalar_sequence(2, &ll).unwrap();
        sink.record_log_evidence(-3.0).unwrap();

        let bytes = std::fs::read(dir.path().join("level2_rawChain_rank0.bin")).unwrap();
        let restored: VectorSequence = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, chain);

        let bytes = std::fs::read(dir.path().join("lnEvidence.bin")).unwrap();
        let ln_z: f64 = bincode::deserialize(&bytes).unwrap();
        assert_eq!(ln_z, -3.0);
    }

    #[test]
    fn file_sink_skips_disallowed_rank() {
        let dir = tempfile::tempdir().unwrap();
        let (chain, _) = sample_sequences();
        let mut allowed = IndexSet::new();
        allowed.insert(0);
        let mut sink = FileSink::create(dir.path(), 3, allowed).unwrap();
        sink.append_vector_sequence(0, &chain).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
