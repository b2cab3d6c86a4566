//! Cluster transport abstraction.
//!
//! The engine never names a concrete message-passing backend. It talks to a
//! [`Communicator`] trait whose surface is exactly the set of collective and
//! point-to-point operations the sampling driver needs: sum/min/max
//! reductions, broadcast, blocking send/receive, barrier, and rank/size
//! queries. An MPI binding can implement the trait for production clusters;
//! this module ships two in-process implementations:
//!
//! - [`SelfComm`]: the single-process identity transport (every reduction
//!   returns its input, broadcast is a no-op). Used for serial runs.
//! - [`ThreadComm`]: a multi-rank transport over shared memory, used by the
//!   multi-rank tests via [`LocalCluster`].
//!
//! Two nested process groups exist per run (see [`ProcessTopology`]): the
//! *sub* group cooperates on a single model evaluation, and the *inter*
//! group holds one representative per sub group. Statistical reductions run
//! on the inter group only.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::errors::{TemperError, TemperResult};

/// Narrow contract for a process group.
///
/// All operations are collective unless named `send`/`recv`; every rank of
/// the group must call collectives in the same order. Reductions combine
/// contributions in rank order so that results are bitwise reproducible.
pub trait Communicator: Send + Sync {
    /// This process's rank within the group, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    fn allreduce_sum_f64(&self, value: f64) -> TemperResult<f64>;
    fn allreduce_sum_u64(&self, value: u64) -> TemperResult<u64>;
    fn allreduce_min_f64(&self, value: f64) -> TemperResult<f64>;
    fn allreduce_max_f64(&self, value: f64) -> TemperResult<f64>;

    /// Replaces `buf` on every rank with the root's contents.
    fn broadcast_f64s(&self, buf: &mut [f64], root: usize) -> TemperResult<()>;
    fn broadcast_u64s(&self, buf: &mut [u64], root: usize) -> TemperResult<()>;

    /// Blocking tagged point-to-point. Messages between a pair of ranks with
    /// the same tag are delivered in send order.
    fn send_f64s(&self, buf: &[f64], to: usize, tag: u64) -> TemperResult<()>;
    fn recv_f64s(&self, from: usize, tag: u64) -> TemperResult<Vec<f64>>;
    fn send_u64s(&self, buf: &[u64], to: usize, tag: u64) -> TemperResult<()>;
    fn recv_u64s(&self, from: usize, tag: u64) -> TemperResult<Vec<u64>>;

    fn barrier(&self) -> TemperResult<()>;
}

/// The two nested process groups a rank belongs to.
///
/// `inter` is `Some` exactly on sub-group representatives (sub rank 0);
/// only those ranks participate in statistical reductions. `full_rank`
/// identifies the process across the whole run and is used in error
/// messages.
#[derive(Clone)]
pub struct ProcessTopology {
    pub sub: Arc<dyn Communicator>,
    pub inter: Option<Arc<dyn Communicator>>,
    pub full_rank: usize,
}

impl ProcessTopology {
    /// Topology of a serial run: one process, its own representative.
    pub fn single() -> Self {
        Self {
            sub: Arc::new(SelfComm),
            inter: Some(Arc::new(SelfComm)),
            full_rank: 0,
        }
    }

    pub fn is_inter_member(&self) -> bool {
        self.inter.is_some()
    }

    /// Size of the inter group (1 when this rank is not a member).
    pub fn inter_size(&self) -> usize {
        self.inter.as_ref().map(|c| c.size()).unwrap_or(1)
    }
}

/// Asserts that `value` is identical (within `tol`) on every rank of
/// `comm`.
///
/// The redundant checks at each decision point of the driver are
/// contractual: disagreement means nondeterminism in user code, and the run
/// must abort before the collective schedules diverge. The
/// `relaxed-agreement-checks` feature compiles this to a no-op.
#[cfg(not(feature = "relaxed-agreement-checks"))]
pub fn check_same_value_across_ranks(
    comm: &dyn Communicator,
    full_rank: usize,
    value: f64,
    tol: f64,
    context: &str,
) -> TemperResult<()> {
    let min = comm.allreduce_min_f64(value)?;
    let max = comm.allreduce_max_f64(value)?;
    let spread = max - min;
    if spread.abs() > tol {
        return Err(TemperError::RankDisagreement {
            rank: full_rank,
            context: context.to_string(),
            spread,
        });
    }
    Ok(())
}

#[cfg(feature = "relaxed-agreement-checks")]
pub fn check_same_value_across_ranks(
    _comm: &dyn Communicator,
    _full_rank: usize,
    _value: f64,
    _tol: f64,
    _context: &str,
) -> TemperResult<()> {
    Ok(())
}

/// Identity transport for a single-process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_sum_f64(&self, value: f64) -> TemperResult<f64> {
        Ok(value)
    }

    fn allreduce_sum_u64(&self, value: u64) -> TemperResult<u64> {
        Ok(value)
    }

    fn allreduce_min_f64(&self, value: f64) -> TemperResult<f64> {
        Ok(value)
    }

    fn allreduce_max_f64(&self, value: f64) -> TemperResult<f64> {
        Ok(value)
    }

    fn broadcast_f64s(&self, _buf: &mut [f64], _root: usize) -> TemperResult<()> {
        Ok(())
    }

    fn broadcast_u64s(&self, _buf: &mut [u64], _root: usize) -> TemperResult<()> {
        Ok(())
    }

    fn send_f64s(&self, _buf: &[f64], _to: usize, _tag: u64) -> TemperResult<()> {
        Err(TemperError::Transport {
            rank: 0,
            context: "point-to-point send on a single-process group".to_string(),
        })
    }

    fn recv_f64s(&self, _from: usize, _tag: u64) -> TemperResult<Vec<f64>> {
        Err(TemperError::Transport {
            rank: 0,
            context: "point-to-point recv on a single-process group".to_string(),
        })
    }

    fn send_u64s(&self, _buf: &[u64], _to: usize, _tag: u64) -> TemperResult<()> {
        Err(TemperError::Transport {
            rank: 0,
            context: "point-to-point send on a single-process group".to_string(),
        })
    }

    fn recv_u64s(&self, _from: usize, _tag: u64) -> TemperResult<Vec<u64>> {
        Err(TemperError::Transport {
            rank: 0,
            context: "point-to-point recv on a single-process group".to_string(),
        })
    }

    fn barrier(&self) -> TemperResult<()> {
        Ok(())
    }
}

/// Rendezvous state shared by every collective operation of a
/// [`ThreadComm`] group. Ranks issue collectives in lockstep, so one cell
/// is enough; contributions are stored per rank and folded in rank order
/// when the last rank arrives, keeping results bitwise reproducible.
struct CollectiveCell {
    entered: usize,
    leaving: usize,
    generation: u64,
    slots_f64: Vec<f64>,
    slots_u64: Vec<u64>,
    result_f64: f64,
    result_u64: u64,
    words: Vec<u64>,
}

struct ThreadCommShared {
    size: usize,
    cell: Mutex<CollectiveCell>,
    cell_cv: Condvar,
    mail: Mutex<HashMap<(usize, usize, u64), VecDeque<Vec<u64>>>>,
    mail_cv: Condvar,
}

/// In-process multi-rank transport over shared memory.
///
/// Created as a group via [`ThreadComm::group`]; each element is handed to
/// one thread. Collectives rendezvous on a shared cell; point-to-point uses
/// tagged mailboxes (sends never block).
pub struct ThreadComm {
    rank: usize,
    shared: Arc<ThreadCommShared>,
}

#[derive(Clone, Copy)]
enum Fold {
    SumF64,
    MinF64,
    MaxF64,
    SumU64,
    Broadcast { root: usize },
    Barrier,
}

impl ThreadComm {
    /// Creates a connected group of `size` communicators.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        assert!(size > 0, "group must have at least one rank");
        let shared = Arc::new(ThreadCommShared {
            size,
            cell: Mutex::new(CollectiveCell {
                entered: 0,
                leaving: 0,
                generation: 0,
                slots_f64: vec![0.0; size],
                slots_u64: vec![0; size],
                result_f64: 0.0,
                result_u64: 0,
                words: Vec::new(),
            }),
            cell_cv: Condvar::new(),
            mail: Mutex::new(HashMap::new()),
            mail_cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// One collective round. The result slots are read under the lock
    /// before `leaving` is decremented, so a rank racing ahead into the
    /// next round cannot overwrite a value a slower rank has yet to read.
    fn rendezvous(
        &self,
        value_f64: f64,
        value_u64: u64,
        words: Option<Vec<u64>>,
        fold: Fold,
    ) -> (f64, u64, Vec<u64>) {
        let sh = &self.shared;
        let mut cell = sh.cell.lock().unwrap();
        while cell.leaving > 0 {
            cell = sh.cell_cv.wait(cell).unwrap();
        }
        cell.slots_f64[self.rank] = value_f64;
        cell.slots_u64[self.rank] = value_u64;
        if let Fold::Broadcast { root } = fold {
            if self.rank == root {
                cell.words = words.expect("broadcast root must supply a payload");
            }
        }
        cell.entered += 1;
        let gen = cell.generation;
        if cell.entered == sh.size {
            match fold {
                Fold::SumF64 => cell.result_f64 = cell.slots_f64.iter().sum(),
                Fold::MinF64 => {
                    cell.result_f64 = cell.slots_f64.iter().copied().fold(f64::INFINITY, f64::min)
                }
                Fold::MaxF64 => {
                    cell.result_f64 = cell
                        .slots_f64
                        .iter()
                        .copied()
                        .fold(f64::NEG_INFINITY, f64::max)
                }
                Fold::SumU64 => cell.result_u64 = cell.slots_u64.iter().sum(),
                Fold::Broadcast { .. } | Fold::Barrier => {}
            }
            cell.entered = 0;
            cell.leaving = sh.size;
            cell.generation = gen.wrapping_add(1);
            sh.cell_cv.notify_all();
        } else {
            while cell.generation == gen {
                cell = sh.cell_cv.wait(cell).unwrap();
            }
        }
        let out = (
            cell.result_f64,
            cell.result_u64,
            match fold {
                Fold::Broadcast { .. } => cell.words.clone(),
                _ => Vec::new(),
            },
        );
        cell.leaving -= 1;
        if cell.leaving == 0 {
            sh.cell_cv.notify_all();
        }
        out
    }

    fn reduce_f64(&self, value: f64, fold: Fold) -> f64 {
        self.rendezvous(value, 0, None, fold).0
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn allreduce_sum_f64(&self, value: f64) -> TemperResult<f64> {
        Ok(self.reduce_f64(value, Fold::SumF64))
    }

    fn allreduce_sum_u64(&self, value: u64) -> TemperResult<u64> {
        Ok(self.rendezvous(0.0, value, None, Fold::SumU64).1)
    }

    fn allreduce_min_f64(&self, value: f64) -> TemperResult<f64> {
        Ok(self.reduce_f64(value, Fold::MinF64))
    }

    fn allreduce_max_f64(&self, value: f64) -> TemperResult<f64> {
        Ok(self.reduce_f64(value, Fold::MaxF64))
    }

    fn broadcast_f64s(&self, buf: &mut [f64], root: usize) -> TemperResult<()> {
        let words = if self.rank == root {
            Some(buf.iter().map(|v| v.to_bits()).collect())
        } else {
            None
        };
        let (_, _, words) = self.rendezvous(0.0, 0, words, Fold::Broadcast { root });
        if words.len() != buf.len() {
            return Err(TemperError::Transport {
                rank: self.rank,
                context: format!(
                    "broadcast length mismatch: root sent {}, local buffer holds {}",
                    words.len(),
                    buf.len()
                ),
            });
        }
        for (dst, src) in buf.iter_mut().zip(words.iter()) {
            *dst = f64::from_bits(*src);
        }
        Ok(())
    }

    fn broadcast_u64s(&self, buf: &mut [u64], root: usize) -> TemperResult<()> {
        let words = if self.rank == root {
            Some(buf.to_vec())
        } else {
            None
        };
        let (_, _, words) = self.rendezvous(0.0, 0, words, Fold::Broadcast { root });
        if words.len() != buf.len() {
            return Err(TemperError::Transport {
                rank: self.rank,
                context: format!(
                    "broadcast length mismatch: root sent {}, local buffer holds {}",
                    words.len(),
                    buf.len()
                ),
            });
        }
        buf.copy_from_slice(&words);
        Ok(())
    }

    fn send_f64s(&self, buf: &[f64], to: usize, tag: u64) -> TemperResult<()> {
        self.send_u64s(&buf.iter().map(|v| v.to_bits()).collect::<Vec<_>>(), to, tag)
    }

    fn recv_f64s(&self, from: usize, tag: u64) -> TemperResult<Vec<f64>> {
        Ok(self
            .recv_u64s(from, tag)?
            .into_iter()
            .map(f64::from_bits)
            .collect())
    }

    fn send_u64s(&self, buf: &[u64], to: usize, tag: u64) -> TemperResult<()> {
        if to >= self.size() {
            return Err(TemperError::Transport {
                rank: self.rank,
                context: format!("send to rank {to} outside group of {}", self.size()),
            });
        }
        let mut mail = self.shared.mail.lock().unwrap();
        mail.entry((self.rank, to, tag))
            .or_default()
            .push_back(buf.to_vec());
        self.shared.mail_cv.notify_all();
        Ok(())
    }

    fn recv_u64s(&self, from: usize, tag: u64) -> TemperResult<Vec<u64>> {
        if from >= self.size() {
            return Err(TemperError::Transport {
                rank: self.rank,
                context: format!("recv from rank {from} outside group of {}", self.size()),
            });
        }
        let key = (from, self.rank, tag);
        let mut mail = self.shared.mail.lock().unwrap();
        loop {
            if let Some(queue) = mail.get_mut(&key) {
                if let Some(msg) = queue.pop_front() {
                    return Ok(msg);
                }
            }
            mail = self.shared.mail_cv.wait(mail).unwrap();
        }
    }

    fn barrier(&self) -> TemperResult<()> {
        self.rendezvous(0.0, 0, None, Fold::Barrier);
        Ok(())
    }
}

/// Runs one closure per rank on its own thread, handing each a
/// [`ProcessTopology`] whose inter group spans all ranks and whose sub
/// group is the rank alone. Results are returned in rank order.
pub struct LocalCluster;

impl LocalCluster {
    pub fn run<T, F>(n_ranks: usize, f: F) -> Vec<T>
    where
        F: Fn(ProcessTopology) -> T + Sync,
        T: Send,
    {
        let comms = ThreadComm::group(n_ranks);
        std::thread::scope(|scope| {
            let f = &f;
            let handles: Vec<_> = comms
                .into_iter()
                .enumerate()
                .map(|(rank, comm)| {
                    scope.spawn(move || {
                        let topology = ProcessTopology {
                            sub: Arc::new(SelfComm),
                            inter: Some(Arc::new(comm)),
                            full_rank: rank,
                        };
                        f(topology)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("cluster rank panicked"))
                .collect()
        })
    }
}
