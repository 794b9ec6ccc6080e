//! Process-group seam: non-blocking collectives over tensor lists.
//!
//! The reduction core only needs three things from a collective library:
//! in-order initiation, non-blocking completion handles, and broadcasts
//! rooted at rank 0. Backends adapt their transport behind [`ProcessGroup`];
//! [`LocalProcessGroup`] is the single-process loopback used by world-size-1
//! deployments and unit tests.

use crate::error::{Error, Result};
use crate::runtime::tensor::Tensor;

/// Handle to a non-blocking collective operation.
///
/// Failures surface from [`Work::wait`], never from initiation.
pub trait Work: Send {
    /// Block until the collective completes, propagating any failure.
    fn wait(&mut self) -> Result<()>;
}

/// A group of processes participating in collective communication.
///
/// Operand shapes and dtypes must be identical across ranks for every call,
/// and every rank must issue the same collectives in the same order.
pub trait ProcessGroup: Send + Sync {
    /// Broadcast the first tensor of rank 0 into every listed tensor on
    /// every rank.
    fn broadcast(&self, tensors: &[Tensor]) -> Box<dyn Work>;

    /// Sum the listed tensors across all ranks (and across list entries
    /// within a rank), writing the result back into each tensor.
    fn allreduce(&self, tensors: &[Tensor]) -> Box<dyn Work>;

    /// Number of participating processes.
    fn size(&self) -> usize;

    /// This process's rank within the group.
    fn rank(&self) -> usize;
}

/// Work handle for an operation that completed at initiation time.
pub struct CompletedWork {
    result: Option<Error>,
}

impl CompletedWork {
    /// A handle that reports success.
    pub fn ok() -> Self {
        Self { result: None }
    }

    /// A handle that reports the given failure on first wait.
    pub fn failed(error: Error) -> Self {
        Self {
            result: Some(error),
        }
    }
}

impl Work for CompletedWork {
    fn wait(&mut self) -> Result<()> {
        match self.result.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Single-process loopback group.
///
/// `allreduce` sums across the list entries (the per-replica contributions
/// of this process) and writes the sum back into each; `broadcast` copies
/// the first entry into the rest. Operations complete at initiation.
pub struct LocalProcessGroup;

impl ProcessGroup for LocalProcessGroup {
    fn broadcast(&self, tensors: &[Tensor]) -> Box<dyn Work> {
        if let Some((source, rest)) = tensors.split_first() {
            for tensor in rest {
                if let Err(err) = tensor.copy_from(source) {
                    return Box::new(CompletedWork::failed(Error::Collective {
                        reason: format!("loopback broadcast failed: {err}"),
                    }));
                }
            }
        }
        Box::new(CompletedWork::ok())
    }

    fn allreduce(&self, tensors: &[Tensor]) -> Box<dyn Work> {
        let Some(first) = tensors.first() else {
            return Box::new(CompletedWork::ok());
        };
        let mut sum = first.to_f64_vec();
        for tensor in &tensors[1..] {
            let values = tensor.to_f64_vec();
            if values.len() != sum.len() {
                return Box::new(CompletedWork::failed(Error::Collective {
                    reason: format!(
                        "loopback allreduce operand length mismatch: {} vs {}",
                        sum.len(),
                        values.len()
                    ),
                }));
            }
            for (acc, value) in sum.iter_mut().zip(values) {
                *acc += value;
            }
        }
        for tensor in tensors {
            if let Err(err) = tensor.copy_from_f64(&sum) {
                return Box::new(CompletedWork::failed(Error::Collective {
                    reason: format!("loopback allreduce failed: {err}"),
                }));
            }
        }
        Box::new(CompletedWork::ok())
    }

    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}
