//! Pluggable communication hooks.
//!
//! A registered hook replaces the builtin allreduce for every bucket and
//! takes over the scaling contract: the reducer stops dividing gradients by
//! the world size and treats the hook's result as the authoritative bucket
//! contents. Hooks implement gradient compression, decentralized averaging,
//! and similar schemes without touching the readiness machinery.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::runtime::comm::{ProcessGroup, Work};
use crate::runtime::tensor::Tensor;

/// Per-replica bucket contents handed to a communication hook.
pub struct GradBucket {
    tensors: Vec<Tensor>,
}

impl GradBucket {
    /// Wrap the per-replica flat contents of one bucket.
    pub fn new(tensors: Vec<Tensor>) -> Self {
        Self { tensors }
    }

    /// The per-replica contents, in replica order.
    pub fn tensors(&self) -> &[Tensor] {
        &self.tensors
    }

    /// Consume the bucket, yielding the per-replica contents.
    pub fn into_tensors(self) -> Vec<Tensor> {
        self.tensors
    }
}

/// Value a completed hook future resolves to.
pub type HookValue = Vec<Tensor>;

/// Completion handle for an in-flight hook transformation.
pub trait FutureWork: Send {
    /// Block until the transformation completes.
    fn wait(&mut self) -> Result<()>;

    /// Take the resolved value. Only valid after a successful `wait`.
    fn take_value(&mut self) -> HookValue;
}

/// Pluggable transformation applied to each bucket in place of the builtin
/// allreduce.
///
/// Result tensors must match the input contents in dtype and shape, ordered
/// by replica like the input.
pub trait CommHook: Send {
    /// Launch the transformation for one bucket.
    fn run_hook(&mut self, bucket: GradBucket) -> Box<dyn FutureWork>;

    /// Extract the per-replica result tensors from a resolved future value.
    fn process_future(&mut self, value: HookValue) -> Result<Vec<Tensor>>;
}

/// Communication hook reproducing the builtin behavior: allreduce the
/// bucket, then average by world size once the sum completes.
///
/// Since a registered hook suppresses the reducer's own division, the hook
/// performs it after the wait; the result aliases the input contents.
pub struct AllreduceHook {
    process_group: Arc<dyn ProcessGroup>,
}

impl AllreduceHook {
    /// Create a hook reducing through the given process group.
    pub fn new(process_group: Arc<dyn ProcessGroup>) -> Self {
        Self { process_group }
    }
}

impl CommHook for AllreduceHook {
    fn run_hook(&mut self, bucket: GradBucket) -> Box<dyn FutureWork> {
        let tensors = bucket.into_tensors();
        let work = self.process_group.allreduce(&tensors);
        Box::new(AllreduceFuture {
            work,
            tensors,
            world_size: self.process_group.size(),
        })
    }

    fn process_future(&mut self, value: HookValue) -> Result<Vec<Tensor>> {
        Ok(value)
    }
}

struct AllreduceFuture {
    work: Box<dyn Work>,
    tensors: Vec<Tensor>,
    world_size: usize,
}

impl FutureWork for AllreduceFuture {
    fn wait(&mut self) -> Result<()> {
        self.work.wait()?;
        for tensor in &self.tensors {
            tensor
                .div_scalar(self.world_size as f64)
                .map_err(|err| Error::Collective {
                    reason: format!("averaging after allreduce failed: {err}"),
                })?;
        }
        Ok(())
    }

    fn take_value(&mut self) -> HookValue {
        std::mem::take(&mut self.tensors)
    }
}
