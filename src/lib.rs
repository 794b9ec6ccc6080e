//! # reducr
//!
//! **Bucketed gradient reduction for data-parallel training.**
//!
//! During a data-parallel backward pass, every rank produces the same set
//! of parameter gradients and they must be averaged before the optimizer
//! steps. Reducing one tensor at a time wastes collective bandwidth;
//! waiting for the whole backward pass wastes overlap. reducr sits in
//! between: gradients are grouped into byte-bounded buckets, each bucket
//! coalesces into one flat buffer, and the buffer is allreduced the moment
//! its last gradient lands, while later gradients are still being computed.
//!
//! ## Structure
//!
//! - [`runtime`] — the seams onto the external collaborators: strided
//!   tensor handles with aliasing views, the process-group collective
//!   interface, and the differentiation-engine hook registry.
//! - [`reducer`] — the engine itself: bucket assignment by size, the
//!   readiness state machine, unused-parameter detection, cross-process
//!   layout agreement, the arrival-order bucket rebuild, and pluggable
//!   communication hooks.
//!
//! ## Guarantees
//!
//! - Buckets launch in index order on every rank regardless of gradient
//!   arrival order, so collective calls line up across processes.
//! - Bucket views alias the flat buffers: after the first iteration,
//!   gradients write straight into reduction buffers with no copies.
//! - Replica metadata and bucket layouts are verified and synchronized
//!   across processes before any reduction runs.

pub mod error;
pub mod reducer;
pub mod runtime;

pub use error::{Error, Result};
pub use reducer::{
    compute_bucket_assignment_by_size, AllreduceHook, CommHook, FutureWork, GradBucket,
    HookValue, Reducer, ReducerOptions, VariableIndex, VariableLocator,
    DEFAULT_BUCKET_BYTES_CAP, DEFAULT_FIRST_BUCKET_BYTES,
};
pub use runtime::{
    AccumulatorId, CompletedWork, Device, DType, Engine, GraphNode, HookToken, LocalProcessGroup,
    ProcessGroup, Tensor, Variable, Work,
};
