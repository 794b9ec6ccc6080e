//! Bucketed gradient reduction.

pub mod assignment;
pub mod bucket;
pub mod comm_hook;
pub mod core;
pub mod options;
mod verify;

pub use assignment::compute_bucket_assignment_by_size;
pub use bucket::{VariableIndex, VariableLocator};
pub use comm_hook::{AllreduceHook, CommHook, FutureWork, GradBucket, HookValue};
pub use options::{ReducerOptions, DEFAULT_BUCKET_BYTES_CAP, DEFAULT_FIRST_BUCKET_BYTES};
pub use self::core::Reducer;
