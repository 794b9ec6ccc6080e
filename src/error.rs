//! reducr error types

use crate::runtime::dtype::DType;
use crate::runtime::tensor::TensorError;

/// reducr result type
pub type Result<T> = std::result::Result<T, Error>;

/// reducr errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error from the tensor runtime layer
    #[error("tensor error: {0}")]
    Tensor(#[from] TensorError),

    /// Invalid construction-time or bucket-layout configuration
    #[error("configuration error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },

    /// Reduction-protocol violation during an iteration
    #[error("protocol error: {reason}")]
    Protocol {
        /// Description of what went wrong
        reason: String,
    },

    /// Failure propagated from a collective operation
    #[error("collective error: {reason}")]
    Collective {
        /// Description of what went wrong
        reason: String,
    },

    /// DType mismatch between a gradient and its bucket view
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// Invalid argument to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// Argument name
        arg: &'static str,
        /// Why it's invalid
        reason: String,
    },
}
