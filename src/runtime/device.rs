//! Device placement labels.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Placement of a tensor's storage.
///
/// This crate performs no device execution itself; the label is used for
/// bucket grouping, usage-map staging, and cross-process verification. The
/// process group is responsible for moving bytes to and from accelerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    /// Host memory
    Cpu,
    /// Accelerator with the given ordinal
    Cuda(u32),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}
