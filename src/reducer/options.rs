//! Reducer configuration.

use serde::{Deserialize, Serialize};

/// Byte budget of the first bucket.
///
/// The first bucket is kept deliberately small so its reduction launches
/// early in the backward pass, hiding collective latency behind later
/// gradient computation.
pub const DEFAULT_FIRST_BUCKET_BYTES: u64 = 1024 * 1024;

/// Nominal byte budget of every bucket after the first.
pub const DEFAULT_BUCKET_BYTES_CAP: u64 = 25 * 1024 * 1024;

/// Reducer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReducerOptions {
    /// Nominal bucket size in bytes.
    pub bucket_bytes_cap: u64,
    /// Size in bytes of the first bucket produced by a rebuild.
    pub first_bucket_bytes: u64,
    /// Detect parameters that receive no gradient and reduce them as zeros.
    pub find_unused_parameters: bool,
}

impl Default for ReducerOptions {
    fn default() -> Self {
        Self {
            bucket_bytes_cap: DEFAULT_BUCKET_BYTES_CAP,
            first_bucket_bytes: DEFAULT_FIRST_BUCKET_BYTES,
            find_unused_parameters: false,
        }
    }
}

impl ReducerOptions {
    pub fn with_bucket_bytes_cap(mut self, cap: u64) -> Self {
        self.bucket_bytes_cap = cap;
        self
    }

    pub fn with_first_bucket_bytes(mut self, bytes: u64) -> Self {
        self.first_bucket_bytes = bytes;
        self
    }

    pub fn with_find_unused_parameters(mut self, find: bool) -> Self {
        self.find_unused_parameters = find;
        self
    }
}
