//! Bucket assignment by byte size.
//!
//! Groups parameters into buckets so their gradients share one collective
//! call. Buckets never mix dtypes or devices, sparse-gradient parameters
//! always stand alone, and the byte budget sequence lets the first bucket
//! stay small so its reduction launches early in the backward pass.

use crate::error::{Error, Result};
use crate::runtime::device::Device;
use crate::runtime::dtype::DType;
use crate::runtime::tensor::Tensor;

/// Buckets can only coalesce tensors of one type on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BucketKey {
    dtype: DType,
    device: Device,
}

/// Accumulator for one in-progress bucket.
#[derive(Default)]
struct BucketAccumulator {
    indices: Vec<usize>,
    size: u64,
}

/// Assign tensors to byte-bounded buckets keyed by `(dtype, device)`.
///
/// Tensors are considered in input order. Each `(dtype, device)` group fills
/// an accumulator; when the running byte size reaches the group's current
/// budget, the accumulator is emitted as a bucket and the group advances to
/// the next budget in `bucket_size_limits` (the last budget repeats).
/// Tensors flagged in `expect_sparse_gradient` are emitted as singleton
/// buckets immediately.
///
/// When `tensor_indices` is empty, the tensor at position `i` is recorded as
/// index `i` and the resulting buckets are sorted by the smallest index they
/// contain, so bucket order follows parameter order. When `tensor_indices`
/// is provided, position `i` is recorded as `tensor_indices[i]` and emission
/// order is preserved: callers pass tensors in gradient-arrival order and
/// rely on the buckets reflecting it.
///
/// # Errors
///
/// Fails if `tensors` is empty, if `bucket_size_limits` is empty, if
/// `expect_sparse_gradient` or `tensor_indices` is non-empty but disagrees
/// in length with `tensors`, or if an input tensor is itself sparse.
pub fn compute_bucket_assignment_by_size(
    tensors: &[Tensor],
    bucket_size_limits: &[u64],
    expect_sparse_gradient: &[bool],
    tensor_indices: &[usize],
) -> Result<Vec<Vec<usize>>> {
    if tensors.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "tensors",
            reason: "expected at least one tensor".to_string(),
        });
    }
    if bucket_size_limits.is_empty() {
        return Err(Error::InvalidArgument {
            arg: "bucket_size_limits",
            reason: "expected at least one size limit".to_string(),
        });
    }
    if !expect_sparse_gradient.is_empty() && expect_sparse_gradient.len() != tensors.len() {
        return Err(Error::InvalidArgument {
            arg: "expect_sparse_gradient",
            reason: format!(
                "length {} disagrees with {} tensors",
                expect_sparse_gradient.len(),
                tensors.len()
            ),
        });
    }
    if !tensor_indices.is_empty() && tensor_indices.len() != tensors.len() {
        return Err(Error::InvalidArgument {
            arg: "tensor_indices",
            reason: format!(
                "length {} disagrees with {} tensors",
                tensor_indices.len(),
                tensors.len()
            ),
        });
    }

    let mut result: Vec<Vec<usize>> = Vec::with_capacity(tensors.len());

    // Accumulators live in an insertion-ordered list rather than a hash map:
    // leftover buckets must flush in the same order on every process.
    let mut groups: Vec<(BucketKey, BucketAccumulator, usize)> = Vec::new();

    for (position, tensor) in tensors.iter().enumerate() {
        if tensor.is_sparse() {
            return Err(Error::InvalidArgument {
                arg: "tensors",
                reason: "no support for sparse tensors".to_string(),
            });
        }

        let tensor_index = if tensor_indices.is_empty() {
            position
        } else {
            tensor_indices[position]
        };

        // A tensor expecting a sparse gradient cannot coalesce with others;
        // it gets its own bucket.
        if !expect_sparse_gradient.is_empty() && expect_sparse_gradient[tensor_index] {
            result.push(vec![tensor_index]);
            continue;
        }

        let key = BucketKey {
            dtype: tensor.dtype(),
            device: tensor.device(),
        };
        let group_position = match groups.iter().position(|(k, _, _)| *k == key) {
            Some(position) => position,
            None => {
                groups.push((key, BucketAccumulator::default(), 0));
                groups.len() - 1
            }
        };
        let (_, accumulator, limit_index) = &mut groups[group_position];

        accumulator.indices.push(tensor_index);
        accumulator.size += (tensor.numel() * tensor.element_size()) as u64;

        if accumulator.size >= bucket_size_limits[*limit_index] {
            result.push(std::mem::take(&mut accumulator.indices));
            accumulator.size = 0;
            if *limit_index + 1 < bucket_size_limits.len() {
                *limit_index += 1;
            }
        }
    }

    // Flush the partially filled accumulators.
    for (_, accumulator, _) in groups {
        if !accumulator.indices.is_empty() {
            result.push(accumulator.indices);
        }
    }

    // Without explicit indices, tensor order is parameter order; sorting by
    // smallest contained index makes buckets ready in consecutive order
    // during the backward pass. With explicit indices the input is already
    // in gradient-arrival order and emission order is the contract.
    if tensor_indices.is_empty() {
        result.sort_by_key(|bucket| bucket.iter().min().copied());
    }

    Ok(result)
}
