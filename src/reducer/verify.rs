//! Cross-replica and cross-process agreement checks.
//!
//! Bucket views are derived purely from parameter metadata, so the
//! numerics of a reduction are only correct when every replica and every
//! process agree on that metadata. Agreement inside the process is checked
//! directly; agreement across processes is checked by broadcasting replica
//! 0's sizes and strides from rank 0 and comparing on every receiver.
//! Bucket layouts chosen by a rebuild travel the same way.

use crate::error::{Error, Result};
use crate::reducer::core::Reducer;
use crate::runtime::device::Device;
use crate::runtime::dtype::DType;
use crate::runtime::tensor::Tensor;

impl Reducer {
    /// Every replica in this process must hold the same parameters:
    /// equal count, all requiring gradients, matching sizes, strides,
    /// dtype, and sparse expectation.
    pub(crate) fn verify_replicas_within_process(&self) -> Result<()> {
        for (replica_index, replica) in self.replicas.iter().enumerate() {
            if replica.len() != self.replicas[0].len() {
                return Err(Error::Config {
                    reason: "model replicas must have an equal number of parameters".to_string(),
                });
            }
            if self.expect_sparse_gradients[replica_index].len()
                != self.expect_sparse_gradients[0].len()
            {
                return Err(Error::Config {
                    reason: "expected the number of entries in expect_sparse_gradients to be \
                             equal across replicas"
                        .to_string(),
                });
            }
            for (variable_index, variable) in replica.iter().enumerate() {
                if !variable.requires_grad() {
                    return Err(Error::Config {
                        reason: format!(
                            "variable {variable_index} must require a gradient (have \
                             `requires_grad` set)"
                        ),
                    });
                }
                let reference = &self.replicas[0][variable_index];
                if variable.shape() != reference.shape() {
                    return Err(Error::Config {
                        reason: format!(
                            "variable {variable_index} must have identical sizes across model \
                             replicas"
                        ),
                    });
                }
                if variable.strides() != reference.strides() {
                    return Err(Error::Config {
                        reason: format!(
                            "variable {variable_index} must have identical strides across model \
                             replicas"
                        ),
                    });
                }
                if variable.dtype() != reference.dtype() {
                    return Err(Error::Config {
                        reason: format!(
                            "variable {variable_index} must have identical dtype across model \
                             replicas"
                        ),
                    });
                }
                if self.expect_sparse_gradients[replica_index][variable_index]
                    != self.expect_sparse_gradients[0][variable_index]
                {
                    return Err(Error::Config {
                        reason: format!(
                            "variable {variable_index} must either expect a sparse gradient on \
                             all replicas or on none"
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Replica 0's parameter sizes and strides must be identical on every
    /// process. Rank 0 broadcasts its metadata; every receiver compares
    /// element-wise and names the first parameter that disagrees.
    pub(crate) fn verify_replica0_across_processes(&self) -> Result<()> {
        let mut length = 0;
        for variable in &self.replicas[0] {
            length += 2 * variable.shape().len();
        }

        // Rank 0 is the broadcast source, but filling the buffer on every
        // rank keeps the work aligned.
        let mut values: Vec<i64> = Vec::with_capacity(length);
        for variable in &self.replicas[0] {
            values.extend(variable.shape().iter().map(|&size| size as i64));
            values.extend(variable.strides().iter().map(|&stride| stride as i64));
        }
        let metadata = Tensor::from_slice(&values, &[length], Device::Cpu);

        // The process group may only transport device tensors.
        let metadata_dev = metadata.clone_to(self.replicas[0][0].device());
        let mut work = self.process_group.broadcast(&[metadata_dev.clone()]);
        work.wait()?;

        let control = Tensor::zeros(&[length], DType::I64, Device::Cpu);
        control.copy_from(&metadata_dev)?;
        let control_values = control.to_vec::<i64>()?;

        let mut cursor = 0;
        for (variable_index, variable) in self.replicas[0].iter().enumerate() {
            for &size in variable.shape() {
                if control_values[cursor] != size as i64 {
                    return Err(Error::Config {
                        reason: format!(
                            "replicas[0][{variable_index}] in this process with sizes {:?} \
                             appears not to match sizes of the same param in process 0",
                            variable.shape()
                        ),
                    });
                }
                cursor += 1;
            }
            for &stride in variable.strides() {
                if control_values[cursor] != stride as i64 {
                    return Err(Error::Config {
                        reason: format!(
                            "replicas[0][{variable_index}] in this process with strides {:?} \
                             appears not to match strides of the same param in process 0",
                            variable.strides()
                        ),
                    });
                }
                cursor += 1;
            }
        }
        Ok(())
    }

    /// Replace `bucket_indices` with rank 0's layout.
    ///
    /// The indices travel first, as one i32 tensor with the bucket count in
    /// a trailing slot: its length is the total parameter count plus one,
    /// which every rank knows without communicating. The per-bucket sizes
    /// follow once the count is known.
    pub(crate) fn sync_bucket_indices(&self, bucket_indices: &mut Vec<Vec<usize>>) -> Result<()> {
        let mut num_buckets = bucket_indices.len();
        let mut bucket_sizes = Vec::with_capacity(num_buckets);
        let mut total_size = 0;
        for bucket in bucket_indices.iter() {
            bucket_sizes.push(bucket.len());
            total_size += bucket.len();
        }
        let device = self.replicas[0][0].device();

        let mut indices_values: Vec<i32> = Vec::with_capacity(total_size + 1);
        for bucket in bucket_indices.iter() {
            for &index in bucket {
                indices_values.push(index as i32);
            }
        }
        indices_values.push(num_buckets as i32);

        let indices_tensor = Tensor::from_slice(&indices_values, &[total_size + 1], Device::Cpu);
        let indices_dev = indices_tensor.clone_to(device);
        let mut work = self.process_group.broadcast(&[indices_dev.clone()]);
        work.wait()?;
        indices_tensor.copy_from(&indices_dev)?;
        let indices_values = indices_tensor.to_vec::<i32>()?;

        num_buckets = indices_values[total_size] as usize;

        // A rank that built fewer buckets than rank 0 pads with its last
        // size; only rank 0's values survive the broadcast anyway.
        let mut size_values: Vec<i32> = Vec::with_capacity(num_buckets);
        for index in 0..num_buckets {
            let clamped = index.min(bucket_sizes.len().saturating_sub(1));
            size_values.push(bucket_sizes.get(clamped).copied().unwrap_or(0) as i32);
        }
        let sizes_tensor = Tensor::from_slice(&size_values, &[num_buckets], Device::Cpu);
        let sizes_dev = sizes_tensor.clone_to(device);
        let mut work = self.process_group.broadcast(&[sizes_dev.clone()]);
        work.wait()?;
        sizes_tensor.copy_from(&sizes_dev)?;
        let size_values = sizes_tensor.to_vec::<i32>()?;

        bucket_indices.clear();
        bucket_indices.reserve(num_buckets);
        let mut cursor = 0;
        for &bucket_size in &size_values {
            let mut bucket = Vec::with_capacity(bucket_size as usize);
            for _ in 0..bucket_size {
                bucket.push(indices_values[cursor] as usize);
                cursor += 1;
            }
            bucket_indices.push(bucket);
        }
        Ok(())
    }
}
