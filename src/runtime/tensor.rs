//! Strided tensor handles over shared storage.
//!
//! This is the crate's seam onto the tensor engine: the minimal surface the
//! reduction core needs, backed by a host-side reference implementation.
//! Handles are cheap to clone and share storage; views produced by
//! [`Tensor::as_strided`], [`Tensor::narrow`], and [`Tensor::view`] alias
//! the base tensor, so writing through a view writes the underlying buffer.
//! A small COO sparse layout exists only for the one-tensor-per-bucket
//! sparse gradient passthrough.

use std::fmt;
use std::sync::Arc;

use half::{bf16, f16};
use parking_lot::RwLock;

use crate::runtime::device::Device;
use crate::runtime::dtype::DType;

/// Tensor-layer result type
pub type TensorResult<T> = std::result::Result<T, TensorError>;

/// Errors from the tensor runtime layer
#[derive(Debug, thiserror::Error)]
pub enum TensorError {
    /// Shape and strides disagree on rank
    #[error("shape rank {rank} does not match strides rank {strides}")]
    RankStrideMismatch {
        /// Number of dimensions in the shape
        rank: usize,
        /// Number of stride entries
        strides: usize,
    },

    /// A view would read past the end of its storage
    #[error("view at offset {offset} spans {span} elements but storage holds {storage}")]
    OutOfBounds {
        /// Storage offset of the view
        offset: usize,
        /// Elements the view would touch
        span: usize,
        /// Total storage length
        storage: usize,
    },

    /// `view` requires a contiguous source
    #[error("cannot view a non-contiguous tensor")]
    NonContiguousView,

    /// Element counts disagree
    #[error("element count mismatch: expected {expected}, got {got}")]
    NumelMismatch {
        /// Expected element count
        expected: usize,
        /// Actual element count
        got: usize,
    },

    /// DTypes disagree
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        /// Expected dtype
        expected: DType,
        /// Actual dtype
        got: DType,
    },

    /// Operation requires a dense (strided) tensor
    #[error("expected dense layout, found sparse")]
    ExpectedDense,

    /// Operation requires a floating-point tensor
    #[error("expected floating-point dtype, found {got}")]
    ExpectedFloat {
        /// Actual dtype
        got: DType,
    },

    /// Narrow range falls outside the dimension
    #[error("narrow out of range: start {start} + length {length} > size {size} in dim {dim}")]
    NarrowRange {
        /// Dimension being narrowed
        dim: usize,
        /// Start of the range
        start: usize,
        /// Length of the range
        length: usize,
        /// Size of the dimension
        size: usize,
    },

    /// Element index out of bounds
    #[error("index {index} out of bounds for {numel} elements")]
    IndexOutOfBounds {
        /// Requested flat index
        index: usize,
        /// Number of elements
        numel: usize,
    },
}

/// Typed element access into tensor storage.
pub trait Element: Copy {
    /// The dtype this element type maps to.
    const DTYPE: DType;

    /// Read one element from storage.
    fn load(storage: &Storage, index: usize) -> Self;
    /// Write one element into storage.
    fn store(storage: &mut Storage, index: usize, value: Self);
}

macro_rules! impl_element {
    ($ty:ty, $dtype:expr, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = $dtype;

            fn load(storage: &Storage, index: usize) -> Self {
                match storage {
                    Storage::$variant(values) => values[index],
                    _ => unreachable!("storage dtype checked by caller"),
                }
            }

            fn store(storage: &mut Storage, index: usize, value: Self) {
                match storage {
                    Storage::$variant(values) => values[index] = value,
                    _ => unreachable!("storage dtype checked by caller"),
                }
            }
        }
    };
}

impl_element!(f32, DType::F32, F32);
impl_element!(f64, DType::F64, F64);
impl_element!(f16, DType::F16, F16);
impl_element!(bf16, DType::BF16, BF16);
impl_element!(i32, DType::I32, I32);
impl_element!(i64, DType::I64, I64);

/// Typed backing buffer.
#[derive(Debug)]
pub enum Storage {
    /// 32-bit float buffer
    F32(Vec<f32>),
    /// 64-bit float buffer
    F64(Vec<f64>),
    /// 16-bit IEEE float buffer
    F16(Vec<f16>),
    /// 16-bit brain float buffer
    BF16(Vec<bf16>),
    /// 32-bit signed integer buffer
    I32(Vec<i32>),
    /// 64-bit signed integer buffer
    I64(Vec<i64>),
}

impl Storage {
    fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Self::F32(vec![0.0; len]),
            DType::F64 => Self::F64(vec![0.0; len]),
            DType::F16 => Self::F16(vec![f16::ZERO; len]),
            DType::BF16 => Self::BF16(vec![bf16::ZERO; len]),
            DType::I32 => Self::I32(vec![0; len]),
            DType::I64 => Self::I64(vec![0; len]),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::F16(v) => v.len(),
            Self::BF16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::I64(v) => v.len(),
        }
    }

    fn get_f64(&self, index: usize) -> f64 {
        match self {
            Self::F32(v) => f64::from(v[index]),
            Self::F64(v) => v[index],
            Self::F16(v) => v[index].to_f64(),
            Self::BF16(v) => v[index].to_f64(),
            Self::I32(v) => f64::from(v[index]),
            Self::I64(v) => v[index] as f64,
        }
    }

    fn set_f64(&mut self, index: usize, value: f64) {
        match self {
            Self::F32(v) => v[index] = value as f32,
            Self::F64(v) => v[index] = value,
            Self::F16(v) => v[index] = f16::from_f64(value),
            Self::BF16(v) => v[index] = bf16::from_f64(value),
            Self::I32(v) => v[index] = value as i32,
            Self::I64(v) => v[index] = value as i64,
        }
    }
}

/// Row-major contiguous strides for a shape.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    let mut acc = 1;
    for (stride, &size) in strides.iter_mut().zip(shape.iter()).rev() {
        *stride = acc;
        acc *= size;
    }
    strides
}

/// Visit the storage index of every logical element in row-major order.
fn for_each_storage_index(
    shape: &[usize],
    strides: &[usize],
    offset: usize,
    mut f: impl FnMut(usize),
) {
    if shape.iter().any(|&d| d == 0) {
        return;
    }
    let mut index = vec![0usize; shape.len()];
    let mut linear = offset;
    loop {
        f(linear);
        let mut dim = shape.len();
        loop {
            if dim == 0 {
                return;
            }
            dim -= 1;
            index[dim] += 1;
            linear += strides[dim];
            if index[dim] < shape[dim] {
                break;
            }
            linear -= strides[dim] * shape[dim];
            index[dim] = 0;
        }
    }
}

/// A strided handle into shared storage.
///
/// Cloning a `Tensor` clones the handle, not the data: both clones observe
/// the same buffer. [`Tensor::is_alias_of`] reports whether two handles share
/// storage, which is the aliasing relation the bucket-view contract is
/// written in terms of.
#[derive(Clone)]
pub struct Tensor {
    storage: Arc<RwLock<Storage>>,
    sparse_indices: Option<Arc<Vec<i64>>>,
    shape: Vec<usize>,
    strides: Vec<usize>,
    offset: usize,
    dtype: DType,
    device: Device,
}

impl Tensor {
    /// Allocate a zero-filled dense tensor.
    pub fn zeros(shape: &[usize], dtype: DType, device: Device) -> Tensor {
        let numel = shape.iter().product();
        Tensor {
            storage: Arc::new(RwLock::new(Storage::zeros(dtype, numel))),
            sparse_indices: None,
            strides: contiguous_strides(shape),
            shape: shape.to_vec(),
            offset: 0,
            dtype,
            device,
        }
    }

    /// Build a dense tensor from a typed slice.
    pub fn from_slice<T: Element>(data: &[T], shape: &[usize], device: Device) -> Tensor {
        let tensor = Tensor::zeros(shape, T::DTYPE, device);
        debug_assert_eq!(data.len(), tensor.numel());
        {
            let mut storage = tensor.storage.write();
            for (index, &value) in data.iter().enumerate() {
                T::store(&mut storage, index, value);
            }
        }
        tensor
    }

    /// Build a COO sparse tensor from flat indices into the dense shape and
    /// one value per index.
    pub fn sparse_coo<T: Element>(
        indices: Vec<i64>,
        values: &[T],
        shape: &[usize],
        device: Device,
    ) -> TensorResult<Tensor> {
        if indices.len() != values.len() {
            return Err(TensorError::NumelMismatch {
                expected: indices.len(),
                got: values.len(),
            });
        }
        let mut storage = Storage::zeros(T::DTYPE, values.len());
        for (index, &value) in values.iter().enumerate() {
            T::store(&mut storage, index, value);
        }
        Ok(Tensor {
            storage: Arc::new(RwLock::new(storage)),
            sparse_indices: Some(Arc::new(indices)),
            shape: shape.to_vec(),
            strides: Vec::new(),
            offset: 0,
            dtype: T::DTYPE,
            device,
        })
    }

    /// Logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Strides, in elements. Empty for sparse tensors.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Offset into storage, in elements.
    pub fn storage_offset(&self) -> usize {
        self.offset
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Device placement.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        self.dtype.element_size()
    }

    /// Number of logical elements (dense shape product).
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// True for the COO sparse layout.
    pub fn is_sparse(&self) -> bool {
        self.sparse_indices.is_some()
    }

    /// Number of stored values in a sparse tensor; `numel` for dense.
    pub fn nnz(&self) -> usize {
        match &self.sparse_indices {
            Some(indices) => indices.len(),
            None => self.numel(),
        }
    }

    /// Flat indices of a sparse tensor's stored values.
    pub fn sparse_indices(&self) -> Option<&[i64]> {
        self.sparse_indices.as_deref().map(|v| v.as_slice())
    }

    /// True if two handles share the same storage.
    pub fn is_alias_of(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// True if logical order matches storage order with no gaps.
    pub fn is_contiguous(&self) -> bool {
        if self.is_sparse() {
            return false;
        }
        let mut expected = 1usize;
        for (&size, &stride) in self.shape.iter().zip(self.strides.iter()).rev() {
            // Singleton dimensions are contiguous regardless of stride.
            if size == 1 {
                continue;
            }
            if stride != expected {
                return false;
            }
            expected *= size;
        }
        true
    }

    /// True if the elements cover a dense storage block under some
    /// permutation of dimensions, with no element visited twice.
    pub fn is_non_overlapping_and_dense(&self) -> bool {
        if self.is_sparse() {
            return false;
        }
        if self.numel() <= 1 {
            return true;
        }
        let mut dims: Vec<(usize, usize)> = self
            .shape
            .iter()
            .zip(self.strides.iter())
            .filter(|(&size, _)| size != 1)
            .map(|(&size, &stride)| (stride, size))
            .collect();
        dims.sort_unstable();
        let mut expected = 1usize;
        for (stride, size) in dims {
            if stride != expected {
                return false;
            }
            expected *= size;
        }
        true
    }

    fn check_dense(&self) -> TensorResult<()> {
        if self.is_sparse() {
            return Err(TensorError::ExpectedDense);
        }
        Ok(())
    }

    /// Create an aliasing view with an explicit shape, strides, and storage
    /// offset.
    pub fn as_strided(
        &self,
        shape: &[usize],
        strides: &[usize],
        offset: usize,
    ) -> TensorResult<Tensor> {
        self.check_dense()?;
        if shape.len() != strides.len() {
            return Err(TensorError::RankStrideMismatch {
                rank: shape.len(),
                strides: strides.len(),
            });
        }
        let storage_len = self.storage.read().len();
        if shape.iter().all(|&d| d > 0) {
            let span = 1 + shape
                .iter()
                .zip(strides.iter())
                .map(|(&size, &stride)| (size - 1) * stride)
                .sum::<usize>();
            if offset + span > storage_len {
                return Err(TensorError::OutOfBounds {
                    offset,
                    span,
                    storage: storage_len,
                });
            }
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            sparse_indices: None,
            shape: shape.to_vec(),
            strides: strides.to_vec(),
            offset,
            dtype: self.dtype,
            device: self.device,
        })
    }

    /// Aliasing view restricted to `[start, start + length)` along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, length: usize) -> TensorResult<Tensor> {
        self.check_dense()?;
        let size = self.shape[dim];
        if start + length > size {
            return Err(TensorError::NarrowRange {
                dim,
                start,
                length,
                size,
            });
        }
        let mut shape = self.shape.clone();
        shape[dim] = length;
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            sparse_indices: None,
            shape,
            strides: self.strides.clone(),
            offset: self.offset + start * self.strides[dim],
            dtype: self.dtype,
            device: self.device,
        })
    }

    /// Aliasing reshape of a contiguous tensor.
    pub fn view(&self, shape: &[usize]) -> TensorResult<Tensor> {
        self.check_dense()?;
        if !self.is_contiguous() {
            return Err(TensorError::NonContiguousView);
        }
        let numel: usize = shape.iter().product();
        if numel != self.numel() {
            return Err(TensorError::NumelMismatch {
                expected: self.numel(),
                got: numel,
            });
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            sparse_indices: None,
            strides: contiguous_strides(shape),
            shape: shape.to_vec(),
            offset: self.offset,
            dtype: self.dtype,
            device: self.device,
        })
    }

    /// Deep copy onto a device.
    pub fn clone_to(&self, device: Device) -> Tensor {
        let mut out = Tensor::zeros(&self.shape, self.dtype, device);
        out.sparse_indices = self.sparse_indices.clone();
        if self.is_sparse() {
            let mut storage = Storage::zeros(self.dtype, self.nnz());
            let src = self.storage.read();
            for index in 0..self.nnz() {
                storage.set_f64(index, src.get_f64(index));
            }
            out.storage = Arc::new(RwLock::new(storage));
            out.strides = Vec::new();
            return out;
        }
        let values = self.to_f64_vec();
        out.write_f64(&values);
        out
    }

    /// Read every element in logical order as f64.
    ///
    /// This is the transport form collective adapters reduce in; integer
    /// tensors carry metadata-scale values, which f64 represents exactly.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let storage = self.storage.read();
        let mut values = Vec::with_capacity(self.nnz());
        if self.is_sparse() {
            for index in 0..self.nnz() {
                values.push(storage.get_f64(index));
            }
        } else {
            for_each_storage_index(&self.shape, &self.strides, self.offset, |index| {
                values.push(storage.get_f64(index));
            });
        }
        values
    }

    fn write_f64(&self, values: &[f64]) {
        let mut storage = self.storage.write();
        if self.is_sparse() {
            for (index, &value) in values.iter().enumerate() {
                storage.set_f64(index, value);
            }
        } else {
            let mut cursor = 0;
            for_each_storage_index(&self.shape, &self.strides, self.offset, |index| {
                storage.set_f64(index, values[cursor]);
                cursor += 1;
            });
        }
    }

    /// Overwrite every element with values read from `values` in logical
    /// order.
    pub fn copy_from_f64(&self, values: &[f64]) -> TensorResult<()> {
        if values.len() != self.nnz() {
            return Err(TensorError::NumelMismatch {
                expected: self.nnz(),
                got: values.len(),
            });
        }
        self.write_f64(values);
        Ok(())
    }

    /// Copy `src` into `self` elementwise. Dtypes must match; element counts
    /// must match. Copies across devices are permitted (host/device staging
    /// of the usage maps relies on this).
    pub fn copy_from(&self, src: &Tensor) -> TensorResult<()> {
        if src.dtype != self.dtype {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype,
                got: src.dtype,
            });
        }
        if src.nnz() != self.nnz() {
            return Err(TensorError::NumelMismatch {
                expected: self.nnz(),
                got: src.nnz(),
            });
        }
        // Read fully before writing so overlapping storage cannot deadlock
        // or tear.
        let values = src.to_f64_vec();
        self.write_f64(&values);
        Ok(())
    }

    /// Copy `src * scale` into `self` in one fused pass.
    pub fn copy_from_scaled(&self, src: &Tensor, scale: f64) -> TensorResult<()> {
        if !self.dtype.is_floating_point() {
            return Err(TensorError::ExpectedFloat { got: self.dtype });
        }
        if src.dtype != self.dtype {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype,
                got: src.dtype,
            });
        }
        if src.nnz() != self.nnz() {
            return Err(TensorError::NumelMismatch {
                expected: self.nnz(),
                got: src.nnz(),
            });
        }
        let mut values = src.to_f64_vec();
        for value in &mut values {
            *value *= scale;
        }
        self.write_f64(&values);
        Ok(())
    }

    /// Divide every element by `divisor` in place.
    pub fn div_scalar(&self, divisor: f64) -> TensorResult<()> {
        if !self.dtype.is_floating_point() {
            return Err(TensorError::ExpectedFloat { got: self.dtype });
        }
        let mut values = self.to_f64_vec();
        for value in &mut values {
            *value /= divisor;
        }
        self.write_f64(&values);
        Ok(())
    }

    /// Zero every element in place.
    pub fn fill_zero(&self) {
        let len = self.nnz();
        self.write_f64(&vec![0.0; len]);
    }

    /// Read every element in logical order with the requested type.
    pub fn to_vec<T: Element>(&self) -> TensorResult<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype,
                got: T::DTYPE,
            });
        }
        let storage = self.storage.read();
        let mut values = Vec::with_capacity(self.nnz());
        if self.is_sparse() {
            for index in 0..self.nnz() {
                values.push(T::load(&storage, index));
            }
        } else {
            for_each_storage_index(&self.shape, &self.strides, self.offset, |index| {
                values.push(T::load(&storage, index));
            });
        }
        Ok(values)
    }

    fn storage_index_of(&self, index: usize) -> TensorResult<usize> {
        if index >= self.numel() {
            return Err(TensorError::IndexOutOfBounds {
                index,
                numel: self.numel(),
            });
        }
        let mut remaining = index;
        let mut linear = self.offset;
        for (&size, &stride) in self.shape.iter().zip(self.strides.iter()).rev() {
            linear += (remaining % size) * stride;
            remaining /= size;
        }
        // Row-major unravel walks dimensions from the innermost out, so the
        // loop above consumes the flat index in reverse dimension order.
        debug_assert_eq!(remaining, 0);
        Ok(linear)
    }

    /// Read the i32 element at a flat logical index.
    pub fn i32_at(&self, index: usize) -> TensorResult<i32> {
        if self.dtype != DType::I32 {
            return Err(TensorError::DTypeMismatch {
                expected: DType::I32,
                got: self.dtype,
            });
        }
        self.check_dense()?;
        let linear = self.storage_index_of(index)?;
        let storage = self.storage.read();
        Ok(i32::load(&storage, linear))
    }

    /// Write the i32 element at a flat logical index.
    pub fn set_i32(&self, index: usize, value: i32) -> TensorResult<()> {
        if self.dtype != DType::I32 {
            return Err(TensorError::DTypeMismatch {
                expected: DType::I32,
                got: self.dtype,
            });
        }
        self.check_dense()?;
        let linear = self.storage_index_of(index)?;
        let mut storage = self.storage.write();
        i32::store(&mut storage, linear, value);
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .field("sparse", &self.is_sparse())
            .finish()
    }
}
