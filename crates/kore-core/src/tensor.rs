use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::device::Device;
use crate::dtype::DType;
use crate::error::KoreError;
use crate::shape::{normalize_axis, Shape};
use crate::storage::{Buffer, Element, Storage, StorageMode};
use crate::Result;

type Strides = SmallVec<[usize; 4]>;

/// How logical positions map onto the physical storage.
#[derive(Clone)]
enum Layout {
    /// Classic shape/stride/offset addressing.
    Strided { strides: Strides, offset: usize },
    /// Explicit row-major table of physical offsets, produced by list and
    /// mask indexing so that those results stay aliased to the source.
    Gathered(Arc<[usize]>),
}

/// A multi-dimensional array over shared storage.
///
/// Every structural operation (reshape, permute, unsqueeze, expand, slicing,
/// integer-list and boolean-mask indexing) returns a view: the result
/// shares storage with its source, and in-place writes made through either
/// one are visible through the other. Use [`Tensor::deep_clone`] to break
/// aliasing.
///
/// # Examples
///
/// ```
/// use kore_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// let row = t.select(0, 1).unwrap();
/// row.fill_(0.0).unwrap();
/// assert_eq!(t.to_vec_f32(), vec![1.0, 2.0, 0.0, 0.0]);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    layout: Layout,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    pub(crate) fn dense(storage: Storage, shape: Shape) -> Self {
        let strides = shape.contiguous_strides();
        Self {
            storage,
            shape,
            layout: Layout::Strided { strides, offset: 0 },
        }
    }

    fn with_layout(&self, shape: Shape, layout: Layout) -> Self {
        Self {
            storage: self.storage.clone(),
            shape,
            layout,
        }
    }

    fn from_elements<T: Element>(data: &[T], shape: &[usize]) -> Self
    where
        Buffer: From<Vec<T>>,
    {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self::dense(Storage::new(Buffer::from(data.to_vec()), Device::Cpu), s)
    }

    /// Create a tensor from f32 data with the given shape.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the shape's element count.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        Self::from_elements(data, shape)
    }

    /// Create a tensor from f64 data with the given shape.
    pub fn from_f64(data: &[f64], shape: &[usize]) -> Self {
        Self::from_elements(data, shape)
    }

    /// Create a tensor from i64 data with the given shape.
    pub fn from_i64(data: &[i64], shape: &[usize]) -> Self {
        Self::from_elements(data, shape)
    }

    /// Create a boolean tensor (e.g. a mask) with the given shape.
    pub fn from_bool(data: &[bool], shape: &[usize]) -> Self {
        Self::from_elements(data, shape)
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::zeros_on(shape, dtype, Device::Cpu)
    }

    /// Create a tensor of zeros on a specific device.
    pub fn zeros_on(shape: &[usize], dtype: DType, device: Device) -> Self {
        let s = Shape::new(shape);
        Self::dense(Storage::zeros(dtype, s.numel(), device), s)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        let s = Shape::new(shape);
        Self::dense(
            Storage::new(Buffer::full(dtype, s.numel(), value), Device::Cpu),
            s,
        )
    }

    /// Create a tensor of ones (f32).
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0, DType::F32)
    }

    /// Create a scalar tensor from a single f32 value.
    pub fn scalar(value: f32) -> Self {
        Self::from_f32(&[value], &[])
    }

    /// Create a 1-D tensor with values from `start` to `end` (exclusive).
    ///
    /// # Panics
    /// Panics if `step` is zero or if `step` direction doesn't match `start`→`end`.
    pub fn arange(start: f32, end: f32, step: f32) -> Self {
        assert!(step != 0.0, "arange: step must be non-zero");
        assert!(
            (end - start) * step > 0.0 || (end - start).abs() < f32::EPSILON,
            "arange: step direction ({}) does not match start ({}) → end ({})",
            step,
            start,
            end
        );
        let mut data = Vec::new();
        let mut v = start;
        if step > 0.0 {
            while v < end {
                data.push(v);
                v += step;
            }
        } else {
            while v > end {
                data.push(v);
                v += step;
            }
        }
        let len = data.len();
        Self::from_f32(&data, &[len])
    }

    /// Create a tensor with random values from standard normal distribution N(0,1).
    pub fn randn(shape: &[usize]) -> Self {
        use rand::Rng;
        let s = Shape::new(shape);
        let numel = s.numel();
        let mut rng = rand::thread_rng();
        // Box-Muller transform for normal distribution
        let data: Vec<f32> = (0..numel)
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self::from_f32(&data, shape)
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Backing storage handle.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Strides in elements, or `None` for gathered (list/mask indexed) views.
    pub fn strides(&self) -> Option<&[usize]> {
        match &self.layout {
            Layout::Strided { strides, .. } => Some(strides),
            Layout::Gathered(_) => None,
        }
    }

    /// Whether this tensor and `other` view the same allocation.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        self.storage.ptr_eq(&other.storage)
    }

    /// Whether the view addresses a dense row-major block (size-1 dims ignored).
    pub fn is_contiguous(&self) -> bool {
        match &self.layout {
            Layout::Strided { strides, .. } => {
                let expected = self.shape.contiguous_strides();
                self.shape
                    .dims()
                    .iter()
                    .zip(strides.iter().zip(expected.iter()))
                    .all(|(&d, (&s, &e))| d <= 1 || s == e)
            }
            Layout::Gathered(_) => false,
        }
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.storage.mode()
    }

    pub fn is_shared(&self) -> bool {
        self.storage_mode() == StorageMode::Shared
    }

    pub fn is_memmapped(&self) -> bool {
        self.storage_mode() == StorageMode::MemoryMapped
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Physical storage offsets of every element, in row-major logical order.
    pub(crate) fn offsets(&self) -> Vec<usize> {
        match &self.layout {
            Layout::Strided { strides, offset } => {
                strided_offsets(self.shape.dims(), strides, *offset)
            }
            Layout::Gathered(offsets) => offsets.to_vec(),
        }
    }

    /// Copy the logical contents into a dense buffer.
    pub fn to_buffer(&self) -> Buffer {
        self.storage.gather(&self.offsets())
    }

    pub fn to_vec_f32(&self) -> Vec<f32> {
        self.to_buffer().to_vec()
    }

    pub fn to_vec_f64(&self) -> Vec<f64> {
        self.to_buffer().to_vec()
    }

    pub fn to_vec_i64(&self) -> Vec<i64> {
        self.to_buffer().to_vec()
    }

    pub fn to_vec_bool(&self) -> Vec<bool> {
        self.to_buffer().to_vec()
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> Result<f64> {
        if self.numel() != 1 {
            return Err(KoreError::ShapeMismatch {
                expected: vec![1],
                got: self.shape.dims().to_vec(),
            });
        }
        Ok(self.to_vec_f64()[0])
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// Apply a stride-level transform. Gathered views are transformed through
    /// their offset table so the result stays aliased.
    fn remap<F>(&self, f: F) -> Result<Tensor>
    where
        F: FnOnce(&[usize], &[usize], usize) -> Result<(Shape, Strides, usize)>,
    {
        match &self.layout {
            Layout::Strided { strides, offset } => {
                let (shape, strides, offset) = f(self.shape.dims(), strides.as_slice(), *offset)?;
                Ok(self.with_layout(shape, Layout::Strided { strides, offset }))
            }
            Layout::Gathered(table) => {
                let base = self.shape.contiguous_strides();
                let (shape, strides, offset) = f(self.shape.dims(), base.as_slice(), 0)?;
                let mapped: Vec<usize> = strided_offsets(shape.dims(), &strides, offset)
                    .into_iter()
                    .map(|p| table[p])
                    .collect();
                Ok(self.with_layout(shape, Layout::Gathered(mapped.into())))
            }
        }
    }

    fn check_axis(&self, axis: isize) -> Result<usize> {
        normalize_axis(axis, self.ndim(), 0).ok_or(KoreError::InvalidAxis {
            axis,
            ndim: self.ndim(),
        })
    }

    /// Reorder dimensions: output dim `i` is input dim `order[i]`.
    pub fn permute(&self, order: &[usize]) -> Result<Tensor> {
        let ndim = self.ndim();
        if order.len() != ndim {
            return Err(KoreError::ShapeMismatch {
                expected: (0..ndim).collect(),
                got: order.to_vec(),
            });
        }
        let mut seen = vec![false; ndim];
        for &o in order {
            if o >= ndim || seen[o] {
                return Err(KoreError::InvalidAxis {
                    axis: o as isize,
                    ndim,
                });
            }
            seen[o] = true;
        }
        self.remap(|dims, strides, offset| {
            let shape = Shape::new(dims).permuted(order);
            let strides = order.iter().map(|&o| strides[o]).collect();
            Ok((shape, strides, offset))
        })
    }

    /// Swap two dimensions.
    pub fn transpose(&self, a: isize, b: isize) -> Result<Tensor> {
        let a = self.check_axis(a)?;
        let b = self.check_axis(b)?;
        let mut order: Vec<usize> = (0..self.ndim()).collect();
        order.swap(a, b);
        self.permute(&order)
    }

    /// Insert a size-1 dimension at `axis` (`-1` appends).
    pub fn unsqueeze(&self, axis: isize) -> Result<Tensor> {
        let axis = normalize_axis(axis, self.ndim(), 1).ok_or(KoreError::InvalidAxis {
            axis,
            ndim: self.ndim(),
        })?;
        self.unsqueeze_at(axis)
    }

    pub(crate) fn unsqueeze_at(&self, axis: usize) -> Result<Tensor> {
        self.remap(|dims, strides, offset| {
            let stride = if axis < dims.len() {
                strides[axis] * dims[axis]
            } else {
                1
            };
            let mut new_strides: Strides = strides.into();
            new_strides.insert(axis, stride);
            Ok((Shape::new(dims).inserted(axis, 1), new_strides, offset))
        })
    }

    /// Remove `axis` if it has size 1; otherwise return an unchanged view.
    pub fn squeeze_dim(&self, axis: isize) -> Result<Tensor> {
        let axis = self.check_axis(axis)?;
        if self.shape.dims()[axis] != 1 {
            return Ok(self.clone());
        }
        self.remap(|dims, strides, offset| {
            let mut new_strides: Strides = strides.into();
            new_strides.remove(axis);
            Ok((Shape::new(dims).removed(axis), new_strides, offset))
        })
    }

    /// Remove every size-1 dimension.
    pub fn squeeze(&self) -> Result<Tensor> {
        self.remap(|dims, strides, offset| {
            let keep: Vec<usize> = (0..dims.len()).filter(|&i| dims[i] != 1).collect();
            let shape: Vec<usize> = keep.iter().map(|&i| dims[i]).collect();
            let strides = keep.iter().map(|&i| strides[i]).collect();
            Ok((Shape::from(shape), strides, offset))
        })
    }

    /// Broadcast to `shape` without copying (size-1 and missing leading dims
    /// get stride 0).
    pub fn expand(&self, shape: &[usize]) -> Result<Tensor> {
        if shape == self.shape.dims() {
            return Ok(self.clone());
        }
        let ndim = self.ndim();
        if shape.len() < ndim {
            return Err(KoreError::ShapeMismatch {
                expected: shape.to_vec(),
                got: self.shape.dims().to_vec(),
            });
        }
        let lead = shape.len() - ndim;
        self.remap(|dims, strides, offset| {
            let mut new_strides = Strides::with_capacity(shape.len());
            for (i, &target) in shape.iter().enumerate() {
                if i < lead {
                    new_strides.push(0);
                    continue;
                }
                let src = dims[i - lead];
                if src == target {
                    new_strides.push(strides[i - lead]);
                } else if src == 1 {
                    new_strides.push(0);
                } else {
                    return Err(KoreError::ShapeMismatch {
                        expected: shape.to_vec(),
                        got: dims.to_vec(),
                    });
                }
            }
            Ok((Shape::new(shape), new_strides, offset))
        })
    }

    /// Restrict `axis` to `len` elements starting at `start`.
    pub fn narrow(&self, axis: isize, start: usize, len: usize) -> Result<Tensor> {
        let axis = self.check_axis(axis)?;
        let size = self.shape.dims()[axis];
        if start + len > size {
            return Err(KoreError::InvalidIndex(format!(
                "narrow [{start}, {}) exceeds dimension {axis} of size {size}",
                start + len
            )));
        }
        self.slice_at(axis, start, len, 1)
    }

    pub(crate) fn slice_at(&self, axis: usize, start: usize, len: usize, step: usize) -> Result<Tensor> {
        self.remap(|dims, strides, offset| {
            let mut shape: Vec<usize> = dims.to_vec();
            shape[axis] = len;
            let mut new_strides: Strides = strides.into();
            new_strides[axis] = strides[axis] * step;
            let offset = if len > 0 { offset + start * strides[axis] } else { offset };
            Ok((Shape::from(shape), new_strides, offset))
        })
    }

    /// Pick element `index` along `axis`, dropping that dimension.
    pub fn select(&self, axis: isize, index: isize) -> Result<Tensor> {
        let axis = self.check_axis(axis)?;
        let size = self.shape.dims()[axis];
        let idx = normalize_axis(index, size, 0).ok_or_else(|| {
            KoreError::InvalidIndex(format!(
                "index {index} is out of bounds for dimension {axis} with size {size}"
            ))
        })?;
        self.select_at(axis, idx)
    }

    pub(crate) fn select_at(&self, axis: usize, index: usize) -> Result<Tensor> {
        self.remap(|dims, strides, offset| {
            let mut new_strides: Strides = strides.into();
            new_strides.remove(axis);
            Ok((
                Shape::new(dims).removed(axis),
                new_strides,
                offset + index * strides[axis],
            ))
        })
    }

    /// Gather `picks` from the flattened block of dims `axis..axis + span`,
    /// replacing that block by a single dimension of length `picks.len()`.
    pub(crate) fn take_at(&self, axis: usize, span: usize, picks: &[usize]) -> Tensor {
        let dims = self.shape.dims();
        let outer: usize = dims[..axis].iter().product();
        let mid: usize = dims[axis..axis + span].iter().product();
        let inner: usize = dims[axis + span..].iter().product();
        let offsets = self.offsets();

        let mut table = Vec::with_capacity(outer * picks.len() * inner);
        for o in 0..outer {
            for &p in picks {
                let base = (o * mid + p) * inner;
                table.extend_from_slice(&offsets[base..base + inner]);
            }
        }

        let mut shape: Vec<usize> = dims[..axis].to_vec();
        shape.push(picks.len());
        shape.extend_from_slice(&dims[axis + span..]);
        self.with_layout(Shape::from(shape), Layout::Gathered(table.into()))
    }

    /// Reshape, inferring at most one `-1` dimension. Always returns a view:
    /// dense tensors keep strided addressing, others switch to an offset table.
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let resolved = self
            .shape
            .resolve_reshape(new_shape)
            .ok_or_else(|| KoreError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.to_vec(),
            })?;
        if resolved == self.shape {
            return Ok(self.clone());
        }
        match &self.layout {
            Layout::Strided { offset, .. } if self.is_contiguous() => {
                let strides = resolved.contiguous_strides();
                let offset = *offset;
                Ok(self.with_layout(resolved, Layout::Strided { strides, offset }))
            }
            Layout::Gathered(table) => {
                let table = Arc::clone(table);
                Ok(self.with_layout(resolved, Layout::Gathered(table)))
            }
            Layout::Strided { .. } => {
                let table: Arc<[usize]> = self.offsets().into();
                Ok(self.with_layout(resolved, Layout::Gathered(table)))
            }
        }
    }

    /// Reshape to a fully specified shape.
    pub fn view(&self, shape: &[usize]) -> Result<Tensor> {
        let target: Vec<isize> = shape.iter().map(|&d| d as isize).collect();
        self.reshape(&target)
    }

    // =========================================================================
    // Copies
    // =========================================================================

    /// `self` when already dense, otherwise a dense copy.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            return self.clone();
        }
        self.deep_clone()
    }

    /// Dense copy in fresh private storage on the same device.
    pub fn deep_clone(&self) -> Tensor {
        Self::dense(
            Storage::new(self.to_buffer(), self.device()),
            self.shape.clone(),
        )
    }

    /// Copy to `device`. Returns an aliasing handle when already there.
    pub fn to(&self, device: Device) -> Result<Tensor> {
        if self.device() == device {
            return Ok(self.clone());
        }
        Ok(Self::dense(
            Storage::new(self.to_buffer(), device),
            self.shape.clone(),
        ))
    }

    // =========================================================================
    // In-place writes (visible through every view of the storage)
    // =========================================================================

    /// Copy `src` (broadcast to this shape, cast to this dtype) into this view.
    pub fn copy_(&self, src: &Tensor) -> Result<()> {
        let src = src.expand(self.shape.dims())?;
        let values = src.to_buffer();
        self.storage.scatter(&self.offsets(), &values)
    }

    /// Set every element of this view to `value`.
    pub fn fill_(&self, value: f64) -> Result<()> {
        self.storage.fill(&self.offsets(), value);
        Ok(())
    }

    pub fn zero_(&self) -> Result<()> {
        self.fill_(0.0)
    }

    /// Move the backing storage to shared memory.
    pub fn share_memory_(&self) -> Result<()> {
        self.storage.share_memory_()
    }

    /// Move the backing storage to memory-mapped memory.
    pub fn memmap_(&self) -> Result<()> {
        self.storage.memmap_()
    }
}

/// Physical offsets of a strided view, in row-major logical order.
fn strided_offsets(dims: &[usize], strides: &[usize], offset: usize) -> Vec<usize> {
    let numel: usize = dims.iter().product();
    let mut out = Vec::with_capacity(numel);
    if numel == 0 {
        return out;
    }
    let ndim = dims.len();
    let mut idx = vec![0usize; ndim];
    let mut cur = offset;
    for _ in 0..numel {
        out.push(cur);
        for d in (0..ndim).rev() {
            idx[d] += 1;
            cur += strides[d];
            if idx[d] < dims[d] {
                break;
            }
            cur -= strides[d] * dims[d];
            idx[d] = 0;
        }
    }
    out
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={}, contiguous={}, mode={:?})",
            self.shape,
            self.dtype(),
            self.device(),
            self.is_contiguous(),
            self.storage_mode(),
        )
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.to_vec_f64();
        if values.len() <= 20 {
            write!(f, "tensor({:?}, shape={}, dtype={})", values, self.shape, self.dtype())
        } else {
            write!(
                f,
                "tensor([{:.4}, {:.4}, ..., {:.4}], shape={}, dtype={})",
                values[0],
                values[1],
                values[values.len() - 1],
                self.shape,
                self.dtype()
            )
        }
    }
}
