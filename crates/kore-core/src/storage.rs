use std::sync::Arc;

use parking_lot::RwLock;

use crate::{DType, Device, KoreError, Result};

/// Scalar element types a [`Buffer`] can hold.
///
/// Conversion goes through `f64`, which is exact for every value the
/// f32/bool variants can hold and for i64 magnitudes below 2^53.
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: DType;
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
    /// The buffer's elements, if it holds this type.
    fn slice_of(buf: &Buffer) -> Option<&[Self]>;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
    fn slice_of(buf: &Buffer) -> Option<&[Self]> {
        match buf {
            Buffer::F32(v) => Some(v),
            _ => None,
        }
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
    fn slice_of(buf: &Buffer) -> Option<&[Self]> {
        match buf {
            Buffer::F64(v) => Some(v),
            _ => None,
        }
    }
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;
    fn slice_of(buf: &Buffer) -> Option<&[Self]> {
        match buf {
            Buffer::I64(v) => Some(v),
            _ => None,
        }
    }
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}

impl Element for bool {
    const DTYPE: DType = DType::Bool;
    fn slice_of(buf: &Buffer) -> Option<&[Self]> {
        match buf {
            Buffer::Bool(v) => Some(v),
            _ => None,
        }
    }
    fn to_f64(self) -> f64 {
        if self {
            1.0
        } else {
            0.0
        }
    }
    fn from_f64(v: f64) -> Self {
        v != 0.0
    }
}

/// Typed, densely packed element buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

/// Run `$body` with `$v` bound to the inner `Vec` of whichever variant `$buf` holds.
macro_rules! with_buffer {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            Buffer::F32($v) => $body,
            Buffer::F64($v) => $body,
            Buffer::I64($v) => $body,
            Buffer::Bool($v) => $body,
        }
    };
}

/// Like `with_buffer!`, rewrapping the result into the same variant.
macro_rules! map_buffer {
    ($buf:expr, $v:ident => $body:expr) => {
        match $buf {
            Buffer::F32($v) => Buffer::F32($body),
            Buffer::F64($v) => Buffer::F64($body),
            Buffer::I64($v) => Buffer::I64($body),
            Buffer::Bool($v) => Buffer::Bool($body),
        }
    };
}

impl Buffer {
    /// Zero-initialised buffer of `numel` elements.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        match dtype {
            DType::F32 => Buffer::F32(vec![0.0; numel]),
            DType::F64 => Buffer::F64(vec![0.0; numel]),
            DType::I64 => Buffer::I64(vec![0; numel]),
            DType::Bool => Buffer::Bool(vec![false; numel]),
        }
    }

    /// Buffer of `numel` copies of `value` (cast to `dtype`).
    pub fn full(dtype: DType, numel: usize, value: f64) -> Self {
        match dtype {
            DType::F32 => Buffer::F32(vec![f32::from_f64(value); numel]),
            DType::F64 => Buffer::F64(vec![value; numel]),
            DType::I64 => Buffer::I64(vec![i64::from_f64(value); numel]),
            DType::Bool => Buffer::Bool(vec![bool::from_f64(value); numel]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
            Buffer::I64(_) => DType::I64,
            Buffer::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        with_buffer!(self, v => v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values at the given physical offsets, in order.
    pub fn gather(&self, offsets: &[usize]) -> Buffer {
        map_buffer!(self, v => offsets.iter().map(|&o| v[o]).collect())
    }

    /// Write `src[i]` to offset `offsets[i]`. `src` is cast to this buffer's dtype.
    pub fn scatter(&mut self, offsets: &[usize], src: &Buffer) -> Result<()> {
        if offsets.len() != src.len() {
            return Err(KoreError::StorageError(format!(
                "scatter: {} offsets but {} values",
                offsets.len(),
                src.len()
            )));
        }
        let src = src.cast(self.dtype());
        match (self, &src) {
            (Buffer::F32(d), Buffer::F32(s)) => scatter_into(d, offsets, s),
            (Buffer::F64(d), Buffer::F64(s)) => scatter_into(d, offsets, s),
            (Buffer::I64(d), Buffer::I64(s)) => scatter_into(d, offsets, s),
            (Buffer::Bool(d), Buffer::Bool(s)) => scatter_into(d, offsets, s),
            _ => unreachable!("source was cast to the destination dtype"),
        }
        Ok(())
    }

    /// Set every listed offset to `value`.
    pub fn fill(&mut self, offsets: &[usize], value: f64) {
        with_buffer!(self, v => fill_into(v, offsets, value))
    }

    /// Convert every element to `dtype`.
    pub fn cast(&self, dtype: DType) -> Buffer {
        if self.dtype() == dtype {
            return self.clone();
        }
        let values = self.to_f64_vec();
        match dtype {
            DType::F32 => Buffer::F32(values.into_iter().map(f32::from_f64).collect()),
            DType::F64 => Buffer::F64(values),
            DType::I64 => Buffer::I64(values.into_iter().map(i64::from_f64).collect()),
            DType::Bool => Buffer::Bool(values.into_iter().map(bool::from_f64).collect()),
        }
    }

    /// Typed copy of the elements. Same-dtype reads are exact; anything
    /// else is cast through `f64`.
    pub fn to_vec<T: Element>(&self) -> Vec<T> {
        match T::slice_of(self) {
            Some(values) => values.to_vec(),
            None => with_buffer!(self, v => v.iter().map(|x| T::from_f64(x.to_f64())).collect()),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        with_buffer!(self, v => v.iter().map(|x| x.to_f64()).collect())
    }
}

fn scatter_into<T: Copy>(dst: &mut [T], offsets: &[usize], src: &[T]) {
    for (&o, &v) in offsets.iter().zip(src.iter()) {
        dst[o] = v;
    }
}

fn fill_into<T: Element>(dst: &mut [T], offsets: &[usize], value: f64) {
    let value = T::from_f64(value);
    for &o in offsets {
        dst[o] = value;
    }
}

impl From<Vec<f32>> for Buffer {
    fn from(v: Vec<f32>) -> Self {
        Buffer::F32(v)
    }
}

impl From<Vec<f64>> for Buffer {
    fn from(v: Vec<f64>) -> Self {
        Buffer::F64(v)
    }
}

impl From<Vec<i64>> for Buffer {
    fn from(v: Vec<i64>) -> Self {
        Buffer::I64(v)
    }
}

impl From<Vec<bool>> for Buffer {
    fn from(v: Vec<bool>) -> Self {
        Buffer::Bool(v)
    }
}

/// How a storage's memory is backed.
///
/// Shared and memory-mapped backing are mutually exclusive; neither changes
/// the logical contents, only whether in-place writes are visible outside
/// the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageMode {
    #[default]
    Private,
    Shared,
    MemoryMapped,
}

struct StorageInner {
    data: RwLock<Buffer>,
    dtype: DType,
    device: Device,
    numel: usize,
    mode: RwLock<StorageMode>,
}

/// Shared, reference-counted, interior-mutable tensor storage.
///
/// Every tensor view of the same storage observes writes made through any
/// other view: there is no copy-on-write.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<StorageInner>,
}

impl Storage {
    /// Wrap a buffer as storage on `device`.
    pub fn new(buffer: Buffer, device: Device) -> Self {
        let dtype = buffer.dtype();
        let numel = buffer.len();
        Self {
            inner: Arc::new(StorageInner {
                data: RwLock::new(buffer),
                dtype,
                device,
                numel,
                mode: RwLock::new(StorageMode::Private),
            }),
        }
    }

    /// Allocate zeroed storage for `numel` elements.
    pub fn zeros(dtype: DType, numel: usize, device: Device) -> Self {
        Self::new(Buffer::zeros(dtype, numel), device)
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    /// Number of physical elements.
    pub fn numel(&self) -> usize {
        self.inner.numel
    }

    pub fn nbytes(&self) -> usize {
        self.inner.dtype.storage_bytes(self.inner.numel)
    }

    pub fn is_cpu(&self) -> bool {
        self.inner.device.is_cpu()
    }

    /// Whether two handles refer to the same allocation.
    pub fn ptr_eq(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handles (tensors and views) to this allocation.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Read the values at `offsets` into a fresh buffer.
    pub fn gather(&self, offsets: &[usize]) -> Buffer {
        self.inner.data.read().gather(offsets)
    }

    /// Copy of the whole physical buffer.
    pub fn snapshot(&self) -> Buffer {
        self.inner.data.read().clone()
    }

    /// Write `values` to `offsets`.
    pub fn scatter(&self, offsets: &[usize], values: &Buffer) -> Result<()> {
        self.inner.data.write().scatter(offsets, values)
    }

    /// Set every listed offset to `value`.
    pub fn fill(&self, offsets: &[usize], value: f64) {
        self.inner.data.write().fill(offsets, value)
    }

    pub fn mode(&self) -> StorageMode {
        *self.inner.mode.read()
    }

    /// Move to shared-memory backing. No-op when already shared.
    pub fn share_memory_(&self) -> Result<()> {
        let mut mode = self.inner.mode.write();
        match *mode {
            StorageMode::Shared => Ok(()),
            StorageMode::MemoryMapped => Err(KoreError::InvalidStorageMode {
                from: StorageMode::MemoryMapped,
                to: StorageMode::Shared,
                reason: "memory-mapped and shared storage are mutually exclusive".into(),
            }),
            StorageMode::Private => {
                *mode = StorageMode::Shared;
                Ok(())
            }
        }
    }

    /// Move to memory-mapped backing. No-op when already mapped.
    pub fn memmap_(&self) -> Result<()> {
        let mut mode = self.inner.mode.write();
        match *mode {
            StorageMode::MemoryMapped => Ok(()),
            from if !self.inner.device.supports_memmap() => Err(KoreError::InvalidStorageMode {
                from,
                to: StorageMode::MemoryMapped,
                reason: format!("storage on {} cannot be memory-mapped", self.inner.device),
            }),
            StorageMode::Shared => Err(KoreError::InvalidStorageMode {
                from: StorageMode::Shared,
                to: StorageMode::MemoryMapped,
                reason: "memory-mapped and shared storage are mutually exclusive".into(),
            }),
            StorageMode::Private => {
                *mode = StorageMode::MemoryMapped;
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("dtype", &self.inner.dtype)
            .field("device", &self.inner.device)
            .field("numel", &self.inner.numel)
            .field("mode", &self.mode())
            .finish()
    }
}
