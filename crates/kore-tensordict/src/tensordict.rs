use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use kore_core::{Device, Shape, StorageMode};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::any::AnyTensorDict;
use crate::base::TensorDictBase;
use crate::entry::Entry;
use crate::error::{Result, TensorDictError};
use crate::utils;

struct Inner {
    entries: IndexMap<String, Entry>,
    batch_size: Shape,
    device: Option<Device>,
    mode: StorageMode,
}

/// The eager, storage-owning container.
///
/// Maps keys (in insertion order) to leaf tensors or nested containers,
/// all sharing `batch_size` as their leading shape. Cloning the handle is
/// cheap and preserves identity; use [`TensorDictBase::deep_clone`] for
/// an independent copy.
///
/// # Examples
///
/// ```
/// use kore_core::{DType, Tensor};
/// use kore_tensordict::{TensorDict, TensorDictBase};
///
/// let td = TensorDict::new(
///     [("obs", Tensor::zeros(&[3, 4, 5], DType::F32))],
///     [3, 4],
///     None,
/// )
/// .unwrap();
/// assert_eq!(td.batch_size().dims(), &[3, 4]);
/// assert!(td.set_batch_size(&[4, 4]).is_err());
/// assert_eq!(td.batch_size().dims(), &[3, 4]);
/// ```
#[derive(Clone)]
pub struct TensorDict {
    inner: Arc<RwLock<Inner>>,
}

impl TensorDict {
    /// Build a container from `entries`.
    ///
    /// With `device` set every leaf is moved there; otherwise the device is
    /// taken from the first leaf and the others must agree.
    pub fn new<K, V>(
        entries: impl IntoIterator<Item = (K, V)>,
        batch_size: impl Into<Shape>,
        device: Option<Device>,
    ) -> Result<Self>
    where
        K: Into<String>,
        V: Into<Entry>,
    {
        let td = Self::empty(batch_size, device);
        for (key, value) in entries {
            let key = key.into();
            let mut value = value.into();
            if let Some(device) = device {
                value = value.to(device)?;
            }
            td.set_entry(&key, value)?;
        }
        Ok(td)
    }

    /// Container with no entries.
    pub fn empty(batch_size: impl Into<Shape>, device: Option<Device>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entries: IndexMap::new(),
                batch_size: batch_size.into(),
                device,
                mode: StorageMode::Private,
            })),
        }
    }

    /// Whether both handles refer to the same container.
    pub fn same_as(&self, other: &TensorDict) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Insert an entry already known to satisfy the container's invariants.
    pub(crate) fn insert_unchecked(&self, key: &str, value: Entry) {
        let mut inner = self.inner.write();
        if inner.device.is_none() {
            inner.device = value.device();
        }
        inner.entries.insert(key.to_string(), value);
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.inner.read().mode
    }

    fn set_mode(&self, mode: StorageMode) {
        self.inner.write().mode = mode;
    }
}

impl TensorDictBase for TensorDict {
    fn batch_size(&self) -> Shape {
        self.inner.read().batch_size.clone()
    }

    fn device(&self) -> Option<Device> {
        self.inner.read().device
    }

    fn key_list(&self) -> Vec<String> {
        self.inner.read().entries.keys().cloned().collect()
    }

    fn get(&self, key: &str) -> Result<Entry> {
        self.inner
            .read()
            .entries
            .get(key)
            .cloned()
            .ok_or_else(|| TensorDictError::KeyNotFound(key.to_string()))
    }

    fn set_entry(&self, key: &str, value: Entry) -> Result<()> {
        let (batch_size, device, mode) = {
            let inner = self.inner.read();
            (inner.batch_size.clone(), inner.device, inner.mode)
        };
        utils::check_entry(key, &value, &batch_size, device)?;
        value.apply_mode(mode)?;
        trace!(key, kind = value.kind_name(), shape = %value.shape(), "set entry");
        self.insert_unchecked(key, value);
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.inner
            .write()
            .entries
            .shift_remove(key)
            .map(|_| ())
            .ok_or_else(|| TensorDictError::KeyNotFound(key.to_string()))
    }

    /// Entries are checked in insertion order; the first failure is reported
    /// and the container is left untouched.
    fn set_batch_size(&self, batch_size: &[usize]) -> Result<()> {
        let mut inner = self.inner.write();
        let new = Shape::new(batch_size);
        for (key, value) in &inner.entries {
            utils::check_entry(key, value, &new, None)?;
        }
        debug!(from = %inner.batch_size, to = %new, "batch size changed");
        inner.batch_size = new;
        Ok(())
    }

    fn to_any(&self) -> AnyTensorDict {
        AnyTensorDict::Eager(self.clone())
    }

    fn contiguous(&self) -> Result<TensorDict> {
        Ok(self.clone())
    }

    fn is_shared(&self) -> bool {
        self.storage_mode() == StorageMode::Shared
    }

    fn is_memmapped(&self) -> bool {
        self.storage_mode() == StorageMode::MemoryMapped
    }

    fn share_memory_(&self) -> Result<()> {
        utils::transition(self, StorageMode::Shared)?;
        self.set_mode(StorageMode::Shared);
        Ok(())
    }

    fn memmap_(&self) -> Result<()> {
        if let Some(device) = self.device() {
            if !device.supports_memmap() {
                return Err(TensorDictError::Tensor(kore_core::KoreError::InvalidStorageMode {
                    from: self.storage_mode(),
                    to: StorageMode::MemoryMapped,
                    reason: format!("container on {device} cannot be memory-mapped"),
                }));
            }
        }
        utils::transition(self, StorageMode::MemoryMapped)?;
        self.set_mode(StorageMode::MemoryMapped);
        Ok(())
    }
}

pub(crate) fn fmt_container<T>(f: &mut fmt::Formatter<'_>, name: &str, td: &T) -> fmt::Result
where
    T: TensorDictBase + ?Sized,
{
    write!(f, "{name}(fields={{")?;
    for (i, key) in td.key_list().iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        match td.get(key) {
            Ok(Entry::Tensor(t)) => write!(f, "{key}: {t:?}")?,
            Ok(Entry::Nested(n)) => write!(f, "{key}: {n:?}")?,
            Err(e) => write!(f, "{key}: <{e}>")?,
        }
    }
    write!(f, "}}, batch_size={}, device=", td.batch_size())?;
    match td.device() {
        Some(d) => write!(f, "{d})"),
        None => write!(f, "None)"),
    }
}

impl fmt::Debug for TensorDict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_container(f, "TensorDict", self)
    }
}
