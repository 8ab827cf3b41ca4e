use std::fmt;
use std::str::FromStr;

use crate::error::KoreError;

/// Placement tag carried by every storage.
///
/// The host backend keeps all buffers in host memory; a `Cuda` tag records
/// where the data logically lives so that containers can enforce a uniform
/// placement across their leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    /// CUDA device with ordinal.
    Cuda(usize),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    pub fn is_cuda(&self) -> bool {
        matches!(self, Device::Cuda(_))
    }

    /// CUDA ordinal, if applicable.
    pub fn cuda_index(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) => Some(*idx),
            _ => None,
        }
    }

    /// Whether storages on this device can be backed by a memory-mapped file.
    pub fn supports_memmap(&self) -> bool {
        self.is_cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

impl FromStr for Device {
    type Err = KoreError;

    /// Parses `"cpu"`, `"cuda"` (ordinal 0) and `"cuda:N"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("cpu") {
            return Ok(Device::Cpu);
        }
        if s.eq_ignore_ascii_case("cuda") {
            return Ok(Device::Cuda(0));
        }
        if let Some(idx) = s.strip_prefix("cuda:") {
            return idx
                .parse::<usize>()
                .map(Device::Cuda)
                .map_err(|_| KoreError::StorageError(format!("invalid cuda ordinal in '{s}'")));
        }
        Err(KoreError::StorageError(format!("unknown device '{s}'")))
    }
}
