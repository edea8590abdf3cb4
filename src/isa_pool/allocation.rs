//! Instruction-memory ranges handed out by the ISA pool allocator

use crate::device::{DeviceResult, GpuAllocation, WeakGpuAllocation};
use crate::error::{ForgeResult, IsaForgeError};

/// A sub-range of a shared pool page.
///
/// Holds only a weak reference to the page; the pool allocator owns it and
/// tracks how many ranges are outstanding.
#[derive(Debug, Clone)]
pub struct SharedIsaRange {
    pub(crate) parent: WeakGpuAllocation,
    pub(crate) offset_in_parent: usize,
    pub(crate) sub_allocation_size: usize,
    pub(crate) gpu_address: u64,
}

impl SharedIsaRange {
    pub fn parent_id(&self) -> u64 {
        self.parent.id()
    }

    pub fn offset_in_parent(&self) -> usize {
        self.offset_in_parent
    }

    pub fn sub_allocation_size(&self) -> usize {
        self.sub_allocation_size
    }

    fn parent(&self) -> ForgeResult<GpuAllocation> {
        self.parent.upgrade().ok_or_else(|| {
            IsaForgeError::Internal(format!(
                "ISA pool page #{} released while still referenced",
                self.parent.id()
            ))
        })
    }
}

/// Instruction memory owned by one kernel
#[derive(Debug)]
pub enum IsaAllocation {
    /// Exclusively owned allocation
    Dedicated(GpuAllocation),
    /// Range inside a pool page
    Shared(SharedIsaRange),
}

impl IsaAllocation {
    pub fn gpu_address(&self) -> u64 {
        match self {
            IsaAllocation::Dedicated(a) => a.gpu_address(),
            IsaAllocation::Shared(r) => r.gpu_address,
        }
    }

    pub fn size(&self) -> usize {
        match self {
            IsaAllocation::Dedicated(a) => a.size(),
            IsaAllocation::Shared(r) => r.sub_allocation_size,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, IsaAllocation::Shared(_))
    }

    /// The allocation that must be resident when this code runs
    pub fn residency_allocation(&self) -> ForgeResult<GpuAllocation> {
        match self {
            IsaAllocation::Dedicated(a) => Ok(a.clone()),
            IsaAllocation::Shared(r) => r.parent(),
        }
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> ForgeResult<()> {
        self.check_range(offset, bytes.len())?;
        let result: DeviceResult<()> = match self {
            IsaAllocation::Dedicated(a) => a.write(offset, bytes),
            IsaAllocation::Shared(r) => r.parent()?.write(r.offset_in_parent + offset, bytes),
        };
        Ok(result?)
    }

    pub fn read(&self, offset: usize, len: usize) -> ForgeResult<Vec<u8>> {
        self.check_range(offset, len)?;
        let result = match self {
            IsaAllocation::Dedicated(a) => a.read(offset, len),
            IsaAllocation::Shared(r) => r.parent()?.read(r.offset_in_parent + offset, len),
        };
        Ok(result?)
    }

    fn check_range(&self, offset: usize, len: usize) -> ForgeResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(IsaForgeError::Internal(format!(
                "ISA access {}+{} outside {}-byte range",
                offset,
                len,
                self.size()
            ))),
        }
    }
}
