//! Per-kernel state shared by every kernel handle created from a module

use std::sync::Arc;

use crate::device::GpuAllocation;
use crate::error::ForgeResult;
use crate::isa_pool::{IsaAllocation, IsaPoolAllocator};
use crate::program::KernelDescriptor;

/// Descriptor, instruction memory and residency list of one kernel
#[derive(Debug)]
pub struct KernelImmutableData {
    descriptor: KernelDescriptor,
    isa: IsaAllocation,
    isa_pool: Arc<IsaPoolAllocator>,
    residency: Vec<GpuAllocation>,
    isa_copied: bool,
}

impl KernelImmutableData {
    /// Take ownership of `isa`; a shared range is returned to `isa_pool` on drop
    pub fn new(descriptor: KernelDescriptor, isa: IsaAllocation, isa_pool: Arc<IsaPoolAllocator>) -> Self {
        KernelImmutableData {
            descriptor,
            isa,
            isa_pool,
            residency: Vec::new(),
            isa_copied: false,
        }
    }

    /// Make the ISA and the module's global surfaces resident and, when
    /// `copy_now`, upload the code.
    pub fn initialize(&mut self, code: &[u8], copy_now: bool, surfaces: &[GpuAllocation]) -> ForgeResult<()> {
        let isa_allocation = self.isa.residency_allocation()?;
        self.add_resident(isa_allocation);
        for surface in surfaces {
            self.add_resident(surface.clone());
        }
        if copy_now {
            self.copy_isa(code)?;
        }
        Ok(())
    }

    pub fn copy_isa(&mut self, code: &[u8]) -> ForgeResult<()> {
        self.isa.write(0, code)?;
        self.isa_copied = true;
        tracing::trace!(
            "KernelImmutableData: {} bytes of {} copied to 0x{:x}",
            code.len(),
            self.descriptor.name,
            self.isa.gpu_address()
        );
        Ok(())
    }

    /// Write patched bytes over already uploaded code
    pub fn write_isa(&self, offset: usize, bytes: &[u8]) -> ForgeResult<()> {
        self.isa.write(offset, bytes)
    }

    pub fn read_isa(&self, offset: usize, len: usize) -> ForgeResult<Vec<u8>> {
        self.isa.read(offset, len)
    }

    /// Add an allocation unless already present
    pub fn add_resident(&mut self, allocation: GpuAllocation) {
        if !self.residency.contains(&allocation) {
            self.residency.push(allocation);
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.descriptor
    }

    pub fn descriptor_mut(&mut self) -> &mut KernelDescriptor {
        &mut self.descriptor
    }

    pub fn isa(&self) -> &IsaAllocation {
        &self.isa
    }

    pub fn isa_gpu_address(&self) -> u64 {
        self.isa.gpu_address()
    }

    pub fn residency(&self) -> &[GpuAllocation] {
        &self.residency
    }

    pub fn is_isa_copied(&self) -> bool {
        self.isa_copied
    }
}

impl Drop for KernelImmutableData {
    fn drop(&mut self) {
        if let IsaAllocation::Shared(range) = &self.isa {
            self.isa_pool.free_shared_allocation(range);
        }
    }
}
