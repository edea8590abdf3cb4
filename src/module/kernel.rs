//! Dispatch handle for a kernel of a fully linked module

use crate::device::GpuAllocation;
use crate::program::KernelDescriptor;

use super::kernel_data::KernelImmutableData;
use super::ModuleId;

/// Snapshot of everything a command encoder needs to dispatch a kernel.
///
/// Holds strong references to its residency set, so the instruction memory
/// outlives the module if the handle does.
#[derive(Debug, Clone)]
pub struct Kernel {
    module_id: ModuleId,
    descriptor: KernelDescriptor,
    isa_gpu_address: u64,
    isa_size: usize,
    residency: Vec<GpuAllocation>,
}

impl Kernel {
    pub(crate) fn from_immutable_data(module_id: ModuleId, data: &KernelImmutableData) -> Self {
        Kernel {
            module_id,
            descriptor: data.descriptor().clone(),
            isa_gpu_address: data.isa_gpu_address(),
            isa_size: data.isa().size(),
            residency: data.residency().to_vec(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    pub fn descriptor(&self) -> &KernelDescriptor {
        &self.descriptor
    }

    pub fn isa_gpu_address(&self) -> u64 {
        self.isa_gpu_address
    }

    pub fn isa_size(&self) -> usize {
        self.isa_size
    }

    pub fn residency(&self) -> &[GpuAllocation] {
        &self.residency
    }

    pub fn is_resident(&self, allocation: &GpuAllocation) -> bool {
        self.residency.contains(allocation)
    }
}
