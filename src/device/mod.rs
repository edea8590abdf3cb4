//! Device abstraction: memory allocator, compiler and ISA pool bundled with
//! the runtime configuration.

pub mod error;
pub mod host_allocator;
pub mod memory;

pub use error::{DeviceError, DeviceResult};
pub use host_allocator::{HostMemoryAllocator, HOST_ALLOCATOR_BASE_ADDRESS};
pub use memory::{
    AllocationRequest, DeviceAllocator, DeviceMemory, GpuAllocation, MemoryClass,
    WeakGpuAllocation,
};

use std::fmt;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::isa_pool::IsaPoolAllocator;
use crate::program::{JsonProgramCompiler, ModuleCompiler};

/// Everything a module needs from the device it is created on
#[derive(Clone)]
pub struct Device {
    allocator: Arc<dyn DeviceAllocator>,
    compiler: Arc<dyn ModuleCompiler>,
    isa_pool: Arc<IsaPoolAllocator>,
    config: RuntimeConfig,
}

impl Device {
    pub fn new(
        allocator: Arc<dyn DeviceAllocator>,
        compiler: Arc<dyn ModuleCompiler>,
        config: RuntimeConfig,
    ) -> Self {
        let isa_pool = Arc::new(IsaPoolAllocator::new(Arc::clone(&allocator), &config));
        tracing::debug!(
            "Device: created (locality={:?}, page={} bytes, debugger={})",
            config.memory_locality,
            config.isa_page_size(),
            config.debugger_attached
        );
        Device {
            allocator,
            compiler,
            isa_pool,
            config,
        }
    }

    /// Simulated device backed by host memory, decoding JSON programs
    pub fn host_simulated(config: RuntimeConfig) -> Self {
        Self::new(
            Arc::new(HostMemoryAllocator::new()),
            Arc::new(JsonProgramCompiler::new()),
            config,
        )
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }

    pub fn compiler(&self) -> &Arc<dyn ModuleCompiler> {
        &self.compiler
    }

    pub fn isa_pool(&self) -> &Arc<IsaPoolAllocator> {
        &self.isa_pool
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("allocator", &self.allocator)
            .field("isa_pools", &self.isa_pool.pool_count())
            .field("config", &self.config)
            .finish()
    }
}
