//! Common test utilities for module and linker tests
//!
//! Every test gets its own simulated device so allocation accounting can be
//! checked without interference. Programs are built with [`ProgramBuilder`]
//! and fed to the JSON compiler.

// Submodules
mod fixtures;
mod tempfile_helpers;

#[allow(unused_imports)]
pub use fixtures::*;
#[allow(unused_imports)]
pub use tempfile_helpers::*;

use std::sync::Arc;

use isaforge::device::{Device, HostMemoryAllocator};
use isaforge::program::JsonProgramCompiler;
use isaforge::RuntimeConfig;
#[allow(unused_imports)]
pub use serial_test::serial;

/// A simulated device plus a handle on its allocator for leak checks
pub struct TestDevice {
    device: Device,
    host: Arc<HostMemoryAllocator>,
}

#[allow(dead_code)]
impl TestDevice {
    pub fn new(config: RuntimeConfig) -> Self {
        let host = Arc::new(HostMemoryAllocator::new());
        let device = Device::new(host.clone(), Arc::new(JsonProgramCompiler::new()), config);
        TestDevice { device, host }
    }

    /// Device with default configuration
    pub fn default_device() -> Self {
        Self::new(RuntimeConfig::default())
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn host(&self) -> &HostMemoryAllocator {
        &self.host
    }

    /// Panics if any device allocation is still alive
    pub fn assert_no_leak(&self) {
        let live = self.host.live_allocations();
        assert_eq!(
            live, 0,
            "device memory leak: {} allocations ({} bytes) still alive",
            live,
            self.host.live_bytes()
        );
    }
}
