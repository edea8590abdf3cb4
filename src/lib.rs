//! isaforge - GPU module loader and kernel linker
//!
//! Builds device programs into modules, places kernel instruction code in
//! pooled or dedicated device memory, and resolves symbols within a module
//! and across modules before kernels can be dispatched.

#![allow(clippy::new_without_default)] // Constructors mirror the device API
#![allow(clippy::type_complexity)] // Link bookkeeping maps nest deeply

pub mod config;
pub mod device;
pub mod error;
pub mod isa_pool;
pub mod linker;
pub mod logging;
pub mod module;
pub mod program;

pub use config::{MemoryLocality, RuntimeConfig};
pub use device::{Device, DeviceAllocator, GpuAllocation, HostMemoryAllocator, MemoryClass};
pub use error::{ErrorCategory, ForgeResult, IsaForgeError};
pub use isa_pool::{IsaAllocation, IsaPoolAllocator};
pub use linker::{inspect_linkage, perform_dynamic_link, LinkageInspectionFlags};
pub use module::{
    BuildLog, Kernel, LinkageState, Module, ModuleDesc, ModuleFormat, ModuleId, ModuleType,
};
pub use program::{JsonProgramCompiler, ModuleCompiler, ProgramInfo};
