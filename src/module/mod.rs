//! Modules, their kernels and the diagnostics produced while building them

pub mod build_log;
pub mod build_options;
pub mod kernel;
pub mod kernel_data;
#[allow(clippy::module_inception)]
pub mod module;

pub use build_log::BuildLog;
pub use build_options::BuildOptions;
pub use kernel::Kernel;
pub use kernel_data::KernelImmutableData;
pub use module::{LinkageState, Module, ModuleDesc, ModuleId};

use serde::{Deserialize, Serialize};

/// Who the module is built for; builtin code goes to internal ISA memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    #[default]
    User,
    Builtin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleFormat {
    /// Device binary, only decoded
    Native,
    /// Portable IR, compiled with the build flags
    IntermediateRepresentation,
}
