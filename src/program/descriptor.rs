//! Kernel descriptors and whole-program description

use serde::{Deserialize, Serialize};

use super::types::LinkerInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgKind {
    Pointer,
    Value,
    Image,
    Sampler,
}

/// One kernel argument in the cross-thread payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDescriptor {
    pub name: String,
    pub kind: ArgKind,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelFlags {
    pub requires_implicit_args: bool,
    pub uses_stack_calls: bool,
    pub has_indirect_calls: bool,
    pub supports_debugging: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelAttributes {
    pub barrier_count: u8,
    pub slm_inline_size: u32,
    pub simd_size: u8,
    pub flags: KernelFlags,
}

impl Default for KernelAttributes {
    fn default() -> Self {
        KernelAttributes {
            barrier_count: 0,
            slm_inline_size: 0,
            simd_size: 32,
            flags: KernelFlags::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub name: String,
    #[serde(default)]
    pub arguments: Vec<ArgDescriptor>,
    #[serde(default)]
    pub attributes: KernelAttributes,
}

impl KernelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        KernelDescriptor {
            name: name.into(),
            arguments: Vec::new(),
            attributes: KernelAttributes::default(),
        }
    }

    /// Size of the cross-thread argument payload
    pub fn payload_size(&self) -> u32 {
        self.arguments
            .iter()
            .map(|a| a.offset.saturating_add(a.size))
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub descriptor: KernelDescriptor,
    /// Instruction bytes, before relocation
    #[serde(default)]
    pub isa: Vec<u8>,
}

/// Size and initial contents of a global surface
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSurfaceInit {
    /// Total size; bytes past `init_data` are zero-filled
    pub size: usize,
    pub init_data: Vec<u8>,
}

impl GlobalSurfaceInit {
    pub fn is_empty(&self) -> bool {
        self.effective_size() == 0
    }

    pub fn effective_size(&self) -> usize {
        self.size.max(self.init_data.len())
    }

    /// Full surface contents with zero fill
    pub fn contents(&self) -> Vec<u8> {
        let mut bytes = self.init_data.clone();
        bytes.resize(self.effective_size(), 0);
        bytes
    }
}

/// Compiler output describing a whole device program
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramInfo {
    pub kernels: Vec<KernelInfo>,
    pub linker_input: Option<LinkerInput>,
    pub global_variables: GlobalSurfaceInit,
    pub global_constants: GlobalSurfaceInit,
    pub global_strings: GlobalSurfaceInit,
    /// Opaque debug information for the whole program, as the compiler
    /// emitted it
    pub debug_data: Vec<u8>,
    pub build_log: String,
}

impl ProgramInfo {
    pub fn kernel(&self, name: &str) -> Option<&KernelInfo> {
        self.kernels.iter().find(|k| k.descriptor.name == name)
    }
}
