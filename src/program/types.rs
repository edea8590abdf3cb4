//! Linker input produced by the compiler: symbols, relocations and
//! function dependency edges.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Segment a symbol lives in or a relocation patches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentType {
    Instructions,
    GlobalVariables,
    GlobalConstants,
    GlobalStrings,
}

impl SegmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentType::Instructions => "INSTRUCTIONS",
            SegmentType::GlobalVariables => "GLOBAL_VARIABLES",
            SegmentType::GlobalConstants => "GLOBAL_CONSTANTS",
            SegmentType::GlobalStrings => "GLOBAL_STRINGS",
        }
    }

    pub fn is_data(&self) -> bool {
        !matches!(self, SegmentType::Instructions)
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a resolved address is written at the relocation site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocationKind {
    /// Full address in the program's pointer size
    Address,
    /// Upper 32 bits
    AddressHigh,
    /// Lower 32 bits
    AddressLow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationInfo {
    pub symbol_name: String,
    pub offset: u64,
    pub kind: RelocationKind,
    /// Segment containing the patch site
    pub target_segment: SegmentType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub segment: SegmentType,
    pub offset: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointerSize {
    Bits32,
    #[default]
    Bits64,
}

impl PointerSize {
    pub fn bytes(&self) -> usize {
        match self {
            PointerSize::Bits32 => 4,
            PointerSize::Bits64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkerTraits {
    pub pointer_size: PointerSize,
    pub requires_patching_of_instruction_segments: bool,
    pub requires_patching_of_global_variables_buffer: bool,
    pub requires_patching_of_global_constants_buffer: bool,
}

/// Kernel `kernel_name` calls `used_function`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDependency {
    pub kernel_name: String,
    pub used_function: String,
}

/// Function `caller` calls `used_function`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDependency {
    pub caller: String,
    pub used_function: String,
}

/// A callable function defined by a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalFunctionInfo {
    pub name: String,
    #[serde(default)]
    pub barrier_count: u8,
    #[serde(default)]
    pub has_indirect_calls: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkerInput {
    pub symbols: BTreeMap<String, SymbolInfo>,
    /// Relocations per instruction segment, indexed like the kernel list
    pub text_relocations: Vec<Vec<RelocationInfo>>,
    pub data_relocations: Vec<RelocationInfo>,
    pub kernel_dependencies: Vec<KernelDependency>,
    pub function_dependencies: Vec<FunctionDependency>,
    pub external_functions: Vec<ExternalFunctionInfo>,
    /// Instruction segment holding cross-module-callable functions
    pub exported_functions_segment_id: Option<usize>,
    pub traits: LinkerTraits,
}

impl LinkerInput {
    pub fn text_relocations_for(&self, segment_id: usize) -> &[RelocationInfo] {
        self.text_relocations
            .get(segment_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn external_function(&self, name: &str) -> Option<&ExternalFunctionInfo> {
        self.external_functions.iter().find(|f| f.name == name)
    }
}
