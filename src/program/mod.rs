//! Device program description as produced by the compiler

pub mod compiler;
pub mod descriptor;
pub mod types;

pub use compiler::{CompileOptions, CompileOutput, JsonProgramCompiler, ModuleCompiler};
pub use descriptor::{
    ArgDescriptor, ArgKind, GlobalSurfaceInit, KernelAttributes, KernelDescriptor, KernelFlags,
    KernelInfo, ProgramInfo,
};
pub use types::{
    ExternalFunctionInfo, FunctionDependency, KernelDependency, LinkerInput, LinkerTraits,
    PointerSize, RelocationInfo, RelocationKind, SegmentType, SymbolInfo,
};
