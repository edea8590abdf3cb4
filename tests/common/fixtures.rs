//! Program fixtures: builders for the JSON programs the reference compiler
//! accepts.

use isaforge::module::{BuildLog, Module, ModuleDesc};
use isaforge::program::{
    ExternalFunctionInfo, FunctionDependency, KernelDependency, KernelDescriptor, KernelInfo,
    LinkerInput, ProgramInfo, RelocationInfo, RelocationKind, SegmentType, SymbolInfo,
};
use isaforge::{Device, ForgeResult};

/// Fluent builder for [`ProgramInfo`]
#[derive(Debug, Clone, Default)]
pub struct ProgramBuilder {
    program: ProgramInfo,
}

#[allow(dead_code)]
impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a kernel with `isa_len` zeroed instruction bytes
    pub fn kernel(self, name: &str, isa_len: usize) -> Self {
        self.kernel_with(KernelDescriptor::new(name), vec![0u8; isa_len])
    }

    pub fn kernel_with(mut self, descriptor: KernelDescriptor, isa: Vec<u8>) -> Self {
        self.program.kernels.push(KernelInfo { descriptor, isa });
        self
    }

    /// Kernel `segment` holds the module's callable functions
    pub fn exported_functions_segment(mut self, segment: usize) -> Self {
        self.linker().exported_functions_segment_id = Some(segment);
        self
    }

    pub fn symbol(mut self, name: &str, segment: SegmentType, offset: u64, size: u32) -> Self {
        self.linker()
            .symbols
            .insert(name.to_string(), SymbolInfo { segment, offset, size });
        self
    }

    pub fn function(self, name: &str, offset: u64, size: u32) -> Self {
        self.symbol(name, SegmentType::Instructions, offset, size)
    }

    pub fn global_variables(mut self, size: usize) -> Self {
        self.program.global_variables.size = size;
        self
    }

    pub fn debug_data(mut self, data: Vec<u8>) -> Self {
        self.program.debug_data = data;
        self
    }

    pub fn global_constants(mut self, init_data: Vec<u8>) -> Self {
        self.program.global_constants.init_data = init_data;
        self
    }

    pub fn text_relocation(mut self, segment: usize, name: &str, offset: u64, kind: RelocationKind) -> Self {
        let relocations = &mut self.linker().text_relocations;
        if relocations.len() <= segment {
            relocations.resize_with(segment + 1, Vec::new);
        }
        relocations[segment].push(RelocationInfo {
            symbol_name: name.to_string(),
            offset,
            kind,
            target_segment: SegmentType::Instructions,
        });
        self
    }

    pub fn data_relocation(mut self, target: SegmentType, name: &str, offset: u64, kind: RelocationKind) -> Self {
        self.linker().data_relocations.push(RelocationInfo {
            symbol_name: name.to_string(),
            offset,
            kind,
            target_segment: target,
        });
        self
    }

    pub fn kernel_dependency(mut self, kernel: &str, function: &str) -> Self {
        self.linker().kernel_dependencies.push(KernelDependency {
            kernel_name: kernel.to_string(),
            used_function: function.to_string(),
        });
        self
    }

    pub fn function_dependency(mut self, caller: &str, function: &str) -> Self {
        self.linker().function_dependencies.push(FunctionDependency {
            caller: caller.to_string(),
            used_function: function.to_string(),
        });
        self
    }

    pub fn external_function(mut self, name: &str, barrier_count: u8) -> Self {
        self.linker().external_functions.push(ExternalFunctionInfo {
            name: name.to_string(),
            barrier_count,
            has_indirect_calls: false,
        });
        self
    }

    /// Code may only be uploaded once every relocation is applied
    pub fn requires_patching(mut self) -> Self {
        self.linker().traits.requires_patching_of_instruction_segments = true;
        self
    }

    pub fn build(self) -> ProgramInfo {
        self.program
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.program).expect("program serialises")
    }

    fn linker(&mut self) -> &mut LinkerInput {
        self.program.linker_input.get_or_insert_with(LinkerInput::default)
    }
}

/// Create an IR module from `program` without build flags
#[allow(dead_code)]
pub fn create_module(device: &Device, program: &ProgramBuilder) -> ForgeResult<Module> {
    create_module_with_flags(device, program, "")
}

/// Create an IR module from `program` with `flags`
#[allow(dead_code)]
pub fn create_module_with_flags(device: &Device, program: &ProgramBuilder, flags: &str) -> ForgeResult<Module> {
    let bytes = program.to_json();
    let desc = ModuleDesc::ir(&bytes).with_build_flags(flags);
    Module::create(device, &desc, None)
}

/// Create a module and capture the caller-side build log
#[allow(dead_code)]
pub fn create_module_logged(device: &Device, program: &ProgramBuilder) -> (ForgeResult<Module>, BuildLog) {
    let bytes = program.to_json();
    let mut log = BuildLog::new();
    let result = Module::create(device, &ModuleDesc::native(&bytes), Some(&mut log));
    (result, log)
}

/// Little-endian u64 from a kernel's uploaded code
#[allow(dead_code)]
pub fn read_isa_u64(module: &Module, kernel: &str, offset: usize) -> u64 {
    let bytes = module
        .kernel_data(kernel)
        .expect("kernel exists")
        .read_isa(offset, 8)
        .expect("isa readable");
    u64::from_le_bytes(bytes.try_into().expect("8 bytes"))
}

/// A library exporting function `name` from kernel `lib` at offset 0
#[allow(dead_code)]
pub fn library_exporting(name: &str) -> ProgramBuilder {
    ProgramBuilder::new()
        .kernel("lib", 64)
        .exported_functions_segment(0)
        .function(name, 16, 32)
        .external_function(name, 0)
}

/// A kernel `main` calling external `name` through a 64-bit relocation at offset 8
#[allow(dead_code)]
pub fn importer_of(name: &str) -> ProgramBuilder {
    ProgramBuilder::new()
        .kernel("main", 32)
        .text_relocation(0, name, 8, RelocationKind::Address)
        .requires_patching()
}
