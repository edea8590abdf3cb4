//! Module: one compiled device program and its kernels

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::build_log::BuildLog;
use super::build_options::BuildOptions;
use super::kernel::Kernel;
use super::kernel_data::KernelImmutableData;
use super::{ModuleFormat, ModuleType};
use crate::device::{AllocationRequest, Device, GpuAllocation, MemoryClass};
use crate::error::{ForgeResult, IsaForgeError};
use crate::linker::{
    construct_linker_error_message, construct_relocations_debug_message, patch_data,
    patch_instruction, DataSegment, InstructionSegment, LinkSegments, Linker, LinkingStatus,
    ResolvedSymbol, SegmentInfo, UnresolvedReference,
};
use crate::program::{
    GlobalSurfaceInit, KernelDependency, LinkerInput, ProgramInfo, SegmentType,
};

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique module identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    fn next() -> Self {
        ModuleId(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkageState {
    Unlinked,
    PartiallyLinked,
    FullyLinked,
}

/// What to build a module from
#[derive(Debug, Clone, Copy)]
pub struct ModuleDesc<'a> {
    pub format: ModuleFormat,
    pub module_type: ModuleType,
    pub input: &'a [u8],
    pub build_flags: &'a str,
}

impl<'a> ModuleDesc<'a> {
    pub fn native(input: &'a [u8]) -> Self {
        ModuleDesc {
            format: ModuleFormat::Native,
            module_type: ModuleType::User,
            input,
            build_flags: "",
        }
    }

    pub fn ir(input: &'a [u8]) -> Self {
        ModuleDesc {
            format: ModuleFormat::IntermediateRepresentation,
            ..Self::native(input)
        }
    }

    pub fn with_build_flags(mut self, flags: &'a str) -> Self {
        self.build_flags = flags;
        self
    }

    pub fn with_module_type(mut self, module_type: ModuleType) -> Self {
        self.module_type = module_type;
        self
    }
}

/// A global data surface and the host copy the linker patches
#[derive(Debug)]
struct GlobalSurface {
    allocation: GpuAllocation,
    host: Vec<u8>,
}

impl GlobalSurface {
    fn info(&self) -> SegmentInfo {
        SegmentInfo::new(self.allocation.gpu_address(), self.host.len())
    }

    fn upload(&self) -> ForgeResult<()> {
        Ok(self.allocation.write(0, &self.host)?)
    }
}

pub struct Module {
    id: ModuleId,
    module_type: ModuleType,
    format: ModuleFormat,
    state: LinkageState,
    device: Device,
    kernels: Vec<KernelImmutableData>,
    linker_input: Option<LinkerInput>,
    /// Host copies of each kernel's code, patched across link passes
    isa_segments: Vec<Vec<u8>>,
    global_variables: Option<GlobalSurface>,
    global_constants: Option<GlobalSurface>,
    global_strings: Option<GpuAllocation>,
    symbols: BTreeMap<String, ResolvedSymbol>,
    unresolved: Vec<UnresolvedReference>,
    /// Every symbol the internal pass could not resolve locally
    imports: BTreeSet<String>,
    deferred_dependencies: Vec<KernelDependency>,
    exported_function_surface: Option<GpuAllocation>,
    imported_allocations: Vec<GpuAllocation>,
    build_log: BuildLog,
    build_options: BuildOptions,
    debug_enabled: bool,
    native_binary: Vec<u8>,
    debug_data: Vec<u8>,
}

/// Record `err` in the log and hand it back
fn note(log: &mut BuildLog, err: IsaForgeError) -> IsaForgeError {
    log.append_string(&format!("error : {}", err));
    err
}

impl Module {
    /// Compile, allocate, upload and internally link a module.
    ///
    /// Diagnostics go to the module's own build log and, when given, to
    /// `log` as well, whether or not creation succeeds.
    pub fn create(device: &Device, desc: &ModuleDesc<'_>, log: Option<&mut BuildLog>) -> ForgeResult<Module> {
        let mut module_log = BuildLog::new();
        let result = Self::build(device, desc, &mut module_log);
        if let Some(log) = log {
            for record in module_log.records() {
                log.append_string(record);
            }
        }
        let mut module = result?;
        module.build_log = module_log;
        Ok(module)
    }

    fn build(device: &Device, desc: &ModuleDesc<'_>, log: &mut BuildLog) -> ForgeResult<Module> {
        let id = ModuleId::next();
        let config = device.config();
        let build_options = BuildOptions::parse(desc.build_flags, desc.module_type, config);

        let output = match desc.format {
            ModuleFormat::Native => {
                if !desc.build_flags.trim().is_empty() {
                    tracing::warn!(
                        "Module {}: build flags {:?} ignored for native binary",
                        id,
                        desc.build_flags
                    );
                    log.append_string("warning : build flags ignored for native binary, recompilation is not supported");
                }
                device.compiler().decode_native(desc.input, &build_options.compile)
            }
            ModuleFormat::IntermediateRepresentation => {
                device.compiler().build_from_ir(desc.input, &build_options.compile)
            }
        };
        log.append_string(&output.log);

        let Some(program) = output.program else {
            tracing::warn!("Module {}: compilation failed", id);
            return Err(note(log, IsaForgeError::BuildFailure(format!("module {} failed to compile", id))));
        };

        let debug_enabled = config.debugger_attached && Self::check_debuggable(id, &program, log);

        let allocator = device.allocator();
        let surface = |init: &GlobalSurfaceInit, class: MemoryClass| -> ForgeResult<Option<GlobalSurface>> {
            if init.is_empty() {
                return Ok(None);
            }
            let host = init.contents();
            let request = AllocationRequest::new(host.len(), class).with_alignment(config.isa_start_alignment);
            let allocation = GpuAllocation::allocate(allocator, &request)?;
            Ok(Some(GlobalSurface { allocation, host }))
        };
        let global_variables = surface(&program.global_variables, MemoryClass::GlobalVariables)
            .map_err(|e| note(log, e))?;
        let global_constants = surface(&program.global_constants, MemoryClass::GlobalConstants)
            .map_err(|e| note(log, e))?;
        let global_strings = surface(&program.global_strings, MemoryClass::GlobalConstants)
            .map_err(|e| note(log, e))?;
        for s in [&global_variables, &global_constants, &global_strings].into_iter().flatten() {
            s.upload().map_err(|e| note(log, e))?;
        }

        let isa_class = match desc.module_type {
            ModuleType::Builtin => MemoryClass::KernelIsaInternal,
            ModuleType::User => MemoryClass::KernelIsa,
        };
        let sizes: Vec<usize> = program.kernels.iter().map(|k| k.isa.len().max(1)).collect();
        let allocations = if debug_enabled {
            device.isa_pool().allocate_dedicated_batch(&sizes, isa_class)
        } else {
            device.isa_pool().allocate_batch(&sizes, isa_class)
        }
        .map_err(|e| note(log, e))?;

        // Wrapping right away hands every shared range back to the pool if
        // anything below fails.
        let mut kernels: Vec<KernelImmutableData> = program
            .kernels
            .iter()
            .zip(allocations)
            .map(|(info, isa)| {
                KernelImmutableData::new(info.descriptor.clone(), isa, std::sync::Arc::clone(device.isa_pool()))
            })
            .collect();

        let defer_copy = program
            .linker_input
            .as_ref()
            .is_some_and(|li| li.traits.requires_patching_of_instruction_segments);
        let surfaces: Vec<GpuAllocation> = [&global_variables, &global_constants]
            .into_iter()
            .flatten()
            .map(|s| s.allocation.clone())
            .chain(global_strings.as_ref().map(|s| s.allocation.clone()))
            .collect();
        for (data, info) in kernels.iter_mut().zip(&program.kernels) {
            data.initialize(&info.isa, !defer_copy, &surfaces)
                .map_err(|e| note(log, e))?;
        }

        let ProgramInfo {
            kernels: kernel_infos,
            linker_input,
            debug_data,
            ..
        } = program;

        let mut module = Module {
            id,
            module_type: desc.module_type,
            format: desc.format,
            state: LinkageState::Unlinked,
            device: device.clone(),
            kernels,
            linker_input,
            isa_segments: kernel_infos.into_iter().map(|k| k.isa).collect(),
            global_variables,
            global_constants,
            global_strings: global_strings.map(|s| s.allocation),
            symbols: BTreeMap::new(),
            unresolved: Vec::new(),
            imports: BTreeSet::new(),
            deferred_dependencies: Vec::new(),
            exported_function_surface: None,
            imported_allocations: Vec::new(),
            build_log: BuildLog::new(),
            build_options,
            debug_enabled,
            native_binary: output.native_binary,
            debug_data,
        };
        module.link_internal(log)?;

        tracing::debug!(
            "Module {}: created {:?} {:?} with {} kernels ({:?})",
            module.id,
            module.module_type,
            module.format,
            module.kernels.len(),
            module.state
        );
        Ok(module)
    }

    fn check_debuggable(id: ModuleId, program: &ProgramInfo, log: &mut BuildLog) -> bool {
        match program
            .kernels
            .iter()
            .find(|k| !k.descriptor.attributes.flags.supports_debugging)
        {
            Some(kernel) => {
                tracing::warn!(
                    "Module {}: kernel {} lacks debug support, module is not debuggable",
                    id,
                    kernel.descriptor.name
                );
                log.append_string(&format!(
                    "warning : kernel {} does not support debugging, module is not debuggable",
                    kernel.descriptor.name
                ));
                false
            }
            None => true,
        }
    }

    /// Internal pass; ends in PartiallyLinked or FullyLinked
    fn link_internal(&mut self, log: &mut BuildLog) -> ForgeResult<()> {
        let Some(input) = self.linker_input.take() else {
            self.state = LinkageState::FullyLinked;
            return Ok(());
        };
        let result = self.link_with(&input, log);
        self.linker_input = Some(input);
        result
    }

    fn link_with(&mut self, input: &LinkerInput, log: &mut BuildLog) -> ForgeResult<()> {
        let config = self.device.config().clone();

        let mut exported_functions = None;
        if let Some(segment_id) = input.exported_functions_segment_id {
            let kernel = self.kernels.get(segment_id).ok_or_else(|| {
                note(
                    log,
                    IsaForgeError::BuildFailure(format!(
                        "exported functions segment #{} does not exist",
                        segment_id
                    )),
                )
            })?;
            exported_functions = Some(SegmentInfo::new(kernel.isa_gpu_address(), kernel.isa().size()));
            self.exported_function_surface = Some(kernel.isa().residency_allocation()?);
        }

        let implicit_args: Vec<u32> = self
            .kernels
            .iter()
            .map(|k| {
                let flags = k.descriptor().attributes.flags;
                if flags.uses_stack_calls || flags.requires_implicit_args || config.debugger_attached {
                    config.implicit_args_size
                } else {
                    0
                }
            })
            .collect();

        let mut segments = LinkSegments {
            global_variables: self.global_variables.as_mut().map(|s| DataSegment {
                info: s.info(),
                data: &mut s.host,
            }),
            global_constants: self.global_constants.as_mut().map(|s| DataSegment {
                info: s.info(),
                data: &mut s.host,
            }),
            global_strings: self
                .global_strings
                .as_ref()
                .map(|a| SegmentInfo::new(a.gpu_address(), a.size())),
            exported_functions,
            instructions: self
                .isa_segments
                .iter_mut()
                .zip(&implicit_args)
                .map(|(data, &value)| InstructionSegment {
                    data: data.as_mut_slice(),
                    implicit_args_value: value,
                })
                .collect(),
        };
        let out = Linker::new(input).link(&mut segments);
        drop(segments);

        for surface in [&self.global_variables, &self.global_constants].into_iter().flatten() {
            surface.upload().map_err(|e| note(log, e))?;
        }

        for (kernel_name, &barriers) in &out.kernel_barriers {
            self.set_kernel_barrier(kernel_name, barriers);
        }
        for &segment_id in &out.implicit_args_segments {
            if let Some(kernel) = self.kernels.get_mut(segment_id) {
                kernel.descriptor_mut().attributes.flags.requires_implicit_args = true;
            }
        }

        self.symbols = out.relocated_symbols;
        self.deferred_dependencies = out.deferred_dependencies;
        self.unresolved = out.unresolved;
        self.imports = self
            .unresolved
            .iter()
            .filter(|u| !u.internal_error)
            .map(|u| u.symbol_name().to_string())
            .collect();

        // Code uploaded before the pass still holds unpatched sites.
        if out.status != LinkingStatus::Error {
            for (segment_id, kernel) in self.kernels.iter_mut().enumerate() {
                if kernel.is_isa_copied() && !input.text_relocations_for(segment_id).is_empty() {
                    kernel.copy_isa(&self.isa_segments[segment_id])?;
                }
            }
        }

        match out.status {
            LinkingStatus::Error => {
                log.append_string(&self.linker_error_message());
                Err(note(
                    log,
                    IsaForgeError::BuildFailure(format!("module {} has malformed relocations", self.id)),
                ))
            }
            LinkingStatus::LinkedPartially => {
                tracing::debug!(
                    "Module {}: {} unresolved externals left for dynamic link",
                    self.id,
                    self.unresolved.len()
                );
                log.append_string(&self.linker_error_message());
                for (segment_id, kernel) in self.kernels.iter_mut().enumerate() {
                    if !kernel.is_isa_copied() && !out.pending_segments.contains(&segment_id) {
                        kernel.copy_isa(&self.isa_segments[segment_id])?;
                    }
                }
                self.state = LinkageState::PartiallyLinked;
                Ok(())
            }
            LinkingStatus::LinkedFully => {
                if config.print_relocations {
                    tracing::debug!("{}", construct_relocations_debug_message(&self.symbols));
                }
                self.mark_fully_linked()
            }
        }
    }

    fn linker_error_message(&self) -> String {
        let names: Vec<String> = self
            .kernels
            .iter()
            .map(|k| format!("kernel : {}", k.name()))
            .collect();
        construct_linker_error_message(&self.unresolved, &names)
    }

    /// Upload any code still held back, then refresh residency
    pub(crate) fn mark_fully_linked(&mut self) -> ForgeResult<()> {
        for (segment_id, kernel) in self.kernels.iter_mut().enumerate() {
            if !kernel.is_isa_copied() {
                kernel.copy_isa(&self.isa_segments[segment_id])?;
            }
        }
        self.unresolved.clear();
        self.state = LinkageState::FullyLinked;
        self.refresh_residency();
        Ok(())
    }

    /// Make the exported surface and every imported allocation resident in
    /// each kernel
    pub(crate) fn refresh_residency(&mut self) {
        for kernel in &mut self.kernels {
            if let Some(surface) = &self.exported_function_surface {
                kernel.add_resident(surface.clone());
            }
            for allocation in &self.imported_allocations {
                kernel.add_resident(allocation.clone());
            }
        }
    }

    /// Patch one unresolved site with `address`, on the host copy and, if
    /// already uploaded, on the device.
    pub(crate) fn apply_external_patch(&mut self, reference: &UnresolvedReference, address: u64) -> ForgeResult<()> {
        let pointer_size = self
            .linker_input
            .as_ref()
            .map(|li| li.traits.pointer_size)
            .unwrap_or_default();
        let relocation = &reference.relocation;

        match reference.instruction_segment_id {
            Some(segment_id) => {
                let segment = self
                    .isa_segments
                    .get_mut(segment_id)
                    .ok_or_else(|| crate::internal_error!("no instruction segment #{}", segment_id))?;
                let (offset, bytes) = patch_instruction(segment, relocation, address, pointer_size)
                    .map_err(|e| IsaForgeError::Internal(e.to_string()))?;
                if let Some(kernel) = self.kernels.get(segment_id) {
                    if kernel.is_isa_copied() {
                        kernel.write_isa(offset, &bytes)?;
                    }
                }
            }
            None => {
                let surface = match relocation.target_segment {
                    SegmentType::GlobalVariables => self.global_variables.as_mut(),
                    SegmentType::GlobalConstants => self.global_constants.as_mut(),
                    _ => None,
                }
                .ok_or_else(|| crate::internal_error!("no {} surface to patch", relocation.target_segment))?;
                let (offset, bytes) = patch_data(&mut surface.host, relocation, address, pointer_size)
                    .map_err(|e| IsaForgeError::Internal(e.to_string()))?;
                surface.allocation.write(offset, &bytes)?;
            }
        }
        Ok(())
    }

    /// Record an allocation this module's code now references
    pub(crate) fn add_imported_allocation(&mut self, allocation: GpuAllocation, segment_id: Option<usize>) {
        if let Some(kernel) = segment_id.and_then(|id| self.kernels.get_mut(id)) {
            kernel.add_resident(allocation.clone());
        }
        if !self.imported_allocations.contains(&allocation) {
            self.imported_allocations.push(allocation);
        }
    }

    pub(crate) fn set_unresolved(&mut self, unresolved: Vec<UnresolvedReference>) {
        self.unresolved = unresolved;
    }

    pub(crate) fn set_kernel_barrier(&mut self, kernel_name: &str, barriers: u8) {
        if let Some(kernel) = self.kernels.iter_mut().find(|k| k.name() == kernel_name) {
            let attributes = &mut kernel.descriptor_mut().attributes;
            attributes.barrier_count = attributes.barrier_count.max(barriers);
        }
    }

    pub(crate) fn clear_deferred_dependencies(&mut self) {
        self.deferred_dependencies.clear();
    }

    pub(crate) fn build_log_mut(&mut self) -> &mut BuildLog {
        &mut self.build_log
    }

    /// Build a dispatch handle; only legal once fully linked
    pub fn create_kernel(&self, name: &str) -> ForgeResult<Kernel> {
        if self.state != LinkageState::FullyLinked {
            return Err(IsaForgeError::InvalidModuleUnlinked);
        }
        let data = self
            .kernel_data(name)
            .ok_or_else(|| IsaForgeError::InvalidKernelName(name.to_string()))?;
        Ok(Kernel::from_immutable_data(self.id, data))
    }

    /// Address and size of an exported global variable or constant
    pub fn get_global_pointer(&self, name: &str) -> ForgeResult<(u64, usize)> {
        if !self.build_options.global_symbol_export {
            return Err(IsaForgeError::UnsupportedFeature(
                "global symbol export is not enabled for this module".to_string(),
            ));
        }
        match self.symbols.get(name) {
            Some(symbol) if symbol.segment() != SegmentType::Instructions => {
                Ok((symbol.gpu_address, symbol.size() as usize))
            }
            _ => Err(IsaForgeError::InvalidGlobalName(name.to_string())),
        }
    }

    /// Address and size of an exported function, falling back to kernel
    /// entry points
    pub fn get_function_pointer(&self, name: &str) -> ForgeResult<(u64, usize)> {
        if !self.build_options.function_symbol_export {
            return Err(IsaForgeError::UnsupportedFeature(
                "function symbol export is not enabled for this module".to_string(),
            ));
        }
        if let Some(symbol) = self.symbols.get(name) {
            if symbol.segment() == SegmentType::Instructions {
                return Ok((symbol.gpu_address, symbol.size() as usize));
            }
        }
        self.kernel_data(name)
            .map(|k| (k.isa_gpu_address(), k.isa().size()))
            .ok_or_else(|| IsaForgeError::InvalidFunctionName(name.to_string()))
    }

    pub fn kernel_names(&self) -> Vec<&str> {
        self.kernels.iter().map(|k| k.name()).collect()
    }

    pub fn kernel_data(&self, name: &str) -> Option<&KernelImmutableData> {
        self.kernels.iter().find(|k| k.name() == name)
    }

    pub fn kernels(&self) -> &[KernelImmutableData] {
        &self.kernels
    }

    pub fn get_native_binary(&self) -> &[u8] {
        &self.native_binary
    }

    /// Copy out the program's debug information.
    ///
    /// Without a buffer, `size` receives the number of bytes available. With
    /// a buffer, at least that many bytes must fit.
    pub fn get_debug_info(&self, size: &mut usize, buffer: Option<&mut [u8]>) -> ForgeResult<()> {
        let required = self.debug_data.len();
        let Some(buffer) = buffer else {
            *size = required;
            return Ok(());
        };

        let provided = (*size).min(buffer.len());
        if provided < required {
            return Err(IsaForgeError::InvalidSize { required, provided });
        }
        buffer[..required].copy_from_slice(&self.debug_data);
        *size = required;
        Ok(())
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn module_type(&self) -> ModuleType {
        self.module_type
    }

    pub fn format(&self) -> ModuleFormat {
        self.format
    }

    pub fn linkage_state(&self) -> LinkageState {
        self.state
    }

    pub fn is_fully_linked(&self) -> bool {
        self.state == LinkageState::FullyLinked
    }

    pub fn is_debug_enabled(&self) -> bool {
        self.debug_enabled
    }

    pub fn is_function_symbol_export_enabled(&self) -> bool {
        self.build_options.function_symbol_export
    }

    pub fn is_global_symbol_export_enabled(&self) -> bool {
        self.build_options.global_symbol_export
    }

    pub fn build_options(&self) -> &BuildOptions {
        &self.build_options
    }

    pub fn build_log(&self) -> &BuildLog {
        &self.build_log
    }

    pub fn symbols(&self) -> &BTreeMap<String, ResolvedSymbol> {
        &self.symbols
    }

    pub fn unresolved_externals(&self) -> &[UnresolvedReference] {
        &self.unresolved
    }

    /// Names this module needed from other modules after its internal pass
    pub fn imports(&self) -> &BTreeSet<String> {
        &self.imports
    }

    pub fn deferred_dependencies(&self) -> &[KernelDependency] {
        &self.deferred_dependencies
    }

    pub fn linker_input(&self) -> Option<&LinkerInput> {
        self.linker_input.as_ref()
    }

    pub fn exported_function_surface(&self) -> Option<&GpuAllocation> {
        self.exported_function_surface.as_ref()
    }

    pub fn imported_allocations(&self) -> &[GpuAllocation] {
        &self.imported_allocations
    }

    pub fn global_variables_allocation(&self) -> Option<&GpuAllocation> {
        self.global_variables.as_ref().map(|s| &s.allocation)
    }

    pub fn global_constants_allocation(&self) -> Option<&GpuAllocation> {
        self.global_constants.as_ref().map(|s| &s.allocation)
    }

    /// Allocation backing symbols of `segment`
    pub fn surface_for(&self, segment: SegmentType) -> Option<&GpuAllocation> {
        match segment {
            SegmentType::Instructions => self.exported_function_surface.as_ref(),
            SegmentType::GlobalVariables => self.global_variables_allocation(),
            SegmentType::GlobalConstants => self.global_constants_allocation(),
            SegmentType::GlobalStrings => self.global_strings.as_ref(),
        }
    }

    /// Release the module; kernel handles already created stay valid
    pub fn destroy(self) {
        tracing::debug!("Module {}: destroyed", self.id);
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("type", &self.module_type)
            .field("format", &self.format)
            .field("state", &self.state)
            .field("kernels", &self.kernel_names())
            .field("unresolved", &self.unresolved.len())
            .finish()
    }
}
