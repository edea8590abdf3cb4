//! Module creation, internal linking and kernel lookup

mod common;

use common::{
    create_module, create_module_logged, create_module_with_flags, read_isa_u64, ProgramBuilder,
    TestDevice,
};
use isaforge::device::MemoryClass;
use isaforge::linker::IMPLICIT_ARGS_SYMBOL;
use isaforge::module::{BuildLog, LinkageState, Module, ModuleDesc, ModuleType};
use isaforge::program::{KernelDescriptor, RelocationKind, SegmentType};
use isaforge::{IsaForgeError, RuntimeConfig};

#[test]
fn test_module_without_linker_input_is_fully_linked() {
    let td = TestDevice::default_device();
    let code: Vec<u8> = (1..=16).collect();
    let program = ProgramBuilder::new().kernel_with(KernelDescriptor::new("k"), code.clone());

    let module = create_module(td.device(), &program).unwrap();
    assert_eq!(module.linkage_state(), LinkageState::FullyLinked);

    let kernel = module.create_kernel("k").unwrap();
    assert_eq!(kernel.name(), "k");
    assert_ne!(kernel.isa_gpu_address(), 0);
    assert_eq!(module.kernel_data("k").unwrap().read_isa(0, 16).unwrap(), code);
}

#[test]
fn test_unknown_kernel_name() {
    let td = TestDevice::default_device();
    let module = create_module(td.device(), &ProgramBuilder::new().kernel("k", 16)).unwrap();
    let err = module.create_kernel("missing").unwrap_err();
    assert!(matches!(err, IsaForgeError::InvalidKernelName(ref n) if n == "missing"));
    assert!(err.is_user_error());
}

#[test]
fn test_partially_linked_module_refuses_kernels() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new()
        .kernel("main", 32)
        .text_relocation(0, "foo", 8, RelocationKind::Address)
        .requires_patching();

    let module = create_module(td.device(), &program).unwrap();
    assert_eq!(module.linkage_state(), LinkageState::PartiallyLinked);
    assert_eq!(module.unresolved_externals().len(), 1);
    assert!(module.imports().contains("foo"));
    assert!(!module.kernel_data("main").unwrap().is_isa_copied());

    // Existence of the name does not matter while unlinked.
    assert!(matches!(module.create_kernel("main"), Err(IsaForgeError::InvalidModuleUnlinked)));
    assert!(matches!(module.create_kernel("other"), Err(IsaForgeError::InvalidModuleUnlinked)));

    assert!(module.build_log().as_string().contains(
        "error : unresolved external symbol foo at offset 8 in instructions segment #0 (aka kernel : main)"
    ));
}

#[test]
fn test_malformed_input_is_build_failure() {
    let td = TestDevice::default_device();
    let mut log = BuildLog::new();
    let err = Module::create(td.device(), &ModuleDesc::native(b"\x7fELF"), Some(&mut log)).unwrap_err();

    assert!(matches!(err, IsaForgeError::BuildFailure(_)));
    assert!(log.as_string().contains("malformed program"));
    td.assert_no_leak();
}

#[test]
fn test_malformed_relocation_fails_the_build() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new()
        .kernel("lib", 16)
        .exported_functions_segment(0)
        .function("helper", 0, 8)
        .text_relocation(0, "helper", 12, RelocationKind::Address);

    let (result, log) = create_module_logged(td.device(), &program);
    assert!(matches!(result, Err(IsaForgeError::BuildFailure(_))));
    assert!(log
        .as_string()
        .contains("error : internal linker error while handling symbol helper"));
    assert_eq!(td.device().isa_pool().pool_count(), 0);
    td.assert_no_leak();
}

#[test]
fn test_local_function_call_is_patched() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new()
        .kernel("lib", 64)
        .kernel("main", 32)
        .exported_functions_segment(0)
        .function("helper", 16, 32)
        .text_relocation(1, "helper", 8, RelocationKind::Address)
        .requires_patching();

    let module = create_module(td.device(), &program).unwrap();
    assert!(module.is_fully_linked());

    let lib_address = module.kernel_data("lib").unwrap().isa_gpu_address();
    assert_eq!(read_isa_u64(&module, "main", 8), lib_address + 16);
    assert_eq!(module.symbols()["helper"].gpu_address, lib_address + 16);

    // Every kernel sees the exported function surface.
    let surface = module.exported_function_surface().unwrap().clone();
    assert!(module.create_kernel("main").unwrap().is_resident(&surface));
}

#[test]
fn test_code_uploaded_early_is_refreshed_after_patching() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new()
        .kernel("lib", 64)
        .exported_functions_segment(0)
        .function("helper", 32, 16)
        .text_relocation(0, "helper", 0, RelocationKind::AddressLow);

    let module = create_module(td.device(), &program).unwrap();
    let lib_address = module.kernel_data("lib").unwrap().isa_gpu_address();
    let low = module.kernel_data("lib").unwrap().read_isa(0, 4).unwrap();
    assert_eq!(low, ((lib_address + 32) as u32).to_le_bytes().to_vec());
}

#[test]
fn test_function_pointer_needs_library_compilation() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new()
        .kernel("lib", 64)
        .kernel("main", 32)
        .exported_functions_segment(0)
        .function("helper", 16, 32);

    let plain = create_module(td.device(), &program).unwrap();
    assert!(!plain.is_function_symbol_export_enabled());
    assert!(matches!(
        plain.get_function_pointer("helper"),
        Err(IsaForgeError::UnsupportedFeature(_))
    ));

    let library = create_module_with_flags(td.device(), &program, "-library-compilation").unwrap();
    assert!(library.is_function_symbol_export_enabled());
    let lib_address = library.kernel_data("lib").unwrap().isa_gpu_address();
    assert_eq!(library.get_function_pointer("helper").unwrap(), (lib_address + 16, 32));

    let (main_address, _) = library.get_function_pointer("main").unwrap();
    assert_eq!(main_address, library.kernel_data("main").unwrap().isa_gpu_address());

    assert!(matches!(
        library.get_function_pointer("nope"),
        Err(IsaForgeError::InvalidFunctionName(_))
    ));
}

#[test]
fn test_global_pointer_rejects_functions() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new()
        .kernel("lib", 64)
        .exported_functions_segment(0)
        .function("helper", 0, 16)
        .global_variables(16)
        .symbol("counter", SegmentType::GlobalVariables, 8, 4);

    let module = create_module_with_flags(td.device(), &program, "-ze-take-global-address").unwrap();
    assert!(module.is_global_symbol_export_enabled());

    let base = module.global_variables_allocation().unwrap().gpu_address();
    assert_eq!(module.get_global_pointer("counter").unwrap(), (base + 8, 4));
    assert!(matches!(
        module.get_global_pointer("helper"),
        Err(IsaForgeError::InvalidGlobalName(_))
    ));

    let plain = create_module(td.device(), &program).unwrap();
    assert!(matches!(
        plain.get_global_pointer("counter"),
        Err(IsaForgeError::UnsupportedFeature(_))
    ));
}

#[test]
fn test_data_relocation_patches_constants() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new()
        .kernel("k", 16)
        .global_variables(16)
        .global_constants(vec![0xAA; 16])
        .symbol("counter", SegmentType::GlobalVariables, 4, 4)
        .data_relocation(SegmentType::GlobalConstants, "counter", 0, RelocationKind::Address);

    let module = create_module(td.device(), &program).unwrap();
    assert!(module.is_fully_linked());

    let expected = module.global_variables_allocation().unwrap().gpu_address() + 4;
    let constants = module.global_constants_allocation().unwrap().read(0, 16).unwrap();
    assert_eq!(&constants[..8], &expected.to_le_bytes());
    assert_eq!(&constants[8..], &[0xAA; 8]);

    // Kernels keep both surfaces resident.
    let kernel = module.create_kernel("k").unwrap();
    assert!(kernel.is_resident(module.global_variables_allocation().unwrap()));
    assert!(kernel.is_resident(module.global_constants_allocation().unwrap()));
}

#[test]
fn test_implicit_args_patched_for_stack_calls() {
    let td = TestDevice::default_device();
    let mut stack = KernelDescriptor::new("stack");
    stack.attributes.flags.uses_stack_calls = true;

    let program = ProgramBuilder::new()
        .kernel_with(stack, vec![0xFF; 16])
        .kernel_with(KernelDescriptor::new("plain"), vec![0xFF; 16])
        .text_relocation(0, IMPLICIT_ARGS_SYMBOL, 0, RelocationKind::AddressLow)
        .text_relocation(1, IMPLICIT_ARGS_SYMBOL, 0, RelocationKind::AddressLow)
        .requires_patching();

    let module = create_module(td.device(), &program).unwrap();
    let stack = module.kernel_data("stack").unwrap();
    let plain = module.kernel_data("plain").unwrap();

    assert_eq!(stack.read_isa(0, 4).unwrap(), 128u32.to_le_bytes().to_vec());
    assert!(stack.descriptor().attributes.flags.requires_implicit_args);
    assert_eq!(plain.read_isa(0, 4).unwrap(), vec![0; 4]);
    assert!(!plain.descriptor().attributes.flags.requires_implicit_args);
}

#[test]
fn test_barrier_count_from_called_functions() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new()
        .kernel("main", 16)
        .kernel_dependency("main", "f")
        .function_dependency("f", "g")
        .external_function("f", 1)
        .external_function("g", 3);

    let module = create_module(td.device(), &program).unwrap();
    let kernel = module.create_kernel("main").unwrap();
    assert_eq!(kernel.descriptor().attributes.barrier_count, 3);
}

#[test]
fn test_debugger_builds_debuggable_modules() {
    let td = TestDevice::new(RuntimeConfig::new().with_debugger_attached(true));
    let program = ProgramBuilder::new().kernel("a", 16).kernel("b", 16);

    let module = create_module(td.device(), &program).unwrap();
    assert!(module.is_debug_enabled());
    assert!(module.build_options().compile.has_internal_option("-g"));
    assert!(module.kernels().iter().all(|k| !k.isa().is_shared()));
    assert_eq!(td.device().isa_pool().pool_count(), 0);

    // Native binaries are not rebuilt, so their kernels keep no debug info.
    let (native, log) = create_module_logged(td.device(), &program);
    let native = native.unwrap();
    assert!(!native.is_debug_enabled());
    assert!(log.as_string().contains("does not support debugging"));

    // Only debuggable modules need one allocation per kernel.
    assert!(native.kernels().iter().all(|k| k.isa().is_shared()));
    assert_eq!(td.device().isa_pool().pool_count(), 1);
}

#[test]
fn test_builtin_module_uses_internal_isa_memory() {
    let td = TestDevice::default_device();
    let bytes = ProgramBuilder::new().kernel("copy", 32).to_json();
    let desc = ModuleDesc::native(&bytes).with_module_type(ModuleType::Builtin);
    let module = Module::create(td.device(), &desc, None).unwrap();

    assert_eq!(module.module_type(), ModuleType::Builtin);
    let isa = module.kernel_data("copy").unwrap().isa().residency_allocation().unwrap();
    assert_eq!(isa.memory_class(), MemoryClass::KernelIsaInternal);
}

#[test]
fn test_native_binary_and_ignored_flags() {
    let td = TestDevice::default_device();
    let bytes = ProgramBuilder::new().kernel("k", 16).to_json();
    let mut log = BuildLog::new();
    let desc = ModuleDesc::native(&bytes).with_build_flags("-ze-opt-disable");
    let module = Module::create(td.device(), &desc, Some(&mut log)).unwrap();

    assert_eq!(module.get_native_binary(), bytes.as_slice());
    assert!(log.as_string().contains("build flags ignored"));
}

#[test]
fn test_allocation_failure_rolls_back() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new().kernel("k", 16).global_variables(64);

    td.host().fail_after(1);
    let (result, log) = create_module_logged(td.device(), &program);
    let err = result.unwrap_err();
    assert!(matches!(err, IsaForgeError::OutOfDeviceMemory(_)));
    assert!(log.as_string().starts_with("error : "));
    assert_eq!(td.device().isa_pool().pool_count(), 0);
    td.assert_no_leak();

    td.host().clear_failure_injection();
    assert!(create_module(td.device(), &program).is_ok());
}

#[test]
fn test_dedicated_batch_failure_rolls_back() {
    let td = TestDevice::new(RuntimeConfig::new().with_debugger_attached(true));
    let program = ProgramBuilder::new().kernel("a", 16).kernel("b", 16).kernel("c", 16);

    td.host().fail_after(2);
    assert!(create_module(td.device(), &program).is_err());
    td.assert_no_leak();
}

#[test]
fn test_kernel_outlives_module() {
    let td = TestDevice::default_device();
    let module = create_module(td.device(), &ProgramBuilder::new().kernel("k", 16)).unwrap();
    let kernel = module.create_kernel("k").unwrap();
    let address = kernel.isa_gpu_address();

    module.destroy();
    assert_eq!(kernel.isa_gpu_address(), address);
    assert!(kernel.residency().iter().all(|a| a.strong_count() >= 1));
    assert!(td.host().live_allocations() > 0);

    drop(kernel);
    td.assert_no_leak();
}

#[test]
fn test_small_modules_share_a_page() {
    let td = TestDevice::default_device();
    let a = create_module(td.device(), &ProgramBuilder::new().kernel("a", 100)).unwrap();
    let b = create_module(td.device(), &ProgramBuilder::new().kernel("b", 100)).unwrap();

    assert_eq!(td.device().isa_pool().pool_count(), 1);
    let a_isa = a.kernel_data("a").unwrap().isa();
    let b_isa = b.kernel_data("b").unwrap().isa();
    assert!(a_isa.is_shared() && b_isa.is_shared());
    assert_eq!(b_isa.gpu_address(), a_isa.gpu_address() + a_isa.size() as u64);

    a.destroy();
    assert_eq!(td.device().isa_pool().pool_count(), 1);
    b.destroy();
    assert_eq!(td.device().isa_pool().pool_count(), 0);
    td.assert_no_leak();
}

#[test]
fn test_debug_info_size_query() {
    let td = TestDevice::default_device();
    let program = ProgramBuilder::new().kernel("k", 16).debug_data(vec![7, 8, 9, 10]);
    let module = create_module(td.device(), &program).unwrap();

    let mut size = 0;
    module.get_debug_info(&mut size, None).unwrap();
    assert_eq!(size, 4);

    let mut buffer = vec![0u8; 6];
    size = buffer.len();
    module.get_debug_info(&mut size, Some(&mut buffer)).unwrap();
    assert_eq!(size, 4);
    assert_eq!(&buffer[..4], &[7, 8, 9, 10]);

    let mut small = [0u8; 3];
    size = small.len();
    let err = module.get_debug_info(&mut size, Some(&mut small)).unwrap_err();
    assert!(matches!(err, IsaForgeError::InvalidSize { required: 4, provided: 3 }));
}

#[test]
fn test_module_without_debug_info() {
    let td = TestDevice::default_device();
    let module = create_module(td.device(), &ProgramBuilder::new().kernel("k", 16)).unwrap();
    let mut size = 99;
    module.get_debug_info(&mut size, None).unwrap();
    assert_eq!(size, 0);
}
