//! Dynamic link pass across a caller-supplied module list

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::dependencies::resolve_function_dependencies;
use super::types::UnresolvedReference;
use crate::device::GpuAllocation;
use crate::error::{ForgeResult, IsaForgeError};
use crate::module::build_options::{LIBRARY_COMPILATION, TAKE_GLOBAL_ADDRESS};
use crate::module::{BuildLog, Module, ModuleId};
use crate::program::{ExternalFunctionInfo, FunctionDependency};

/// Where an exported symbol lives
#[derive(Debug, Clone)]
struct Export {
    owner: usize,
    gpu_address: u64,
    surface: Option<GpuAllocation>,
}

/// Symbol index built once per call; the first definition in list order wins
#[derive(Debug, Default)]
struct ExportIndex {
    exports: HashMap<String, Export>,
    ambiguous: BTreeSet<String>,
}

impl ExportIndex {
    fn build(modules: &[&mut Module]) -> Self {
        let mut index = ExportIndex::default();
        for (owner, module) in modules.iter().enumerate() {
            for (name, symbol) in module.symbols() {
                if index.exports.contains_key(name) {
                    index.ambiguous.insert(name.clone());
                    continue;
                }
                index.exports.insert(
                    name.clone(),
                    Export {
                        owner,
                        gpu_address: symbol.gpu_address,
                        surface: module.surface_for(symbol.segment()).cloned(),
                    },
                );
            }
        }
        index
    }
}

/// Export capabilities of one listed module
#[derive(Debug, Clone, Copy)]
struct Capabilities {
    functions: bool,
    globals: bool,
}

impl Capabilities {
    fn of(module: &Module) -> Self {
        Capabilities {
            functions: module.is_function_symbol_export_enabled(),
            globals: module.is_global_symbol_export_enabled(),
        }
    }

    fn allows(&self, reference: &UnresolvedReference) -> bool {
        if reference.instruction_segment_id.is_some() {
            self.functions
        } else {
            self.globals
        }
    }
}

/// Notes naming the export capability that is off for a symbol nobody
/// provides, on the importer or on every other listed module.
fn capability_notes(
    reference: &UnresolvedReference,
    importer: ModuleId,
    position: usize,
    capabilities: &[Capabilities],
) -> Vec<String> {
    let flag = if reference.instruction_segment_id.is_some() {
        LIBRARY_COMPILATION
    } else {
        TAKE_GLOBAL_ADDRESS
    };
    let mut notes = Vec::new();
    if !capabilities[position].allows(reference) {
        notes.push(format!("note : module {} was not built with {}", importer, flag));
    }
    let exporter_enabled = capabilities
        .iter()
        .enumerate()
        .any(|(i, c)| i != position && c.allows(reference));
    if !exporter_enabled {
        notes.push(format!(
            "note : symbol {} needs {} on the exporting module, no listed module enables it",
            reference.symbol_name(),
            flag
        ));
    }
    notes
}

/// Resolve the pending externals of every listed module against the symbols
/// of all listed modules. `modules[0]` is the module the caller links.
///
/// Modules that resolve completely become fully linked even when another
/// module of the list fails. Patches already applied stay in place on
/// failure. Each offending symbol is named in the log and in the returned
/// `LinkFailure`, along with a note when the export capability it needed
/// is off on the importer or on every other listed module. Resolution itself
/// does not depend on those capabilities.
pub fn perform_dynamic_link(modules: &mut [&mut Module], log: Option<&mut BuildLog>) -> ForgeResult<()> {
    let index = ExportIndex::build(modules);
    let capabilities: Vec<Capabilities> = modules.iter().map(|m| Capabilities::of(m)).collect();

    let functions: Vec<ExternalFunctionInfo> = modules
        .iter()
        .filter_map(|m| m.linker_input())
        .flat_map(|li| li.external_functions.iter().cloned())
        .collect();
    let function_dependencies: Vec<FunctionDependency> = modules
        .iter()
        .filter_map(|m| m.linker_input())
        .flat_map(|li| li.function_dependencies.iter().cloned())
        .collect();

    let mut link_log = BuildLog::new();
    let mut missing: BTreeSet<String> = BTreeSet::new();
    let mut warned: BTreeSet<String> = BTreeSet::new();

    for position in 0..modules.len() {
        let module = &mut *modules[position];
        if module.is_fully_linked() && module.deferred_dependencies().is_empty() {
            continue;
        }
        tracing::debug!(
            "Dynamic link: module {} has {} unresolved externals, {} deferred call edges",
            module.id(),
            module.unresolved_externals().len(),
            module.deferred_dependencies().len()
        );

        let mut remaining: Vec<UnresolvedReference> = Vec::new();
        let pending = module.unresolved_externals().to_vec();
        for reference in pending {
            let name = reference.symbol_name().to_string();
            let Some(export) = index.exports.get(&name) else {
                if missing.insert(name.clone()) {
                    link_log.append_string(&format!("error : symbol {} not found", name));
                    for note in capability_notes(&reference, module.id(), position, &capabilities) {
                        link_log.append_string(&note);
                    }
                }
                remaining.push(reference);
                continue;
            };

            if index.ambiguous.contains(&name) && warned.insert(name.clone()) {
                tracing::warn!("Dynamic link: symbol {} defined in multiple modules", name);
                link_log.append_string(&format!("warning : symbol {} defined in multiple modules", name));
            }

            if let Err(e) = module.apply_external_patch(&reference, export.gpu_address) {
                tracing::warn!("Dynamic link: patching {} in module {} failed: {}", name, module.id(), e);
                link_log.append_string(&format!(
                    "error : internal linker error while handling symbol {}: {}",
                    name, e
                ));
                missing.insert(name);
                remaining.push(reference);
                continue;
            }

            if let Some(surface) = &export.surface {
                if export.owner != position {
                    module.add_imported_allocation(surface.clone(), reference.instruction_segment_id);
                }
            }
        }

        let mut dependencies_ok = true;
        if !module.deferred_dependencies().is_empty() {
            let resolution = resolve_function_dependencies(
                module.deferred_dependencies(),
                &function_dependencies,
                &functions,
            );
            for (kernel_name, barriers) in &resolution.kernel_barriers {
                module.set_kernel_barrier(kernel_name, *barriers);
            }
            for edge in &resolution.unresolved {
                dependencies_ok = false;
                link_log.append_string(&format!(
                    "error : function {} used by kernel {} not found",
                    edge.used_function, edge.kernel_name
                ));
            }
            missing.extend(resolution.missing_functions);
        }

        if remaining.is_empty() && dependencies_ok {
            module.clear_deferred_dependencies();
            module.mark_fully_linked()?;
            tracing::debug!("Dynamic link: module {} fully linked", module.id());
        } else {
            tracing::warn!(
                "Dynamic link: module {} left with {} unresolved externals",
                module.id(),
                remaining.len()
            );
            module.set_unresolved(remaining);
        }
    }

    propagate_imports(modules);

    if let Some(first) = modules.first_mut() {
        for record in link_log.records() {
            first.build_log_mut().append_string(record);
        }
    }
    if let Some(log) = log {
        for record in link_log.records() {
            log.append_string(record);
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(IsaForgeError::LinkFailure {
            unresolved: missing.into_iter().collect(),
        })
    }
}

/// Close every module's imported set over the imports of the modules it
/// imports from, then refresh residency of the fully linked ones.
///
/// Modules packed into one pool page share a surface, so an allocation may
/// have several owners.
fn propagate_imports(modules: &mut [&mut Module]) {
    let mut owners_of: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (position, module) in modules.iter().enumerate() {
        let surfaces = [
            module.exported_function_surface(),
            module.global_variables_allocation(),
            module.global_constants_allocation(),
        ];
        for surface in surfaces.into_iter().flatten() {
            let owners = owners_of.entry(surface.id()).or_default();
            if !owners.contains(&position) {
                owners.push(position);
            }
        }
    }
    let owned_by = |allocation: &GpuAllocation, position: usize| {
        owners_of
            .get(&allocation.id())
            .is_some_and(|owners| owners.contains(&position))
    };

    loop {
        let mut changed = false;
        for position in 0..modules.len() {
            let mut additions: Vec<GpuAllocation> = Vec::new();
            for allocation in modules[position].imported_allocations() {
                let Some(owners) = owners_of.get(&allocation.id()) else {
                    continue;
                };
                for &owner in owners.iter().filter(|&&o| o != position) {
                    for transitive in modules[owner].imported_allocations() {
                        if !owned_by(transitive, position)
                            && !modules[position].imported_allocations().contains(transitive)
                            && !additions.contains(transitive)
                        {
                            additions.push(transitive.clone());
                        }
                    }
                }
            }
            for allocation in additions {
                changed = true;
                modules[position].add_imported_allocation(allocation, None);
            }
        }
        if !changed {
            break;
        }
    }

    for module in modules.iter_mut() {
        if module.is_fully_linked() {
            module.refresh_residency();
        }
    }
}
