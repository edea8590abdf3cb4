//! Internal link pass: resolve everything a module can resolve on its own

use std::collections::{BTreeMap, BTreeSet};

use super::dependencies::{resolve_function_dependencies, DependencyResolution};
use super::patch::{patch_data, patch_instruction};
use super::types::{LinkingStatus, ResolvedSymbol, SegmentInfo, UnresolvedReference};
use crate::program::{KernelDependency, LinkerInput, RelocationInfo, SegmentType};

/// Reserved symbol patched with the implicit-argument structure size
pub const IMPLICIT_ARGS_SYMBOL: &str = "INTEL_PATCH_CROSS_THREAD_OFFSET_OFF_R0";

/// Host copy of a data surface and where it lives on the device
#[derive(Debug)]
pub struct DataSegment<'a> {
    pub info: SegmentInfo,
    pub data: &'a mut [u8],
}

/// Host copy of one kernel's code
#[derive(Debug)]
pub struct InstructionSegment<'a> {
    pub data: &'a mut [u8],
    /// Value written for the implicit-args symbol; zero when unused
    pub implicit_args_value: u32,
}

/// Everything the internal pass patches or resolves against
#[derive(Debug, Default)]
pub struct LinkSegments<'a> {
    pub global_variables: Option<DataSegment<'a>>,
    pub global_constants: Option<DataSegment<'a>>,
    pub global_strings: Option<SegmentInfo>,
    pub exported_functions: Option<SegmentInfo>,
    pub instructions: Vec<InstructionSegment<'a>>,
}

#[derive(Debug, Clone)]
pub struct LinkOutput {
    pub status: LinkingStatus,
    pub relocated_symbols: BTreeMap<String, ResolvedSymbol>,
    pub unresolved: Vec<UnresolvedReference>,
    /// Instruction segments left with unapplied relocations
    pub pending_segments: BTreeSet<usize>,
    /// Instruction segments that had the implicit-args symbol patched non-zero
    pub implicit_args_segments: BTreeSet<usize>,
    pub kernel_barriers: BTreeMap<String, u8>,
    /// Call edges whose callee is not defined in this module
    pub deferred_dependencies: Vec<KernelDependency>,
}

/// Runs the internal link pass over one module's segments
#[derive(Debug)]
pub struct Linker<'a> {
    input: &'a LinkerInput,
}

impl<'a> Linker<'a> {
    pub fn new(input: &'a LinkerInput) -> Self {
        Linker { input }
    }

    pub fn link(&self, segments: &mut LinkSegments<'_>) -> LinkOutput {
        let relocated_symbols = self.relocate_symbols(segments);
        let mut unresolved = Vec::new();

        self.patch_data_segments(segments, &relocated_symbols, &mut unresolved);
        let implicit_args_segments =
            self.patch_instruction_segments(segments, &relocated_symbols, &mut unresolved);

        let DependencyResolution {
            kernel_barriers,
            unresolved: deferred_dependencies,
            ..
        } = resolve_function_dependencies(
            &self.input.kernel_dependencies,
            &self.input.function_dependencies,
            &self.input.external_functions,
        );

        let pending_segments = unresolved
            .iter()
            .filter_map(|u| u.instruction_segment_id)
            .collect();

        let status = if unresolved.iter().any(|u| u.internal_error) {
            LinkingStatus::Error
        } else if unresolved.is_empty() {
            LinkingStatus::LinkedFully
        } else {
            LinkingStatus::LinkedPartially
        };

        tracing::debug!(
            "Linker: {:?} ({} symbols, {} unresolved, {} deferred call edges)",
            status,
            relocated_symbols.len(),
            unresolved.len(),
            deferred_dependencies.len()
        );

        LinkOutput {
            status,
            relocated_symbols,
            unresolved,
            pending_segments,
            implicit_args_segments,
            kernel_barriers,
            deferred_dependencies,
        }
    }

    fn segment_base(&self, segments: &LinkSegments<'_>, segment: SegmentType) -> Option<SegmentInfo> {
        match segment {
            SegmentType::GlobalVariables => segments.global_variables.as_ref().map(|s| s.info),
            SegmentType::GlobalConstants => segments.global_constants.as_ref().map(|s| s.info),
            SegmentType::GlobalStrings => segments.global_strings,
            SegmentType::Instructions => segments.exported_functions,
        }
    }

    fn relocate_symbols(&self, segments: &LinkSegments<'_>) -> BTreeMap<String, ResolvedSymbol> {
        let mut relocated = BTreeMap::new();
        for (name, symbol) in &self.input.symbols {
            let Some(base) = self.segment_base(segments, symbol.segment) else {
                tracing::warn!(
                    "Linker: symbol {} lives in missing {} segment",
                    name,
                    symbol.segment
                );
                continue;
            };
            if !base.contains(symbol.offset, symbol.size as u64) {
                tracing::warn!(
                    "Linker: symbol {} ({}+{}) exceeds {}-byte {} segment",
                    name,
                    symbol.offset,
                    symbol.size,
                    base.size,
                    symbol.segment
                );
                continue;
            }
            relocated.insert(
                name.clone(),
                ResolvedSymbol {
                    symbol: *symbol,
                    gpu_address: base.gpu_address + symbol.offset,
                },
            );
        }
        relocated
    }

    fn patch_data_segments(
        &self,
        segments: &mut LinkSegments<'_>,
        symbols: &BTreeMap<String, ResolvedSymbol>,
        unresolved: &mut Vec<UnresolvedReference>,
    ) {
        let pointer_size = self.input.traits.pointer_size;
        for relocation in &self.input.data_relocations {
            let target = match relocation.target_segment {
                SegmentType::GlobalVariables => segments.global_variables.as_mut(),
                SegmentType::GlobalConstants => segments.global_constants.as_mut(),
                _ => None,
            };
            let Some(target) = target else {
                unresolved.push(UnresolvedReference::for_data(relocation).with_internal_error());
                continue;
            };
            let Some(symbol) = symbols.get(&relocation.symbol_name) else {
                unresolved.push(UnresolvedReference::for_data(relocation));
                continue;
            };
            if let Err(e) = patch_data(target.data, relocation, symbol.gpu_address, pointer_size) {
                tracing::warn!("Linker: data relocation {}: {}", relocation.symbol_name, e);
                unresolved.push(UnresolvedReference::for_data(relocation).with_internal_error());
            }
        }
    }

    fn patch_instruction_segments(
        &self,
        segments: &mut LinkSegments<'_>,
        symbols: &BTreeMap<String, ResolvedSymbol>,
        unresolved: &mut Vec<UnresolvedReference>,
    ) -> BTreeSet<usize> {
        let pointer_size = self.input.traits.pointer_size;
        let mut implicit_args_segments = BTreeSet::new();

        for (segment_id, relocations) in self.input.text_relocations.iter().enumerate() {
            let Some(segment) = segments.instructions.get_mut(segment_id) else {
                for relocation in relocations {
                    unresolved.push(
                        UnresolvedReference::for_text(relocation, segment_id).with_internal_error(),
                    );
                }
                continue;
            };

            for relocation in relocations {
                let address = match self.resolve_text_symbol(relocation, segment, symbols) {
                    Some(address) => address,
                    None => {
                        unresolved.push(UnresolvedReference::for_text(relocation, segment_id));
                        continue;
                    }
                };
                match patch_instruction(segment.data, relocation, address, pointer_size) {
                    Ok(_) => {
                        if relocation.symbol_name == IMPLICIT_ARGS_SYMBOL && address != 0 {
                            implicit_args_segments.insert(segment_id);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Linker: segment #{} {}: {}", segment_id, relocation.symbol_name, e);
                        unresolved.push(
                            UnresolvedReference::for_text(relocation, segment_id).with_internal_error(),
                        );
                    }
                }
            }
        }
        implicit_args_segments
    }

    fn resolve_text_symbol(
        &self,
        relocation: &RelocationInfo,
        segment: &InstructionSegment<'_>,
        symbols: &BTreeMap<String, ResolvedSymbol>,
    ) -> Option<u64> {
        if relocation.symbol_name == IMPLICIT_ARGS_SYMBOL {
            return Some(segment.implicit_args_value as u64);
        }
        symbols.get(&relocation.symbol_name).map(|s| s.gpu_address)
    }
}
