//! Human-readable linker diagnostics

use std::collections::BTreeMap;
use std::fmt::Write;

use super::types::{ResolvedSymbol, UnresolvedReference};
use crate::program::SegmentType;

/// Describe every unresolved reference, one line each.
///
/// `segment_names[i]` names instruction segment `i` when available.
pub fn construct_linker_error_message(
    unresolved: &[UnresolvedReference],
    segment_names: &[String],
) -> String {
    if unresolved.is_empty() {
        return "Internal linker error".to_string();
    }

    let mut message = String::new();
    for reference in unresolved {
        if reference.internal_error {
            message.push_str("error : internal linker error while handling symbol ");
        } else {
            message.push_str("error : unresolved external symbol ");
        }

        let relocation = &reference.relocation;
        match (relocation.target_segment, reference.instruction_segment_id) {
            (SegmentType::Instructions, Some(id)) => {
                let _ = write!(
                    message,
                    "{} at offset {} in instructions segment #{}",
                    relocation.symbol_name, relocation.offset, id
                );
                if let Some(name) = segment_names.get(id) {
                    let _ = write!(message, " (aka {})", name);
                }
            }
            (segment, _) => {
                let _ = write!(
                    message,
                    "{} at offset {} in data segment #{}",
                    relocation.symbol_name, relocation.offset, segment
                );
            }
        }
        message.push('\n');
    }
    message
}

/// List resolved symbols with their addresses; empty input yields "".
pub fn construct_relocations_debug_message(symbols: &BTreeMap<String, ResolvedSymbol>) -> String {
    if symbols.is_empty() {
        return String::new();
    }

    let mut message = String::from("Relocations debug informations :\n");
    for (name, resolved) in symbols {
        let _ = writeln!(
            message,
            " * \"{}\" [{} bytes] {}_SEGMENT@{} -> 0x{:x} GPUVA",
            name,
            resolved.size(),
            resolved.segment(),
            resolved.offset(),
            resolved.gpu_address
        );
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{RelocationInfo, RelocationKind, SymbolInfo};

    fn unresolved(segment: SegmentType, id: Option<usize>) -> UnresolvedReference {
        UnresolvedReference {
            relocation: RelocationInfo {
                symbol_name: "arrayABC".to_string(),
                offset: 64,
                kind: RelocationKind::Address,
                target_segment: segment,
            },
            instruction_segment_id: id,
            is_global_variable_relocation: false,
            internal_error: false,
        }
    }

    #[test]
    fn test_empty_list_is_internal_error() {
        assert_eq!(
            construct_linker_error_message(&[], &["kernel : a".to_string()]),
            "Internal linker error"
        );
    }

    #[test]
    fn test_instruction_segment_message() {
        let names = vec!["kernel : k1".to_string(), "kernel : k2".to_string()];
        let refs = vec![unresolved(SegmentType::Instructions, Some(1))];
        assert_eq!(
            construct_linker_error_message(&refs, &names),
            "error : unresolved external symbol arrayABC at offset 64 in instructions segment #1 (aka kernel : k2)\n"
        );

        let mut internal = refs.clone();
        internal[0].internal_error = true;
        let message = construct_linker_error_message(&internal, &[]);
        assert_eq!(
            message,
            "error : internal linker error while handling symbol arrayABC at offset 64 in instructions segment #1\n"
        );
    }

    #[test]
    fn test_data_segment_message() {
        let refs = vec![
            unresolved(SegmentType::GlobalConstants, None),
            unresolved(SegmentType::GlobalVariables, None),
        ];
        assert_eq!(
            construct_linker_error_message(&refs, &[]),
            "error : unresolved external symbol arrayABC at offset 64 in data segment #GLOBAL_CONSTANTS\n\
             error : unresolved external symbol arrayABC at offset 64 in data segment #GLOBAL_VARIABLES\n"
        );
    }

    #[test]
    fn test_relocations_debug_message() {
        assert_eq!(construct_relocations_debug_message(&BTreeMap::new()), "");

        let mut symbols = BTreeMap::new();
        symbols.insert(
            "foo".to_string(),
            ResolvedSymbol {
                symbol: SymbolInfo {
                    segment: SegmentType::Instructions,
                    offset: 64,
                    size: 1024,
                },
                gpu_address: 4096,
            },
        );
        symbols.insert(
            "constInt".to_string(),
            ResolvedSymbol {
                symbol: SymbolInfo {
                    segment: SegmentType::GlobalConstants,
                    offset: 32,
                    size: 16,
                },
                gpu_address: 8,
            },
        );
        assert_eq!(
            construct_relocations_debug_message(&symbols),
            "Relocations debug informations :\n \
             * \"constInt\" [16 bytes] GLOBAL_CONSTANTS_SEGMENT@32 -> 0x8 GPUVA\n \
             * \"foo\" [1024 bytes] INSTRUCTIONS_SEGMENT@64 -> 0x1000 GPUVA\n"
        );
    }
}
