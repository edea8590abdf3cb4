//! Read-only report of what a set of modules imports and exports

use crate::module::{BuildLog, Module};

bitflags::bitflags! {
    /// Sections to include in a linkage report
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkageInspectionFlags: u32 {
        /// Imported symbols with the module providing them
        const IMPORTS = 1 << 0;
        /// Symbols each module defines
        const EXPORTS = 1 << 1;
        /// Imports no listed module provides
        const UNRESOLVABLE_IMPORTS = 1 << 2;
    }
}

/// Describe the linkage of `modules` without modifying any of them
pub fn inspect_linkage(modules: &[&Module], flags: LinkageInspectionFlags) -> BuildLog {
    let mut log = BuildLog::new();

    let provider = |name: &str| modules.iter().find(|m| m.symbols().contains_key(name)).map(|m| m.id());

    for module in modules {
        if flags.contains(LinkageInspectionFlags::EXPORTS) {
            log.append_string(&format!("Module {} exports:", module.id()));
            for (name, symbol) in module.symbols() {
                log.append_string(&format!(
                    "  {} ({}, {} bytes) at 0x{:x}",
                    name,
                    symbol.segment(),
                    symbol.size(),
                    symbol.gpu_address
                ));
            }
        }

        if flags.contains(LinkageInspectionFlags::IMPORTS) {
            log.append_string(&format!("Module {} imports:", module.id()));
            for name in module.imports() {
                match provider(name) {
                    Some(owner) => log.append_string(&format!("  {} from module {}", name, owner)),
                    None => log.append_string(&format!("  {} (unresolved)", name)),
                }
            }
        }

        if flags.contains(LinkageInspectionFlags::UNRESOLVABLE_IMPORTS) {
            log.append_string(&format!("Module {} unresolvable imports:", module.id()));
            for name in module.imports().iter().filter(|n| provider(n).is_none()) {
                log.append_string(&format!("  {}", name));
            }
        }
    }

    tracing::debug!(
        "Linkage inspection of {} modules ({:?}): {} lines",
        modules.len(),
        flags,
        log.records().len()
    );
    log
}
