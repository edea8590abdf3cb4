//! Linker result types

use crate::program::{RelocationInfo, SegmentType, SymbolInfo};

/// A symbol with its final GPU address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub symbol: SymbolInfo,
    pub gpu_address: u64,
}

impl ResolvedSymbol {
    pub fn segment(&self) -> SegmentType {
        self.symbol.segment
    }

    pub fn size(&self) -> u32 {
        self.symbol.size
    }

    pub fn offset(&self) -> u64 {
        self.symbol.offset
    }
}

/// A relocation the linker could not apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedReference {
    pub relocation: RelocationInfo,
    /// Kernel whose code holds the patch site; `None` for data relocations
    pub instruction_segment_id: Option<usize>,
    pub is_global_variable_relocation: bool,
    /// The relocation itself is malformed and can never be applied
    pub internal_error: bool,
}

impl UnresolvedReference {
    pub fn symbol_name(&self) -> &str {
        &self.relocation.symbol_name
    }

    pub(crate) fn for_text(relocation: &RelocationInfo, segment_id: usize) -> Self {
        UnresolvedReference {
            relocation: relocation.clone(),
            instruction_segment_id: Some(segment_id),
            is_global_variable_relocation: false,
            internal_error: false,
        }
    }

    pub(crate) fn for_data(relocation: &RelocationInfo) -> Self {
        UnresolvedReference {
            relocation: relocation.clone(),
            instruction_segment_id: None,
            is_global_variable_relocation: relocation.target_segment == SegmentType::GlobalVariables,
            internal_error: false,
        }
    }

    pub(crate) fn with_internal_error(mut self) -> Self {
        self.internal_error = true;
        self
    }
}

/// Outcome of a link pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkingStatus {
    /// Malformed relocations; the module cannot be used
    Error,
    /// Some symbols are left for a dynamic link
    LinkedPartially,
    LinkedFully,
}

/// Address range of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentInfo {
    pub gpu_address: u64,
    pub size: usize,
}

impl SegmentInfo {
    pub fn new(gpu_address: u64, size: usize) -> Self {
        SegmentInfo { gpu_address, size }
    }

    pub fn contains(&self, offset: u64, size: u64) -> bool {
        offset
            .checked_add(size)
            .is_some_and(|end| end <= self.size as u64)
    }
}
