//! Symbol relocation and patching: the per-module internal pass, the
//! cross-module dynamic pass and linkage inspection

pub mod dependencies;
pub mod dynamic;
pub mod inspect;
pub mod internal;
pub mod messages;
pub mod patch;
pub mod types;

pub use dependencies::{resolve_function_dependencies, DependencyResolution};
pub use dynamic::perform_dynamic_link;
pub use inspect::{inspect_linkage, LinkageInspectionFlags};
pub use internal::{
    DataSegment, InstructionSegment, LinkOutput, LinkSegments, Linker, IMPLICIT_ARGS_SYMBOL,
};
pub use messages::{construct_linker_error_message, construct_relocations_debug_message};
pub use patch::{patch_data, patch_instruction, patch_value, patch_width, PatchError};
pub use types::{LinkingStatus, ResolvedSymbol, SegmentInfo, UnresolvedReference};
