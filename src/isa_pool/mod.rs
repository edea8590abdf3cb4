//! Instruction-memory allocation for kernels

pub mod allocation;
pub mod allocator;

pub use allocation::{IsaAllocation, SharedIsaRange};
pub use allocator::{IsaPoolAllocator, IsaPoolStats};
