//! Device allocator error types

use thiserror::Error;

/// Errors reported by a [`DeviceAllocator`](super::DeviceAllocator)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("device out of memory: requested {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("unknown allocation id {0}")]
    UnknownAllocation(u64),
    #[error("access out of bounds: allocation {id} of {size} bytes, offset {offset} + {len}")]
    OutOfBounds {
        id: u64,
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("invalid allocation request: {0}")]
    InvalidRequest(String),
    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for DeviceError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DeviceError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Device result type
pub type DeviceResult<T> = Result<T, DeviceError>;
