//! Unified error handling for isaforge
//!
//! This module provides the single error type returned by every public
//! operation of the crate. Errors are categorized so callers can tell apart:
//! - User errors (bad names, unlinked modules, undersized buffers)
//! - Allocation errors (device memory exhausted)
//! - Build errors (reported by the external compiler)
//! - Link errors (unresolved symbols or dependency edges)
//! - Internal errors (bugs, poisoned locks)

use std::fmt;

use crate::device::DeviceError;

/// Unified error type for isaforge
#[derive(Debug, thiserror::Error)]
pub enum IsaForgeError {
    // ========== Allocation Errors ==========
    /// Device allocator could not satisfy a request
    #[error("Out of device memory: {0}")]
    OutOfDeviceMemory(String),

    // ========== Build Errors ==========
    /// The compiler rejected the module input
    #[error("Module build failed: {0}")]
    BuildFailure(String),

    /// Module input format is not understood
    #[error("Invalid module format: {0}")]
    InvalidModuleFormat(String),

    // ========== Link Errors ==========
    /// Symbols or dependency edges could not be resolved
    #[error("Module link failed: {}", .unresolved.join(", "))]
    LinkFailure { unresolved: Vec<String> },

    // ========== User Errors ==========
    /// Kernel requested from a module that is not fully linked
    #[error("Module is not fully linked")]
    InvalidModuleUnlinked,

    /// Kernel name does not exist in the module
    #[error("Invalid kernel name: {0}")]
    InvalidKernelName(String),

    /// Function name does not resolve to an exported function or kernel
    #[error("Invalid function name: {0}")]
    InvalidFunctionName(String),

    /// Global name does not resolve to an exported data symbol
    #[error("Invalid global name: {0}")]
    InvalidGlobalName(String),

    /// Operation requires a capability the module was not built with
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// Caller-supplied buffer is too small
    #[error("Invalid size: required {required} bytes, got {provided}")]
    InvalidSize { required: usize, provided: usize },

    /// Invalid runtime configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Lock poisoned (indicates a bug or a panic while holding a lock)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl IsaForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            IsaForgeError::InvalidModuleUnlinked
            | IsaForgeError::InvalidKernelName(_)
            | IsaForgeError::InvalidFunctionName(_)
            | IsaForgeError::InvalidGlobalName(_)
            | IsaForgeError::UnsupportedFeature(_)
            | IsaForgeError::InvalidSize { .. }
            | IsaForgeError::InvalidConfiguration(_) => ErrorCategory::User,

            IsaForgeError::OutOfDeviceMemory(_) => ErrorCategory::Allocation,

            IsaForgeError::BuildFailure(_) | IsaForgeError::InvalidModuleFormat(_) => {
                ErrorCategory::Build
            }

            IsaForgeError::LinkFailure { .. } => ErrorCategory::Link,

            IsaForgeError::Internal(_) | IsaForgeError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Caller-usage errors never corrupt module state and may simply be
    /// retried with corrected arguments.
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if the failed operation can be retried
    ///
    /// A link failure may succeed later against a different module set.
    /// Allocation failures are never retried automatically, but the caller
    /// may retry once device memory has been released.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::User | ErrorCategory::Link | ErrorCategory::Allocation
        )
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid usage by the caller
    User,
    /// Device memory exhaustion
    Allocation,
    /// Compiler failure
    Build,
    /// Symbol resolution failure
    Link,
    /// Bug or broken invariant
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Allocation => write!(f, "Allocation"),
            ErrorCategory::Build => write!(f, "Build"),
            ErrorCategory::Link => write!(f, "Link"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for IsaForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        IsaForgeError::LockPoisoned(err.to_string())
    }
}

impl From<DeviceError> for IsaForgeError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory { .. } => IsaForgeError::OutOfDeviceMemory(err.to_string()),
            DeviceError::LockPoisoned(msg) => IsaForgeError::LockPoisoned(msg),
            other => IsaForgeError::Internal(other.to_string()),
        }
    }
}

/// Helper type alias for Results using IsaForgeError
pub type ForgeResult<T> = std::result::Result<T, IsaForgeError>;

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("kernel {} has no ISA allocation", name));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::IsaForgeError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::IsaForgeError::Internal(format!($fmt, $($arg)*))
    };
}

/// Convert an option to a result with an internal error
///
/// # Examples
/// ```ignore
/// let pool = weak.upgrade().ok_or_else(|| internal_err("pool already released"))?;
/// ```
pub fn internal_err(msg: &str) -> IsaForgeError {
    IsaForgeError::Internal(msg.to_string())
}
