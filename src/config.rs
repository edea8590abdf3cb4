//! Runtime configuration
//!
//! [`RuntimeConfig`] replaces process-wide debug flags: it is built once and
//! threaded into the ISA pool allocator and every module created on a
//! [`Device`](crate::device::Device).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default trailing padding after a kernel's code, in bytes
pub const DEFAULT_ISA_PADDING: usize = 512;

/// Default start alignment of a kernel's code, in bytes
pub const DEFAULT_ISA_START_ALIGNMENT: usize = 64;

/// Size of the implicit-argument structure, in bytes
pub const DEFAULT_IMPLICIT_ARGS_SIZE: u32 = 128;

const MIB: usize = 1024 * 1024;
const KIB: usize = 1024;

/// Errors produced while reading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: String, value: String },

    #[error("invalid alignment {0}: must be a non-zero power of two")]
    InvalidAlignment(usize),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

/// Where instruction memory lives; decides the ISA pool page size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLocality {
    /// Device-local memory, 2 MiB pages
    #[default]
    Local,
    /// System memory, 64 KiB pages
    System,
}

impl MemoryLocality {
    pub fn page_size(&self) -> usize {
        match self {
            MemoryLocality::Local => 2 * MIB,
            MemoryLocality::System => 64 * KIB,
        }
    }
}

/// Configuration shared by the allocator and the linker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub memory_locality: MemoryLocality,

    /// A debugger is attached: one ISA allocation per kernel, `-g` builds
    pub debugger_attached: bool,

    /// Request uncached instruction memory from the device allocator
    pub force_uncached_isa: bool,

    pub isa_padding: usize,

    pub isa_start_alignment: usize,

    pub implicit_args_size: u32,

    /// Log resolved symbol addresses after the internal link pass
    pub print_relocations: bool,

    /// Extra internal options appended when building builtin modules
    pub internal_build_options: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            memory_locality: MemoryLocality::Local,
            debugger_attached: false,
            force_uncached_isa: false,
            isa_padding: DEFAULT_ISA_PADDING,
            isa_start_alignment: DEFAULT_ISA_START_ALIGNMENT,
            implicit_args_size: DEFAULT_IMPLICIT_ARGS_SIZE,
            print_relocations: false,
            internal_build_options: String::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `ISAFORGE_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_var("ISAFORGE_MEMORY_LOCALITY") {
            config.memory_locality = match value.to_lowercase().as_str() {
                "local" | "device" => MemoryLocality::Local,
                "system" | "host" => MemoryLocality::System,
                _ => return Err(invalid("ISAFORGE_MEMORY_LOCALITY", &value)),
            };
        }
        if let Some(value) = env_var("ISAFORGE_DEBUGGER") {
            config.debugger_attached = parse_flag("ISAFORGE_DEBUGGER", &value)?;
        }
        if let Some(value) = env_var("ISAFORGE_FORCE_UNCACHED_ISA") {
            config.force_uncached_isa = parse_flag("ISAFORGE_FORCE_UNCACHED_ISA", &value)?;
        }
        if let Some(value) = env_var("ISAFORGE_PRINT_RELOCATIONS") {
            config.print_relocations = parse_flag("ISAFORGE_PRINT_RELOCATIONS", &value)?;
        }
        if let Some(value) = env_var("ISAFORGE_INTERNAL_OPTIONS") {
            config.internal_build_options = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.isa_start_alignment == 0 || !self.isa_start_alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(self.isa_start_alignment));
        }
        Ok(())
    }

    /// Page size of an ISA pool for the configured locality
    pub fn isa_page_size(&self) -> usize {
        self.memory_locality.page_size()
    }

    pub fn with_memory_locality(mut self, locality: MemoryLocality) -> Self {
        self.memory_locality = locality;
        self
    }

    pub fn with_debugger_attached(mut self, attached: bool) -> Self {
        self.debugger_attached = attached;
        self
    }

    pub fn with_force_uncached_isa(mut self, uncached: bool) -> Self {
        self.force_uncached_isa = uncached;
        self
    }

    pub fn with_isa_padding(mut self, padding: usize) -> Self {
        self.isa_padding = padding;
        self
    }

    pub fn with_isa_start_alignment(mut self, alignment: usize) -> Self {
        self.isa_start_alignment = alignment;
        self
    }

    pub fn with_implicit_args_size(mut self, size: u32) -> Self {
        self.implicit_args_size = size;
        self
    }

    pub fn with_print_relocations(mut self, enabled: bool) -> Self {
        self.print_relocations = enabled;
        self
    }

    pub fn with_internal_build_options(mut self, options: impl Into<String>) -> Self {
        self.internal_build_options = options.into();
        self
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn invalid(var: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    }
}

fn parse_flag(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(var, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 5] = [
        "ISAFORGE_MEMORY_LOCALITY",
        "ISAFORGE_DEBUGGER",
        "ISAFORGE_FORCE_UNCACHED_ISA",
        "ISAFORGE_PRINT_RELOCATIONS",
        "ISAFORGE_INTERNAL_OPTIONS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.isa_padding, 512);
        assert_eq!(config.isa_start_alignment, 64);
        assert_eq!(config.implicit_args_size, 128);
        assert_eq!(config.isa_page_size(), 2 * 1024 * 1024);
        assert!(!config.debugger_attached);
    }

    #[test]
    fn test_page_size_by_locality() {
        assert_eq!(MemoryLocality::Local.page_size(), 2 * 1024 * 1024);
        assert_eq!(MemoryLocality::System.page_size(), 64 * 1024);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .with_memory_locality(MemoryLocality::System)
            .with_debugger_attached(true)
            .with_force_uncached_isa(true)
            .with_isa_padding(0)
            .with_isa_start_alignment(128)
            .with_print_relocations(true)
            .with_internal_build_options("-internal");

        assert_eq!(config.isa_page_size(), 64 * 1024);
        assert!(config.debugger_attached);
        assert!(config.force_uncached_isa);
        assert_eq!(config.isa_padding, 0);
        assert_eq!(config.isa_start_alignment, 128);
        assert!(config.print_relocations);
        assert_eq!(config.internal_build_options, "-internal");
    }

    #[test]
    fn test_validate_rejects_bad_alignment() {
        assert!(RuntimeConfig::new().with_isa_start_alignment(0).validate().is_err());
        assert!(RuntimeConfig::new().with_isa_start_alignment(48).validate().is_err());
        assert!(RuntimeConfig::new().with_isa_start_alignment(256).validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        std::env::set_var("ISAFORGE_MEMORY_LOCALITY", "system");
        std::env::set_var("ISAFORGE_DEBUGGER", "1");
        std::env::set_var("ISAFORGE_PRINT_RELOCATIONS", "true");
        std::env::set_var("ISAFORGE_INTERNAL_OPTIONS", "-cl-intel-internal");

        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.memory_locality, MemoryLocality::System);
        assert!(config.debugger_attached);
        assert!(config.print_relocations);
        assert!(!config.force_uncached_isa);
        assert_eq!(config.internal_build_options, "-cl-intel-internal");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_garbage() {
        clear_env();
        std::env::set_var("ISAFORGE_DEBUGGER", "maybe");
        assert!(matches!(
            RuntimeConfig::from_env(),
            Err(ConfigError::InvalidValue { .. })
        ));
        clear_env();
    }

    #[test]
    fn test_json_round_trip_with_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"memory_locality":"system","debugger_attached":true}"#)
                .unwrap();
        assert_eq!(config.memory_locality, MemoryLocality::System);
        assert!(config.debugger_attached);
        assert_eq!(config.isa_padding, DEFAULT_ISA_PADDING);
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, r#"{"isa_padding": 256, "print_relocations": true}"#).unwrap();

        let config = RuntimeConfig::from_json_file(&path).unwrap();
        assert_eq!(config.isa_padding, 256);
        assert!(config.print_relocations);
    }
}
