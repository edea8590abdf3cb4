//! Translation of user build flags into compiler options and module
//! capabilities

use super::ModuleType;
use crate::config::RuntimeConfig;
use crate::program::CompileOptions;

pub const OPT_DISABLE: &str = "-ze-opt-disable";
pub const CL_OPT_DISABLE: &str = "-cl-opt-disable";
pub const GREATER_THAN_4GB_REQUIRED: &str = "-ze-opt-greater-than-4GB-buffer-required";
pub const CL_GREATER_THAN_4GB_REQUIRED: &str = "-cl-intel-greater-than-4GB-buffer-required";
pub const LIBRARY_COMPILATION: &str = "-library-compilation";
pub const TAKE_GLOBAL_ADDRESS: &str = "-ze-take-global-address";
pub const DEBUG_INFO: &str = "-g";

/// Effective options plus the capabilities they enable
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    pub compile: CompileOptions,
    pub function_symbol_export: bool,
    pub global_symbol_export: bool,
}

fn append(options: &mut String, flag: &str) {
    if !options.is_empty() {
        options.push(' ');
    }
    options.push_str(flag);
}

/// Remove every occurrence of `src`; true when it was present
fn take_flag(flags: &mut Vec<&str>, src: &str) -> bool {
    let before = flags.len();
    flags.retain(|f| *f != src);
    flags.len() != before
}

impl BuildOptions {
    pub fn parse(user_flags: &str, module_type: ModuleType, config: &RuntimeConfig) -> Self {
        let mut flags: Vec<&str> = user_flags.split_whitespace().collect();
        let mut internal = String::new();

        let function_symbol_export = take_flag(&mut flags, LIBRARY_COMPILATION);
        if function_symbol_export {
            append(&mut internal, LIBRARY_COMPILATION);
        }
        let global_symbol_export = take_flag(&mut flags, TAKE_GLOBAL_ADDRESS);
        if global_symbol_export {
            append(&mut internal, TAKE_GLOBAL_ADDRESS);
        }
        if take_flag(&mut flags, GREATER_THAN_4GB_REQUIRED) {
            append(&mut internal, CL_GREATER_THAN_4GB_REQUIRED);
        }
        for flag in flags.iter_mut() {
            if *flag == OPT_DISABLE {
                *flag = CL_OPT_DISABLE;
            }
        }

        if config.debugger_attached {
            append(&mut internal, DEBUG_INFO);
        }
        if module_type == ModuleType::Builtin && !config.internal_build_options.trim().is_empty() {
            append(&mut internal, config.internal_build_options.trim());
        }

        BuildOptions {
            compile: CompileOptions {
                options: flags.join(" "),
                internal_options: internal,
            },
            function_symbol_export,
            global_symbol_export,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_flags_pass_through() {
        let opts = BuildOptions::parse("-cl-fast-relaxed-math", ModuleType::User, &RuntimeConfig::default());
        assert_eq!(opts.compile.options, "-cl-fast-relaxed-math");
        assert_eq!(opts.compile.internal_options, "");
        assert!(!opts.function_symbol_export);
        assert!(!opts.global_symbol_export);
    }

    #[test]
    fn test_opt_disable_is_renamed() {
        let opts = BuildOptions::parse("-ze-opt-disable", ModuleType::User, &RuntimeConfig::default());
        assert_eq!(opts.compile.options, "-cl-opt-disable");
    }

    #[test]
    fn test_large_buffer_flag_moves_to_internal() {
        let opts = BuildOptions::parse(
            "-ze-opt-greater-than-4GB-buffer-required -x",
            ModuleType::User,
            &RuntimeConfig::default(),
        );
        assert_eq!(opts.compile.options, "-x");
        assert_eq!(opts.compile.internal_options, "-cl-intel-greater-than-4GB-buffer-required");
    }

    #[test]
    fn test_export_flags_enable_capabilities() {
        let opts = BuildOptions::parse(
            "-library-compilation -ze-take-global-address",
            ModuleType::User,
            &RuntimeConfig::default(),
        );
        assert!(opts.function_symbol_export);
        assert!(opts.global_symbol_export);
        assert_eq!(opts.compile.options, "");
        assert!(opts.compile.has_internal_option("-library-compilation"));
    }

    #[test]
    fn test_debugger_and_builtin_internal_options() {
        let config = RuntimeConfig::new()
            .with_debugger_attached(true)
            .with_internal_build_options("-cl-intel-builtin");
        let user = BuildOptions::parse("", ModuleType::User, &config);
        assert_eq!(user.compile.internal_options, "-g");

        let builtin = BuildOptions::parse("", ModuleType::Builtin, &config);
        assert_eq!(builtin.compile.internal_options, "-g -cl-intel-builtin");
    }
}
