//! Compiler front-end seam
//!
//! The runtime never compiles code itself: it asks a [`ModuleCompiler`] to
//! decode a native binary or build an intermediate representation, and gets
//! back a [`ProgramInfo`] plus log text.

use super::descriptor::ProgramInfo;

/// Options handed to the compiler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileOptions {
    pub options: String,
    pub internal_options: String,
}

impl CompileOptions {
    pub fn has_option(&self, flag: &str) -> bool {
        self.options.split_whitespace().any(|o| o == flag)
    }

    pub fn has_internal_option(&self, flag: &str) -> bool {
        self.internal_options.split_whitespace().any(|o| o == flag)
    }
}

/// Result of one compiler invocation
#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    /// `None` when the input was rejected
    pub program: Option<ProgramInfo>,
    pub log: String,
    /// Packed device binary for the built program
    pub native_binary: Vec<u8>,
}

impl CompileOutput {
    pub fn failed(log: impl Into<String>) -> Self {
        CompileOutput {
            program: None,
            log: log.into(),
            native_binary: Vec::new(),
        }
    }
}

pub trait ModuleCompiler: Send + Sync {
    fn decode_native(&self, binary: &[u8], options: &CompileOptions) -> CompileOutput;

    fn build_from_ir(&self, input: &[u8], options: &CompileOptions) -> CompileOutput;
}

/// Reference compiler: programs are JSON-encoded [`ProgramInfo`] values.
///
/// IR builds honour `-g` in the internal options by marking every kernel
/// debuggable, and record the effective options in the build log.
#[derive(Debug, Default, Clone)]
pub struct JsonProgramCompiler;

impl JsonProgramCompiler {
    pub fn new() -> Self {
        JsonProgramCompiler
    }

    fn parse(bytes: &[u8]) -> Result<ProgramInfo, String> {
        if bytes.is_empty() {
            return Err("empty input".to_string());
        }
        serde_json::from_slice(bytes).map_err(|e| format!("malformed program: {}", e))
    }
}

impl ModuleCompiler for JsonProgramCompiler {
    fn decode_native(&self, binary: &[u8], _options: &CompileOptions) -> CompileOutput {
        match Self::parse(binary) {
            Ok(program) => CompileOutput {
                log: program.build_log.clone(),
                program: Some(program),
                native_binary: binary.to_vec(),
            },
            Err(e) => CompileOutput::failed(format!("error : {}", e)),
        }
    }

    fn build_from_ir(&self, input: &[u8], options: &CompileOptions) -> CompileOutput {
        let mut program = match Self::parse(input) {
            Ok(program) => program,
            Err(e) => return CompileOutput::failed(format!("error : {}", e)),
        };

        if options.has_internal_option("-g") {
            for kernel in &mut program.kernels {
                kernel.descriptor.attributes.flags.supports_debugging = true;
            }
        }

        let mut log = program.build_log.clone();
        let effective = format!("{} {}", options.options, options.internal_options);
        if !effective.trim().is_empty() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str("build options: ");
            log.push_str(effective.trim());
        }
        program.build_log = log.clone();

        match serde_json::to_vec(&program) {
            Ok(native_binary) => CompileOutput {
                program: Some(program),
                log,
                native_binary,
            },
            Err(e) => CompileOutput::failed(format!("error : cannot pack binary: {}", e)),
        }
    }
}
