use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use isaforge::linker::{inspect_linkage, perform_dynamic_link, LinkageInspectionFlags};
use isaforge::logging::init_logging_from_env;
use isaforge::module::{BuildLog, Module, ModuleDesc, ModuleFormat};
use isaforge::{Device, RuntimeConfig};

#[derive(Parser, Debug)]
#[command(name = "isaforge-cli", version)]
#[command(about = "Build, link and inspect device program modules", long_about = None)]
struct Cli {
    /// JSON runtime configuration; ISAFORGE_* variables apply when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// How program files are treated
    #[arg(long, value_enum, default_value_t = InputFormat::Native, global = true)]
    format: InputFormat,

    /// Build flags passed to every module
    #[arg(long, default_value = "", global = true)]
    build_flags: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum InputFormat {
    Native,
    Ir,
}

impl From<InputFormat> for ModuleFormat {
    fn from(format: InputFormat) -> Self {
        match format {
            InputFormat::Native => ModuleFormat::Native,
            InputFormat::Ir => ModuleFormat::IntermediateRepresentation,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create one module per program and link the first against all of them
    Link {
        #[arg(required = true)]
        programs: Vec<PathBuf>,
    },
    /// Report imports and exports without linking
    Inspect {
        #[arg(required = true)]
        programs: Vec<PathBuf>,
        #[arg(long)]
        imports: bool,
        #[arg(long)]
        exports: bool,
        #[arg(long)]
        unresolvable: bool,
    },
}

fn main() -> anyhow::Result<()> {
    init_logging_from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    let device = Device::host_simulated(config);

    match cli.command {
        Commands::Link { programs } => {
            let mut modules = create_modules(&device, &programs, cli.format.into(), &cli.build_flags)?;
            let mut log = BuildLog::new();
            let result = {
                let mut refs: Vec<&mut Module> = modules.iter_mut().collect();
                perform_dynamic_link(&mut refs, Some(&mut log))
            };
            if !log.is_empty() {
                println!("{}", log.as_string());
            }
            for module in &modules {
                print_module(module)?;
            }
            result.context("dynamic link failed")?;
        }
        Commands::Inspect {
            programs,
            imports,
            exports,
            unresolvable,
        } => {
            let modules = create_modules(&device, &programs, cli.format.into(), &cli.build_flags)?;
            let mut flags = LinkageInspectionFlags::empty();
            flags.set(LinkageInspectionFlags::IMPORTS, imports);
            flags.set(LinkageInspectionFlags::EXPORTS, exports);
            flags.set(LinkageInspectionFlags::UNRESOLVABLE_IMPORTS, unresolvable);
            if flags.is_empty() {
                flags = LinkageInspectionFlags::all();
            }
            let refs: Vec<&Module> = modules.iter().collect();
            println!("{}", inspect_linkage(&refs, flags).as_string());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::from_env().context("reading ISAFORGE_* configuration")?,
    };
    config.validate().context("invalid runtime configuration")?;
    Ok(config)
}

fn create_modules(
    device: &Device,
    programs: &[PathBuf],
    format: ModuleFormat,
    build_flags: &str,
) -> anyhow::Result<Vec<Module>> {
    let mut modules = Vec::with_capacity(programs.len());
    for path in programs {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let desc = ModuleDesc {
            format,
            ..ModuleDesc::native(&bytes)
        }
        .with_build_flags(build_flags);
        let mut log = BuildLog::new();
        let module = Module::create(device, &desc, Some(&mut log));
        if !log.is_empty() {
            eprintln!("{}: {}", path.display(), log.as_string());
        }
        modules.push(module.with_context(|| format!("building {}", path.display()))?);
    }
    Ok(modules)
}

fn print_module(module: &Module) -> anyhow::Result<()> {
    println!("Module {} ({:?})", module.id(), module.linkage_state());
    for name in module.kernel_names() {
        match module.create_kernel(name) {
            Ok(kernel) => {
                let residency: Vec<String> = kernel
                    .residency()
                    .iter()
                    .map(|a| format!("0x{:x}", a.gpu_address()))
                    .collect();
                println!(
                    "  {} isa=0x{:x} ({} bytes) residency=[{}]",
                    kernel.name(),
                    kernel.isa_gpu_address(),
                    kernel.isa_size(),
                    residency.join(", ")
                );
            }
            Err(e) => println!("  {} unavailable: {}", name, e),
        }
    }
    Ok(())
}
