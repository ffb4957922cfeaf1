//! vfxcl - device listing and kernel build checks for vfx-cl

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "vfxcl")]
#[command(author, version, about = "Compute device and kernel tool for vfx-cl")]
#[command(long_about = "
Lists compute devices and test-compiles OpenCL kernel sources,
printing the device compiler's build log on failure.

Examples:
  vfxcl devices                         # Devices of the default class (GPU)
  vfxcl devices --kind all              # Every device on every platform
  vfxcl build blur.cl --entry run       # Compile and extract entry point 'run'
  vfxcl --driver cpu build blur.cl -e run
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Driver to use (defaults to VFX_CL_DRIVER, then auto)
    #[arg(long, global = true, value_enum)]
    driver: Option<DriverArg>,
}

#[derive(Subcommand)]
enum Commands {
    /// List compute devices
    #[command(visible_alias = "d")]
    Devices(DevicesArgs),

    /// Compile a kernel source file
    #[command(visible_alias = "b")]
    Build(BuildArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum DriverArg {
    Auto,
    Opencl,
    Cpu,
}

impl From<DriverArg> for vfx_cl::DriverKind {
    fn from(arg: DriverArg) -> Self {
        match arg {
            DriverArg::Auto => Self::Auto,
            DriverArg::Opencl => Self::OpenCl,
            DriverArg::Cpu => Self::Cpu,
        }
    }
}

#[derive(Args)]
struct DevicesArgs {
    /// Device class: gpu, cpu, accelerator, default, all
    #[arg(short, long)]
    kind: Option<String>,
}

#[derive(Args)]
struct BuildArgs {
    /// Kernel source file
    input: PathBuf,

    /// Entry point to extract
    #[arg(short, long)]
    entry: String,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "vfx_cl=debug,vfxcl=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = vfx_cl::SessionConfig::from_env();
    if let Some(driver) = cli.driver {
        config.driver = driver.into();
    }

    match cli.command {
        Commands::Devices(args) => commands::devices::run(args, &config, cli.verbose),
        Commands::Build(args) => commands::build::run(args, &config, cli.verbose),
    }
}
