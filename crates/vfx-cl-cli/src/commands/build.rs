//! Kernel build command.
//!
//! Compiles a source file on the selected device and extracts the entry
//! point. On failure the build log is printed as the compiler wrote it.

use crate::BuildArgs;
use anyhow::{bail, Context, Result};
use tracing::info;
use vfx_cl::{compile_file, DeviceSession, SessionConfig, Stage};

/// Runs the build command.
pub fn run(args: BuildArgs, config: &SessionConfig, verbose: bool) -> Result<()> {
    let session = DeviceSession::from_config(config).context("Failed to open device session")?;
    let Some(device) = session.device_info() else {
        bail!("No image-capable device available");
    };
    if verbose {
        println!("Device: {} ({})", device.name, device.vendor);
    }

    match compile_file(&session, &args.input, &args.entry) {
        Ok(bridge) => {
            info!(entry = bridge.entry_point(), "kernel built");
            println!("{}: '{}' OK", args.input.display(), args.entry);
            Ok(())
        }
        Err(e) if matches!(e.stage, Stage::CompileBuild | Stage::CompileStatus) => {
            eprintln!("{}", e.detail.trim_end());
            bail!("Build failed: {}", args.input.display())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to build {}", args.input.display())),
    }
}
