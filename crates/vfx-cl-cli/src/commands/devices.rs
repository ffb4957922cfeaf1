//! Device listing command.
//!
//! Shows every device of the requested class and marks the one a session
//! would select.

use crate::DevicesArgs;
use anyhow::{anyhow, Context, Result};
use tracing::debug;
use vfx_cl::{config::parse_device_kind, create_driver, describe_devices, SessionConfig};

/// Runs the devices command.
pub fn run(args: DevicesArgs, config: &SessionConfig, verbose: bool) -> Result<()> {
    let kind = match &args.kind {
        Some(k) => parse_device_kind(k).map_err(|e| anyhow!(e))?,
        None => config.device_kind,
    };
    let driver = create_driver(config.driver).context("Failed to create driver")?;
    debug!(driver = driver.name(), ?kind, "listing devices");

    let devices = describe_devices(driver.as_ref(), kind).context("Failed to enumerate devices")?;
    if devices.is_empty() {
        println!("No devices found ({} driver)", driver.name());
        return Ok(());
    }

    // Sessions take the first image-capable device.
    let selected = devices.iter().position(|d| d.info.image_support);

    println!("Driver: {}", driver.name());
    for (i, d) in devices.iter().enumerate() {
        let mark = if Some(i) == selected { "*" } else { " " };
        println!("{} [{}] {} ({})", mark, i, d.info.name, d.info.vendor);
        if verbose {
            println!("      Platform:  {}", d.platform);
            println!("      Device:    {}", d.device);
            println!("      Kind:      {:?}", d.info.kind);
        }
        println!("      Memory:    {}", super::format_size(d.info.global_mem_bytes));
        println!("      Images:    {}", if d.info.image_support { "yes" } else { "no" });
    }
    if selected.is_none() {
        println!("No image-capable device: sessions will be unavailable");
    }

    Ok(())
}
