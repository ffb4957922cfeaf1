//! Session configuration.
//!
//! # Environment Variables
//!
//! - `VFX_CL_DRIVER` - `auto`, `opencl` or `cpu`
//! - `VFX_CL_DEVICE_TYPE` - `gpu`, `cpu`, `accelerator`, `default` or `all`
//!
//! Unknown values are ignored with a warning and the default is kept.

use std::env;
use std::str::FromStr;

use tracing::warn;

use crate::driver::{DeviceKind, DriverKind};

/// Driver selection override.
pub const ENV_DRIVER: &str = "VFX_CL_DRIVER";
/// Device class override.
pub const ENV_DEVICE_TYPE: &str = "VFX_CL_DEVICE_TYPE";

/// How a session picks its driver and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    pub driver: DriverKind,
    /// Device class enumerated on every platform.
    pub device_kind: DeviceKind,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Auto,
            device_kind: DeviceKind::GPU,
        }
    }
}

impl SessionConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Defaults with overrides read through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_DRIVER) {
            match value.parse() {
                Ok(driver) => config.driver = driver,
                Err(e) => warn!(var = ENV_DRIVER, %value, "{e}"),
            }
        }
        if let Some(value) = lookup(ENV_DEVICE_TYPE) {
            match parse_device_kind(&value) {
                Ok(kind) => config.device_kind = kind,
                Err(e) => warn!(var = ENV_DEVICE_TYPE, %value, "{e}"),
            }
        }
        config
    }

    pub fn with_driver(mut self, driver: DriverKind) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_device_kind(mut self, kind: DeviceKind) -> Self {
        self.device_kind = kind;
        self
    }
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(Self::Auto),
            "opencl" | "cl" => Ok(Self::OpenCl),
            "cpu" | "host" => Ok(Self::Cpu),
            other => Err(format!("unknown driver '{other}'")),
        }
    }
}

/// Parse a device class name.
pub fn parse_device_kind(s: &str) -> Result<DeviceKind, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "gpu" => Ok(DeviceKind::GPU),
        "cpu" => Ok(DeviceKind::CPU),
        "accelerator" | "acc" => Ok(DeviceKind::ACCELERATOR),
        "default" => Ok(DeviceKind::DEFAULT),
        "all" | "any" => Ok(DeviceKind::ALL),
        other => Err(format!("unknown device type '{other}'")),
    }
}
