//! Handles, flags and status codes shared by all drivers.

use std::fmt;

use bitflags::bitflags;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle!(
    /// Compute platform.
    PlatformId
);
handle!(
    /// Device on a platform.
    DeviceId
);
handle!(
    /// Compute context.
    ContextId
);
handle!(
    /// Command queue.
    QueueId
);
handle!(
    /// Program object built from source.
    ProgramId
);
handle!(
    /// Kernel extracted from a program.
    KernelId
);
handle!(
    /// Device memory object (buffer or image).
    MemId
);

bitflags! {
    /// Memory allocation and access flags, using OpenCL bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u64 {
        const READ_WRITE = 1;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR = 1 << 5;
    }
}

impl MemFlags {
    pub const NONE: Self = Self::empty();

    /// Whether an allocation with these flags takes initial host content.
    pub fn takes_host_data(&self) -> bool {
        self.intersects(Self::COPY_HOST_PTR | Self::USE_HOST_PTR)
    }
}

impl Default for MemFlags {
    fn default() -> Self {
        Self::COPY_HOST_PTR
    }
}

bitflags! {
    /// Device classes to enumerate, using OpenCL bit values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceKind: u64 {
        const DEFAULT = 1;
        const CPU = 1 << 1;
        const GPU = 1 << 2;
        const ACCELERATOR = 1 << 3;
        const ALL = 0xFFFF_FFFF;
    }
}

impl Default for DeviceKind {
    fn default() -> Self {
        Self::GPU
    }
}

/// Device properties reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub kind: DeviceKind,
    pub global_mem_bytes: u64,
    pub image_support: bool,
}

/// Program build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success,
    None,
    Error,
    InProgress,
}

/// Value assigned to a kernel argument slot.
#[derive(Debug, Clone, Copy)]
pub enum KernelArg<'a> {
    /// Device buffer or image.
    Mem(MemId),
    /// Raw bytes of a plain value.
    Bytes(&'a [u8]),
}

/// Non-success status returned by a driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: i32,
    pub detail: Option<String>,
}

impl Status {
    pub const DEVICE_NOT_FOUND: i32 = -1;
    pub const DEVICE_NOT_AVAILABLE: i32 = -2;
    pub const MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
    pub const OUT_OF_RESOURCES: i32 = -5;
    pub const OUT_OF_HOST_MEMORY: i32 = -6;
    pub const IMAGE_FORMAT_NOT_SUPPORTED: i32 = -10;
    pub const BUILD_PROGRAM_FAILURE: i32 = -11;
    pub const INVALID_VALUE: i32 = -30;
    pub const INVALID_DEVICE_TYPE: i32 = -31;
    pub const INVALID_PLATFORM: i32 = -32;
    pub const INVALID_DEVICE: i32 = -33;
    pub const INVALID_CONTEXT: i32 = -34;
    pub const INVALID_COMMAND_QUEUE: i32 = -36;
    pub const INVALID_HOST_PTR: i32 = -37;
    pub const INVALID_MEM_OBJECT: i32 = -38;
    pub const INVALID_IMAGE_SIZE: i32 = -40;
    pub const INVALID_BUILD_OPTIONS: i32 = -43;
    pub const INVALID_PROGRAM: i32 = -44;
    pub const INVALID_PROGRAM_EXECUTABLE: i32 = -45;
    pub const INVALID_KERNEL_NAME: i32 = -46;
    pub const INVALID_KERNEL: i32 = -48;
    pub const INVALID_ARG_INDEX: i32 = -49;
    pub const INVALID_ARG_VALUE: i32 = -50;
    pub const INVALID_ARG_SIZE: i32 = -51;
    pub const INVALID_KERNEL_ARGS: i32 = -52;
    pub const INVALID_WORK_DIMENSION: i32 = -53;
    pub const INVALID_OPERATION: i32 = -59;
    pub const INVALID_BUFFER_SIZE: i32 = -61;
    pub const INVALID_GLOBAL_WORK_SIZE: i32 = -63;
    /// ICD loader found no platform (`cl_khr_icd`).
    pub const PLATFORM_NOT_FOUND_KHR: i32 = -1001;
    /// Failure that did not come from an API status code.
    pub const UNKNOWN: i32 = -9999;

    pub fn new(code: i32) -> Self {
        Self { code, detail: None }
    }

    pub fn with_detail(code: i32, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: Some(detail.into()),
        }
    }

    /// OpenCL name of the status code.
    pub fn name(&self) -> &'static str {
        match self.code {
            Self::DEVICE_NOT_FOUND => "CL_DEVICE_NOT_FOUND",
            Self::DEVICE_NOT_AVAILABLE => "CL_DEVICE_NOT_AVAILABLE",
            Self::MEM_OBJECT_ALLOCATION_FAILURE => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            Self::OUT_OF_RESOURCES => "CL_OUT_OF_RESOURCES",
            Self::OUT_OF_HOST_MEMORY => "CL_OUT_OF_HOST_MEMORY",
            Self::IMAGE_FORMAT_NOT_SUPPORTED => "CL_IMAGE_FORMAT_NOT_SUPPORTED",
            Self::BUILD_PROGRAM_FAILURE => "CL_BUILD_PROGRAM_FAILURE",
            Self::INVALID_VALUE => "CL_INVALID_VALUE",
            Self::INVALID_DEVICE_TYPE => "CL_INVALID_DEVICE_TYPE",
            Self::INVALID_PLATFORM => "CL_INVALID_PLATFORM",
            Self::INVALID_DEVICE => "CL_INVALID_DEVICE",
            Self::INVALID_CONTEXT => "CL_INVALID_CONTEXT",
            Self::INVALID_COMMAND_QUEUE => "CL_INVALID_COMMAND_QUEUE",
            Self::INVALID_HOST_PTR => "CL_INVALID_HOST_PTR",
            Self::INVALID_MEM_OBJECT => "CL_INVALID_MEM_OBJECT",
            Self::INVALID_IMAGE_SIZE => "CL_INVALID_IMAGE_SIZE",
            Self::INVALID_BUILD_OPTIONS => "CL_INVALID_BUILD_OPTIONS",
            Self::INVALID_PROGRAM => "CL_INVALID_PROGRAM",
            Self::INVALID_PROGRAM_EXECUTABLE => "CL_INVALID_PROGRAM_EXECUTABLE",
            Self::INVALID_KERNEL_NAME => "CL_INVALID_KERNEL_NAME",
            Self::INVALID_KERNEL => "CL_INVALID_KERNEL",
            Self::INVALID_ARG_INDEX => "CL_INVALID_ARG_INDEX",
            Self::INVALID_ARG_VALUE => "CL_INVALID_ARG_VALUE",
            Self::INVALID_ARG_SIZE => "CL_INVALID_ARG_SIZE",
            Self::INVALID_KERNEL_ARGS => "CL_INVALID_KERNEL_ARGS",
            Self::INVALID_WORK_DIMENSION => "CL_INVALID_WORK_DIMENSION",
            Self::INVALID_OPERATION => "CL_INVALID_OPERATION",
            Self::INVALID_BUFFER_SIZE => "CL_INVALID_BUFFER_SIZE",
            Self::INVALID_GLOBAL_WORK_SIZE => "CL_INVALID_GLOBAL_WORK_SIZE",
            Self::PLATFORM_NOT_FOUND_KHR => "CL_PLATFORM_NOT_FOUND_KHR",
            _ => "CL_UNKNOWN_STATUS",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code)?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Status {}

pub type DriverResult<T> = Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display_uses_cl_name() {
        let s = Status::with_detail(Status::INVALID_KERNEL_NAME, "run");
        assert_eq!(s.to_string(), "CL_INVALID_KERNEL_NAME (-46): run");
        assert_eq!(Status::new(-9999).name(), "CL_UNKNOWN_STATUS");
    }

    #[test]
    fn mem_flags_match_opencl_bits() {
        assert_eq!(MemFlags::NONE.bits(), 0);
        assert_eq!(MemFlags::READ_WRITE.bits(), 1);
        assert_eq!(MemFlags::WRITE_ONLY.bits(), 2);
        assert_eq!(MemFlags::READ_ONLY.bits(), 4);
        assert_eq!(MemFlags::USE_HOST_PTR.bits(), 8);
        assert_eq!(MemFlags::ALLOC_HOST_PTR.bits(), 16);
        assert_eq!(MemFlags::COPY_HOST_PTR.bits(), 32);
        assert!(MemFlags::default().takes_host_data());
        assert!(!MemFlags::READ_WRITE.takes_host_data());
    }
}
