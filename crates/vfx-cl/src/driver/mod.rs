//! Compute drivers: the raw device API the bridge is written against.
//!
//! [`ComputeDriver`] mirrors the OpenCL entry points the bridge needs. Two
//! implementations exist:
//!
//! - [`CpuDriver`]: host reference device, always available.
//! - `OpenClDriver`: real OpenCL runtime via `ocl`, behind the `opencl` feature.
//!
//! Handles are opaque ids returned by value. Every call reports a raw
//! [`Status`] on failure; the session layer attaches the stage tag.

pub mod cpu;
mod frontend;
mod types;

#[cfg(feature = "opencl")]
pub mod opencl;

pub use cpu::{CpuDriver, CpuDriverBuilder, Dispatch, DriverCall, HostKernel, LiveObjects};
pub use types::{
    BuildStatus, ContextId, DeviceId, DeviceInfo, DeviceKind, DriverResult, KernelArg, KernelId,
    MemFlags, MemId, PlatformId, ProgramId, QueueId, Status,
};

#[cfg(feature = "opencl")]
pub use opencl::OpenClDriver;

use std::sync::Arc;

use crate::format::ImageFormat;
use crate::ClResult;

/// Available driver implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriverKind {
    /// OpenCL when compiled in, otherwise the reference device.
    #[default]
    Auto,
    /// Native OpenCL runtime.
    OpenCl,
    /// Host reference device.
    Cpu,
}

impl DriverKind {
    /// Whether this driver is compiled into the crate.
    pub fn is_compiled(&self) -> bool {
        match self {
            Self::Auto | Self::Cpu => true,
            Self::OpenCl => cfg!(feature = "opencl"),
        }
    }
}

/// Raw device API.
///
/// All methods take `&self`; implementations synchronize internally.
pub trait ComputeDriver: Send + Sync {
    /// Driver name.
    fn name(&self) -> &'static str;

    fn platforms(&self) -> DriverResult<Vec<PlatformId>>;

    /// Devices of `kind` on `platform`. May fail with `DEVICE_NOT_FOUND`.
    fn devices(&self, platform: PlatformId, kind: DeviceKind) -> DriverResult<Vec<DeviceId>>;

    fn device_info(&self, device: DeviceId) -> DriverResult<DeviceInfo>;

    /// Context containing only `device`.
    fn create_context(&self, device: DeviceId) -> DriverResult<ContextId>;

    fn create_queue(&self, context: ContextId, device: DeviceId) -> DriverResult<QueueId>;

    fn create_program(&self, context: ContextId, source: &str) -> DriverResult<ProgramId>;

    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> DriverResult<()>;

    fn build_status(&self, program: ProgramId, device: DeviceId) -> DriverResult<BuildStatus>;

    fn build_log(&self, program: ProgramId, device: DeviceId) -> DriverResult<String>;

    fn create_kernel(&self, program: ProgramId, name: &str) -> DriverResult<KernelId>;

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg<'_>) -> DriverResult<()>;

    /// 2D image. `host` is the initial content, required when `flags`
    /// take host data and rejected otherwise.
    ///
    /// With `USE_HOST_PTR` the device may keep using `host` in place: the
    /// caller keeps those bytes alive and unmoved until `release_mem`.
    #[allow(clippy::too_many_arguments)]
    fn create_image_2d(
        &self,
        context: ContextId,
        flags: MemFlags,
        format: ImageFormat,
        width: usize,
        height: usize,
        row_pitch: usize,
        host: Option<&[u8]>,
    ) -> DriverResult<MemId>;

    /// Buffer of `len` bytes. `host` follows the rules of `create_image_2d`,
    /// including the `USE_HOST_PTR` lifetime requirement.
    fn create_buffer(
        &self,
        context: ContextId,
        flags: MemFlags,
        len: usize,
        host: Option<&[u8]>,
    ) -> DriverResult<MemId>;

    fn enqueue_write_image(
        &self,
        queue: QueueId,
        image: MemId,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        data: &[u8],
    ) -> DriverResult<()>;

    fn enqueue_read_image(
        &self,
        queue: QueueId,
        image: MemId,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        data: &mut [u8],
    ) -> DriverResult<()>;

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        work_dim: u32,
        global: [usize; 3],
    ) -> DriverResult<()>;

    /// Block until every command on `queue` completed.
    fn finish(&self, queue: QueueId) -> DriverResult<()>;

    fn release_mem(&self, mem: MemId) -> DriverResult<()>;

    fn release_kernel(&self, kernel: KernelId) -> DriverResult<()>;

    fn release_program(&self, program: ProgramId) -> DriverResult<()>;

    fn release_queue(&self, queue: QueueId) -> DriverResult<()>;

    fn release_context(&self, context: ContextId) -> DriverResult<()>;
}

/// Create a driver instance.
pub fn create_driver(kind: DriverKind) -> ClResult<Arc<dyn ComputeDriver>> {
    match kind {
        DriverKind::Auto => {
            #[cfg(feature = "opencl")]
            {
                create_driver(DriverKind::OpenCl)
            }
            #[cfg(not(feature = "opencl"))]
            {
                create_driver(DriverKind::Cpu)
            }
        }
        DriverKind::Cpu => Ok(Arc::new(CpuDriver::with_stock_kernels())),
        DriverKind::OpenCl => {
            #[cfg(feature = "opencl")]
            {
                Ok(Arc::new(OpenClDriver::new()))
            }
            #[cfg(not(feature = "opencl"))]
            {
                Err(crate::ClError::new(
                    crate::Stage::Platform,
                    "opencl feature not enabled",
                ))
            }
        }
    }
}
