//! OpenCL runtime driver built on `ocl::core`.
//!
//! Every object returned by the runtime is kept in a table keyed by the id
//! handed out to callers; releasing an id drops the `ocl` object, which
//! releases the underlying `cl_*` handle.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::sync::{Mutex, MutexGuard, PoisonError};

use ocl::core::{self, ArgVal, DeviceInfoResult, Event, ProgramBuildInfoResult};
use tracing::{debug, trace};

use super::{
    BuildStatus, ComputeDriver, ContextId, DeviceId, DeviceInfo, DeviceKind, DriverResult,
    KernelArg, KernelId, MemFlags, MemId, PlatformId, ProgramId, QueueId, Status,
};
use crate::format::{ChannelOrder, ChannelType, ImageFormat};

#[derive(Default)]
struct Tables {
    next_id: u64,
    platforms: Vec<core::PlatformId>,
    devices: Vec<core::DeviceId>,
    contexts: HashMap<u64, core::Context>,
    queues: HashMap<u64, core::CommandQueue>,
    programs: HashMap<u64, core::Program>,
    kernels: HashMap<u64, core::Kernel>,
    mems: HashMap<u64, core::Mem>,
}

impl Tables {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn device(&self, id: DeviceId) -> DriverResult<core::DeviceId> {
        (id.raw() as usize)
            .checked_sub(1)
            .and_then(|i| self.devices.get(i).copied())
            .ok_or_else(|| Status::new(Status::INVALID_DEVICE))
    }

    fn device_handle(&mut self, device: core::DeviceId) -> DeviceId {
        let index = match self.devices.iter().position(|d| *d == device) {
            Some(i) => i,
            None => {
                self.devices.push(device);
                self.devices.len() - 1
            }
        };
        DeviceId::from_raw(index as u64 + 1)
    }
}

/// [`ComputeDriver`] backed by the system OpenCL runtime.
pub struct OpenClDriver {
    tables: Mutex<Tables>,
}

impl Default for OpenClDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OpenClDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClDriver").finish_non_exhaustive()
    }
}

impl OpenClDriver {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Map an `ocl` error onto the raw status it carries.
fn status(e: core::Error) -> Status {
    match e.api_status() {
        Some(s) => Status::with_detail(s as i32, e.to_string()),
        None => Status::with_detail(Status::UNKNOWN, e.to_string()),
    }
}

fn channel_order(order: ChannelOrder) -> core::ImageChannelOrder {
    use core::ImageChannelOrder as O;
    match order {
        ChannelOrder::R => O::R,
        ChannelOrder::A => O::A,
        ChannelOrder::Rg => O::Rg,
        ChannelOrder::Ra => O::Ra,
        ChannelOrder::Rgb => O::Rgb,
        ChannelOrder::Rgba => O::Rgba,
        ChannelOrder::Bgra => O::Bgra,
        ChannelOrder::Argb => O::Argb,
        ChannelOrder::Intensity => O::Intensity,
        ChannelOrder::Luminance => O::Luminance,
    }
}

fn channel_type(ty: ChannelType) -> core::ImageChannelDataType {
    use core::ImageChannelDataType as T;
    match ty {
        ChannelType::SnormInt8 => T::SnormInt8,
        ChannelType::SnormInt16 => T::SnormInt16,
        ChannelType::UnormInt8 => T::UnormInt8,
        ChannelType::UnormInt16 => T::UnormInt16,
        ChannelType::UnormShort565 => T::UnormShort565,
        ChannelType::UnormShort555 => T::UnormShort555,
        ChannelType::UnormInt101010 => T::UnormInt101010,
        ChannelType::SignedInt8 => T::SignedInt8,
        ChannelType::SignedInt16 => T::SignedInt16,
        ChannelType::SignedInt32 => T::SignedInt32,
        ChannelType::UnsignedInt8 => T::UnsignedInt8,
        ChannelType::UnsignedInt16 => T::UnsignedInt16,
        ChannelType::UnsignedInt32 => T::UnsignedInt32,
        ChannelType::HalfFloat => T::HalfFloat,
        ChannelType::Float => T::Float,
    }
}

fn c_string(s: &str) -> DriverResult<CString> {
    CString::new(s).map_err(|_| Status::with_detail(Status::INVALID_VALUE, "string contains NUL"))
}

impl ComputeDriver for OpenClDriver {
    fn name(&self) -> &'static str {
        "opencl"
    }

    fn platforms(&self) -> DriverResult<Vec<PlatformId>> {
        let ids = core::get_platform_ids().map_err(status)?;
        let mut t = self.lock();
        t.platforms = ids;
        Ok((1..=t.platforms.len() as u64).map(PlatformId::from_raw).collect())
    }

    fn devices(&self, platform: PlatformId, kind: DeviceKind) -> DriverResult<Vec<DeviceId>> {
        let p = {
            let t = self.lock();
            (platform.raw() as usize)
                .checked_sub(1)
                .and_then(|i| t.platforms.get(i).copied())
                .ok_or_else(|| Status::new(Status::INVALID_PLATFORM))?
        };
        let types = core::DeviceType::from_bits_truncate(kind.bits());
        let ids = core::get_device_ids(p, Some(types), None).map_err(status)?;
        let mut t = self.lock();
        Ok(ids.into_iter().map(|d| t.device_handle(d)).collect())
    }

    fn device_info(&self, device: DeviceId) -> DriverResult<DeviceInfo> {
        let d = self.lock().device(device)?;
        let query = |req| core::get_device_info(d, req).map_err(status);

        let name = match query(core::DeviceInfo::Name)? {
            DeviceInfoResult::Name(s) => s,
            other => other.to_string(),
        };
        let vendor = match query(core::DeviceInfo::Vendor)? {
            DeviceInfoResult::Vendor(s) => s,
            other => other.to_string(),
        };
        let kind = match query(core::DeviceInfo::Type)? {
            DeviceInfoResult::Type(t) => DeviceKind::from_bits_truncate(t.bits()),
            _ => DeviceKind::DEFAULT,
        };
        let global_mem_bytes = match query(core::DeviceInfo::GlobalMemSize)? {
            DeviceInfoResult::GlobalMemSize(n) => n,
            _ => 0,
        };
        let image_support = matches!(
            query(core::DeviceInfo::ImageSupport)?,
            DeviceInfoResult::ImageSupport(true)
        );
        Ok(DeviceInfo {
            name: name.trim_end_matches('\0').to_string(),
            vendor: vendor.trim_end_matches('\0').to_string(),
            kind,
            global_mem_bytes,
            image_support,
        })
    }

    fn create_context(&self, device: DeviceId) -> DriverResult<ContextId> {
        let mut t = self.lock();
        let d = t.device(device)?;
        let ctx = core::create_context(None, &[d], None, None).map_err(status)?;
        let id = t.alloc_id();
        t.contexts.insert(id, ctx);
        Ok(ContextId::from_raw(id))
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> DriverResult<QueueId> {
        let mut t = self.lock();
        let d = t.device(device)?;
        let ctx = t
            .contexts
            .get(&context.raw())
            .ok_or_else(|| Status::new(Status::INVALID_CONTEXT))?;
        let queue = core::create_command_queue(ctx, d, None).map_err(status)?;
        let id = t.alloc_id();
        t.queues.insert(id, queue);
        Ok(QueueId::from_raw(id))
    }

    fn create_program(&self, context: ContextId, source: &str) -> DriverResult<ProgramId> {
        let src = c_string(source)?;
        let mut t = self.lock();
        let ctx = t
            .contexts
            .get(&context.raw())
            .ok_or_else(|| Status::new(Status::INVALID_CONTEXT))?;
        let program = core::create_program_with_source(ctx, &[src]).map_err(status)?;
        let id = t.alloc_id();
        t.programs.insert(id, program);
        Ok(ProgramId::from_raw(id))
    }

    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> DriverResult<()> {
        let opts = c_string(options)?;
        let t = self.lock();
        let d = t.device(device)?;
        let prog = t
            .programs
            .get(&program.raw())
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))?;
        debug!(program = program.raw(), options, "clBuildProgram");
        core::build_program(prog, Some(&[d]), &opts, None, None).map_err(status)
    }

    fn build_status(&self, program: ProgramId, device: DeviceId) -> DriverResult<BuildStatus> {
        let t = self.lock();
        let d = t.device(device)?;
        let prog = t
            .programs
            .get(&program.raw())
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))?;
        match core::get_program_build_info(prog, d, core::ProgramBuildInfo::BuildStatus)
            .map_err(status)?
        {
            ProgramBuildInfoResult::BuildStatus(s) => Ok(match s {
                core::BuildStatus::Success => BuildStatus::Success,
                core::BuildStatus::None => BuildStatus::None,
                core::BuildStatus::Error => BuildStatus::Error,
                core::BuildStatus::InProgress => BuildStatus::InProgress,
            }),
            other => Err(Status::with_detail(Status::INVALID_VALUE, other.to_string())),
        }
    }

    fn build_log(&self, program: ProgramId, device: DeviceId) -> DriverResult<String> {
        let t = self.lock();
        let d = t.device(device)?;
        let prog = t
            .programs
            .get(&program.raw())
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))?;
        match core::get_program_build_info(prog, d, core::ProgramBuildInfo::BuildLog)
            .map_err(status)?
        {
            ProgramBuildInfoResult::BuildLog(log) => Ok(log.trim_end_matches('\0').to_string()),
            other => Ok(other.to_string()),
        }
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> DriverResult<KernelId> {
        let mut t = self.lock();
        let prog = t
            .programs
            .get(&program.raw())
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))?;
        let kernel = core::create_kernel(prog, name).map_err(status)?;
        let id = t.alloc_id();
        t.kernels.insert(id, kernel);
        Ok(KernelId::from_raw(id))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg<'_>) -> DriverResult<()> {
        let t = self.lock();
        let k = t
            .kernels
            .get(&kernel.raw())
            .ok_or_else(|| Status::new(Status::INVALID_KERNEL))?;
        let value = match arg {
            KernelArg::Mem(mem) => ArgVal::mem(
                t.mems
                    .get(&mem.raw())
                    .ok_or_else(|| Status::new(Status::INVALID_MEM_OBJECT))?,
            ),
            // SAFETY: `bytes` outlives the call, which copies the value.
            KernelArg::Bytes(bytes) => unsafe {
                ArgVal::from_raw(bytes.len(), bytes.as_ptr() as *const c_void, false)
            },
        };
        core::set_kernel_arg(k, index, value).map_err(status)
    }

    fn create_image_2d(
        &self,
        context: ContextId,
        flags: MemFlags,
        format: ImageFormat,
        width: usize,
        height: usize,
        row_pitch: usize,
        host: Option<&[u8]>,
    ) -> DriverResult<MemId> {
        let mut t = self.lock();
        let ctx = t
            .contexts
            .get(&context.raw())
            .ok_or_else(|| Status::new(Status::INVALID_CONTEXT))?;
        let cl_format = core::ImageFormat::new(channel_order(format.order), channel_type(format.data_type));
        let desc = core::ImageDescriptor::new(
            core::MemObjectType::Image2d,
            width,
            height,
            0,
            0,
            row_pitch,
            0,
            None,
        );
        // SAFETY: `host`, when given, covers the image as checked by the caller
        // and is copied before returning unless USE_HOST_PTR is set. With
        // USE_HOST_PTR, KernelImage keeps the bytes alive until release_mem.
        let mem = unsafe {
            core::create_image(
                ctx,
                core::MemFlags::from_bits_truncate(flags.bits()),
                &cl_format,
                &desc,
                host,
                None,
            )
        }
        .map_err(status)?;
        trace!(width, height, ?format, "clCreateImage");
        let id = t.alloc_id();
        t.mems.insert(id, mem);
        Ok(MemId::from_raw(id))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        flags: MemFlags,
        len: usize,
        host: Option<&[u8]>,
    ) -> DriverResult<MemId> {
        let mut t = self.lock();
        let ctx = t
            .contexts
            .get(&context.raw())
            .ok_or_else(|| Status::new(Status::INVALID_CONTEXT))?;
        // SAFETY: `host`, when given, holds at least `len` bytes. With
        // USE_HOST_PTR, KernelBridge owns the bytes until release_mem.
        let mem = unsafe {
            core::create_buffer(ctx, core::MemFlags::from_bits_truncate(flags.bits()), len, host)
        }
        .map_err(status)?;
        let id = t.alloc_id();
        t.mems.insert(id, mem);
        Ok(MemId::from_raw(id))
    }

    fn enqueue_write_image(
        &self,
        queue: QueueId,
        image: MemId,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        data: &[u8],
    ) -> DriverResult<()> {
        let t = self.lock();
        let q = t
            .queues
            .get(&queue.raw())
            .ok_or_else(|| Status::new(Status::INVALID_COMMAND_QUEUE))?;
        let mem = t
            .mems
            .get(&image.raw())
            .ok_or_else(|| Status::new(Status::INVALID_MEM_OBJECT))?;
        // SAFETY: the transfer is blocking for every caller in this crate, so
        // `data` outlives it.
        unsafe {
            core::enqueue_write_image(
                q,
                mem,
                blocking,
                origin,
                region,
                0,
                0,
                data,
                None::<Event>,
                None::<&mut Event>,
            )
        }
        .map_err(status)
    }

    fn enqueue_read_image(
        &self,
        queue: QueueId,
        image: MemId,
        blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        data: &mut [u8],
    ) -> DriverResult<()> {
        let t = self.lock();
        let q = t
            .queues
            .get(&queue.raw())
            .ok_or_else(|| Status::new(Status::INVALID_COMMAND_QUEUE))?;
        let mem = t
            .mems
            .get(&image.raw())
            .ok_or_else(|| Status::new(Status::INVALID_MEM_OBJECT))?;
        // SAFETY: see `enqueue_write_image`.
        unsafe {
            core::enqueue_read_image(
                q,
                mem,
                blocking,
                origin,
                region,
                0,
                0,
                data,
                None::<Event>,
                None::<&mut Event>,
            )
        }
        .map_err(status)
    }

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        work_dim: u32,
        global: [usize; 3],
    ) -> DriverResult<()> {
        let t = self.lock();
        let q = t
            .queues
            .get(&queue.raw())
            .ok_or_else(|| Status::new(Status::INVALID_COMMAND_QUEUE))?;
        let k = t
            .kernels
            .get(&kernel.raw())
            .ok_or_else(|| Status::new(Status::INVALID_KERNEL))?;
        // SAFETY: every argument was bound through `set_kernel_arg`; memory
        // objects stay alive in the table while the queue runs.
        unsafe {
            core::enqueue_kernel(
                q,
                k,
                work_dim,
                None,
                &global,
                None,
                None::<Event>,
                None::<&mut Event>,
            )
        }
        .map_err(status)
    }

    fn finish(&self, queue: QueueId) -> DriverResult<()> {
        let t = self.lock();
        let q = t
            .queues
            .get(&queue.raw())
            .ok_or_else(|| Status::new(Status::INVALID_COMMAND_QUEUE))?;
        core::finish(q).map_err(status)
    }

    fn release_mem(&self, mem: MemId) -> DriverResult<()> {
        self.lock()
            .mems
            .remove(&mem.raw())
            .map(drop)
            .ok_or_else(|| Status::new(Status::INVALID_MEM_OBJECT))
    }

    fn release_kernel(&self, kernel: KernelId) -> DriverResult<()> {
        self.lock()
            .kernels
            .remove(&kernel.raw())
            .map(drop)
            .ok_or_else(|| Status::new(Status::INVALID_KERNEL))
    }

    fn release_program(&self, program: ProgramId) -> DriverResult<()> {
        self.lock()
            .programs
            .remove(&program.raw())
            .map(drop)
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))
    }

    fn release_queue(&self, queue: QueueId) -> DriverResult<()> {
        self.lock()
            .queues
            .remove(&queue.raw())
            .map(drop)
            .ok_or_else(|| Status::new(Status::INVALID_COMMAND_QUEUE))
    }

    fn release_context(&self, context: ContextId) -> DriverResult<()> {
        self.lock()
            .contexts
            .remove(&context.raw())
            .map(drop)
            .ok_or_else(|| Status::new(Status::INVALID_CONTEXT))
    }
}
