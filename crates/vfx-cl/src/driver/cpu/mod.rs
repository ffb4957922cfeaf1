//! Host reference device.
//!
//! [`CpuDriver`] implements [`ComputeDriver`] entirely in host memory. It is
//! what the test-suite runs against and what `DriverKind::Auto` falls back to
//! when the crate is built without the `opencl` feature.
//!
//! Programs go through a small front-end that checks delimiter balance and
//! collects `__kernel` declarations; build errors produce a clang-style log.
//! Kernel bodies are not interpreted: each entry point must have a host
//! implementation registered under the same name (see [`kernels`] for the
//! stock set). Images are tightly packed host vectors.
//!
//! The driver also counts every call and can be told to fail a given call,
//! which is how error paths are exercised without hardware.
//!
//! # Example
//!
//! ```ignore
//! use vfx_cl::driver::{CpuDriver, DriverCall, Status};
//!
//! let driver = CpuDriver::builder()
//!     .gpu("test gpu", true)
//!     .kernel("noop", |_| Ok(()))
//!     .build();
//! driver.inject_fault(DriverCall::Finish, Status::new(Status::OUT_OF_RESOURCES));
//! ```

pub mod kernels;
mod dispatch;

pub use dispatch::{Dispatch, ImageView, ImageViewMut};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use self::dispatch::{ArgValue, MemLayout, MemObject};
use super::frontend::{self, KernelDecl};
use super::{
    BuildStatus, ComputeDriver, ContextId, DeviceId, DeviceInfo, DeviceKind, DriverResult,
    KernelArg, KernelId, MemFlags, MemId, PlatformId, ProgramId, QueueId, Status,
};
use crate::format::ImageFormat;

/// Host implementation of a kernel entry point.
pub type HostKernel = Arc<dyn Fn(&mut Dispatch<'_>) -> Result<(), String> + Send + Sync>;

/// Fallback memory size when the host cannot report one.
const FALLBACK_MEM_BYTES: u64 = 1 << 30;

/// Driver entry points, for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverCall {
    Platforms,
    Devices,
    DeviceInfo,
    CreateContext,
    CreateQueue,
    CreateProgram,
    BuildProgram,
    BuildStatus,
    BuildLog,
    CreateKernel,
    SetKernelArg,
    CreateImage2d,
    CreateBuffer,
    WriteImage,
    ReadImage,
    EnqueueKernel,
    Finish,
    ReleaseMem,
    ReleaseKernel,
    ReleaseProgram,
    ReleaseQueue,
    ReleaseContext,
}

/// Number of live objects per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub contexts: usize,
    pub queues: usize,
    pub programs: usize,
    pub kernels: usize,
    pub mems: usize,
}

impl LiveObjects {
    pub fn total(&self) -> usize {
        self.contexts + self.queues + self.programs + self.kernels + self.mems
    }
}

struct Device {
    platform: PlatformId,
    id: DeviceId,
    info: DeviceInfo,
}

struct Queue {
    context: u64,
    device: u64,
}

struct Program {
    context: u64,
    source: String,
    status: BuildStatus,
    log: String,
    decls: Vec<KernelDecl>,
}

struct Kernel {
    name: String,
    func: HostKernel,
    params: usize,
    args: BTreeMap<u32, ArgValue>,
}

#[derive(Default)]
struct Objects {
    next_id: u64,
    contexts: HashMap<u64, u64>,
    queues: HashMap<u64, Queue>,
    programs: HashMap<u64, Program>,
    kernels: HashMap<u64, Kernel>,
    mems: HashMap<u64, MemObject>,
}

impl Objects {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for a [`CpuDriver`] with a custom device topology and kernel set.
#[derive(Default)]
pub struct CpuDriverBuilder {
    platforms: Vec<Vec<DeviceInfo>>,
    kernels: HashMap<String, HostKernel>,
}

impl CpuDriverBuilder {
    /// Start a new platform. Devices added afterwards belong to it.
    pub fn platform(mut self) -> Self {
        self.platforms.push(Vec::new());
        self
    }

    /// Add a device to the current platform, opening one if needed.
    pub fn device(mut self, info: DeviceInfo) -> Self {
        match self.platforms.last_mut() {
            Some(devices) => devices.push(info),
            None => self.platforms.push(vec![info]),
        }
        self
    }

    /// Add a GPU device with the given image support.
    pub fn gpu(self, name: &str, image_support: bool) -> Self {
        self.device(DeviceInfo {
            name: name.to_string(),
            vendor: "vfx-rs".to_string(),
            kind: DeviceKind::GPU,
            global_mem_bytes: host_memory_bytes(),
            image_support,
        })
    }

    /// Register a host implementation for entry point `name`.
    pub fn kernel<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&mut Dispatch<'_>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.kernels.insert(name.to_string(), Arc::new(f));
        self
    }

    /// Register the kernels from [`kernels::stock_kernels`].
    pub fn stock_kernels(mut self) -> Self {
        for (name, f) in kernels::stock_kernels() {
            self.kernels.insert(name.to_string(), f);
        }
        self
    }

    pub fn build(self) -> CpuDriver {
        let platform_count = self.platforms.len() as u64;
        let mut devices = Vec::new();
        for (p, infos) in self.platforms.into_iter().enumerate() {
            for info in infos {
                devices.push(Device {
                    platform: PlatformId::from_raw(p as u64 + 1),
                    id: DeviceId::from_raw(devices.len() as u64 + 1),
                    info,
                });
            }
        }
        CpuDriver {
            platform_count,
            devices,
            kernels: self.kernels,
            objects: Mutex::new(Objects::default()),
            calls: Mutex::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
        }
    }
}

/// Host reference implementation of [`ComputeDriver`].
pub struct CpuDriver {
    platform_count: u64,
    devices: Vec<Device>,
    kernels: HashMap<String, HostKernel>,
    objects: Mutex<Objects>,
    calls: Mutex<HashMap<DriverCall, usize>>,
    faults: Mutex<HashMap<DriverCall, Status>>,
}

impl std::fmt::Debug for CpuDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CpuDriver")
            .field("platforms", &self.platform_count)
            .field("devices", &self.devices.len())
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

impl Default for CpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDriver {
    /// One platform with one image-capable GPU and no kernels.
    pub fn new() -> Self {
        Self::builder().gpu("vfx-cl reference device", true).build()
    }

    /// Like [`CpuDriver::new`] with the stock kernels registered.
    pub fn with_stock_kernels() -> Self {
        Self::builder()
            .gpu("vfx-cl reference device", true)
            .stock_kernels()
            .build()
    }

    pub fn builder() -> CpuDriverBuilder {
        CpuDriverBuilder::default()
    }

    /// Make every later `call` fail with `status` until cleared.
    pub fn inject_fault(&self, call: DriverCall, status: Status) {
        lock(&self.faults).insert(call, status);
    }

    pub fn clear_fault(&self, call: DriverCall) {
        lock(&self.faults).remove(&call);
    }

    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// How many times `call` was made, failed calls included.
    pub fn call_count(&self, call: DriverCall) -> usize {
        lock(&self.calls).get(&call).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    pub fn live_objects(&self) -> LiveObjects {
        let o = lock(&self.objects);
        LiveObjects {
            contexts: o.contexts.len(),
            queues: o.queues.len(),
            programs: o.programs.len(),
            kernels: o.kernels.len(),
            mems: o.mems.len(),
        }
    }

    /// Source text of a live program.
    pub fn program_source(&self, program: ProgramId) -> Option<String> {
        lock(&self.objects)
            .programs
            .get(&program.raw())
            .map(|p| p.source.clone())
    }

    fn enter(&self, call: DriverCall) -> DriverResult<()> {
        *lock(&self.calls).entry(call).or_insert(0) += 1;
        trace!(?call, "cpu driver call");
        match lock(&self.faults).get(&call) {
            Some(status) => Err(status.clone()),
            None => Ok(()),
        }
    }

    fn device(&self, device: DeviceId) -> DriverResult<&Device> {
        self.devices
            .iter()
            .find(|d| d.id == device)
            .ok_or_else(|| Status::new(Status::INVALID_DEVICE))
    }
}

fn host_memory_bytes() -> u64 {
    sys_info::mem_info()
        .map(|m| m.total * 1024)
        .unwrap_or(FALLBACK_MEM_BYTES)
}

/// Validate a transfer rectangle against an image and return its layout.
fn image_rect(
    obj: &MemObject,
    origin: [usize; 3],
    region: [usize; 3],
) -> DriverResult<(ImageFormat, usize)> {
    let MemLayout::Image2d { format, width, height } = obj.layout else {
        return Err(Status::with_detail(Status::INVALID_MEM_OBJECT, "not an image"));
    };
    if origin[2] != 0 || region[2] != 1 {
        return Err(Status::with_detail(
            Status::INVALID_VALUE,
            "2D image needs origin z = 0 and region depth = 1",
        ));
    }
    if region[0] == 0 || region[1] == 0 {
        return Err(Status::with_detail(Status::INVALID_VALUE, "empty region"));
    }
    if origin[0].saturating_add(region[0]) > width || origin[1].saturating_add(region[1]) > height {
        return Err(Status::with_detail(
            Status::INVALID_VALUE,
            format!(
                "region {}x{} at ({}, {}) exceeds image {width}x{height}",
                region[0], region[1], origin[0], origin[1]
            ),
        ));
    }
    Ok((format, format.row_stride(width)))
}

impl ComputeDriver for CpuDriver {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn platforms(&self) -> DriverResult<Vec<PlatformId>> {
        self.enter(DriverCall::Platforms)?;
        Ok((1..=self.platform_count).map(PlatformId::from_raw).collect())
    }

    fn devices(&self, platform: PlatformId, kind: DeviceKind) -> DriverResult<Vec<DeviceId>> {
        self.enter(DriverCall::Devices)?;
        if platform.raw() == 0 || platform.raw() > self.platform_count {
            return Err(Status::new(Status::INVALID_PLATFORM));
        }
        let found: Vec<DeviceId> = self
            .devices
            .iter()
            .filter(|d| d.platform == platform)
            .filter(|d| kind == DeviceKind::ALL || d.info.kind.intersects(kind))
            .map(|d| d.id)
            .collect();
        if found.is_empty() {
            return Err(Status::new(Status::DEVICE_NOT_FOUND));
        }
        Ok(found)
    }

    fn device_info(&self, device: DeviceId) -> DriverResult<DeviceInfo> {
        self.enter(DriverCall::DeviceInfo)?;
        Ok(self.device(device)?.info.clone())
    }

    fn create_context(&self, device: DeviceId) -> DriverResult<ContextId> {
        self.enter(DriverCall::CreateContext)?;
        self.device(device)?;
        let mut o = lock(&self.objects);
        let id = o.alloc_id();
        o.contexts.insert(id, device.raw());
        Ok(ContextId::from_raw(id))
    }

    fn create_queue(&self, context: ContextId, device: DeviceId) -> DriverResult<QueueId> {
        self.enter(DriverCall::CreateQueue)?;
        self.device(device)?;
        let mut o = lock(&self.objects);
        match o.contexts.get(&context.raw()) {
            Some(&d) if d == device.raw() => {}
            Some(_) => return Err(Status::new(Status::INVALID_DEVICE)),
            None => return Err(Status::new(Status::INVALID_CONTEXT)),
        }
        let id = o.alloc_id();
        o.queues.insert(
            id,
            Queue {
                context: context.raw(),
                device: device.raw(),
            },
        );
        Ok(QueueId::from_raw(id))
    }

    fn create_program(&self, context: ContextId, source: &str) -> DriverResult<ProgramId> {
        self.enter(DriverCall::CreateProgram)?;
        let mut o = lock(&self.objects);
        if !o.contexts.contains_key(&context.raw()) {
            return Err(Status::new(Status::INVALID_CONTEXT));
        }
        if source.is_empty() {
            return Err(Status::with_detail(Status::INVALID_VALUE, "empty program source"));
        }
        if source.contains('\0') {
            return Err(Status::with_detail(Status::INVALID_VALUE, "program source contains NUL"));
        }
        let id = o.alloc_id();
        o.programs.insert(
            id,
            Program {
                context: context.raw(),
                source: source.to_string(),
                status: BuildStatus::None,
                log: String::new(),
                decls: Vec::new(),
            },
        );
        Ok(ProgramId::from_raw(id))
    }

    fn build_program(&self, program: ProgramId, device: DeviceId, options: &str) -> DriverResult<()> {
        self.enter(DriverCall::BuildProgram)?;
        let mut o = lock(&self.objects);
        let context_device = {
            let prog = o
                .programs
                .get(&program.raw())
                .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))?;
            o.contexts.get(&prog.context).copied()
        };
        if context_device != Some(device.raw()) {
            return Err(Status::new(Status::INVALID_DEVICE));
        }
        let prog = o
            .programs
            .get_mut(&program.raw())
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))?;

        let scan = frontend::scan(&prog.source);
        prog.log = scan.log();
        debug!(
            program = program.raw(),
            kernels = scan.kernels.len(),
            errors = scan.diagnostics.len(),
            options,
            "cpu driver build"
        );
        if scan.is_ok() {
            prog.status = BuildStatus::Success;
            prog.decls = scan.kernels;
            Ok(())
        } else {
            prog.status = BuildStatus::Error;
            prog.decls.clear();
            Err(Status::new(Status::BUILD_PROGRAM_FAILURE))
        }
    }

    fn build_status(&self, program: ProgramId, _device: DeviceId) -> DriverResult<BuildStatus> {
        self.enter(DriverCall::BuildStatus)?;
        lock(&self.objects)
            .programs
            .get(&program.raw())
            .map(|p| p.status)
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))
    }

    fn build_log(&self, program: ProgramId, _device: DeviceId) -> DriverResult<String> {
        self.enter(DriverCall::BuildLog)?;
        lock(&self.objects)
            .programs
            .get(&program.raw())
            .map(|p| p.log.clone())
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))
    }

    fn create_kernel(&self, program: ProgramId, name: &str) -> DriverResult<KernelId> {
        self.enter(DriverCall::CreateKernel)?;
        let mut o = lock(&self.objects);
        let prog = o
            .programs
            .get(&program.raw())
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))?;
        if prog.status != BuildStatus::Success {
            return Err(Status::new(Status::INVALID_PROGRAM_EXECUTABLE));
        }
        let decl = prog
            .decls
            .iter()
            .find(|k| k.name == name)
            .ok_or_else(|| Status::with_detail(Status::INVALID_KERNEL_NAME, name))?;
        let func = self.kernels.get(name).cloned().ok_or_else(|| {
            Status::with_detail(
                Status::INVALID_KERNEL_NAME,
                format!("no host implementation for '{name}'"),
            )
        })?;
        let kernel = Kernel {
            name: name.to_string(),
            func,
            params: decl.params,
            args: BTreeMap::new(),
        };
        let id = o.alloc_id();
        o.kernels.insert(id, kernel);
        Ok(KernelId::from_raw(id))
    }

    fn set_kernel_arg(&self, kernel: KernelId, index: u32, arg: KernelArg<'_>) -> DriverResult<()> {
        self.enter(DriverCall::SetKernelArg)?;
        let mut guard = lock(&self.objects);
        let o = &mut *guard;
        let k = o
            .kernels
            .get_mut(&kernel.raw())
            .ok_or_else(|| Status::new(Status::INVALID_KERNEL))?;
        if index as usize >= k.params {
            return Err(Status::with_detail(
                Status::INVALID_ARG_INDEX,
                format!("'{}' takes {} argument(s), got index {index}", k.name, k.params),
            ));
        }
        let value = match arg {
            KernelArg::Mem(mem) => {
                if !o.mems.contains_key(&mem.raw()) {
                    return Err(Status::new(Status::INVALID_MEM_OBJECT));
                }
                ArgValue::Mem(mem)
            }
            KernelArg::Bytes([]) => return Err(Status::new(Status::INVALID_ARG_SIZE)),
            KernelArg::Bytes(bytes) => ArgValue::Bytes(bytes.to_vec()),
        };
        k.args.insert(index, value);
        Ok(())
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
        self.enter(DriverCall::CreateImage2d)?;
        let mut o = lock(&self.objects);
        if !o.contexts.contains_key(&context.raw()) {
            return Err(Status::new(Status::INVALID_CONTEXT));
        }
        if width == 0 || height == 0 || format.checked_image_size(width, height).is_none() {
            return Err(Status::new(Status::INVALID_IMAGE_SIZE));
        }
        let packed = format.row_stride(width);
        let data = match (flags.takes_host_data(), host) {
            (true, Some(host)) => {
                let pitch = if row_pitch == 0 { packed } else { row_pitch };
                if pitch < packed {
                    return Err(Status::with_detail(
                        Status::INVALID_IMAGE_SIZE,
                        format!("row pitch {pitch} below packed row size {packed}"),
                    ));
                }
                let needed = pitch
                    .checked_mul(height - 1)
                    .and_then(|n| n.checked_add(packed));
                if needed.is_none_or(|n| host.len() < n) {
                    return Err(Status::with_detail(
                        Status::INVALID_HOST_PTR,
                        format!("host data holds {} bytes", host.len()),
                    ));
                }
                let mut data = vec![0u8; packed * height];
                for (y, row) in data.chunks_exact_mut(packed).enumerate() {
                    row.copy_from_slice(&host[y * pitch..y * pitch + packed]);
                }
                data
            }
            (false, None) if row_pitch == 0 => vec![0u8; packed * height],
            (false, None) => {
                return Err(Status::with_detail(
                    Status::INVALID_IMAGE_SIZE,
                    "row pitch without host data",
                ));
            }
            (true, None) => {
                return Err(Status::with_detail(Status::INVALID_HOST_PTR, "flags require host data"));
            }
            (false, Some(_)) => {
                return Err(Status::with_detail(
                    Status::INVALID_HOST_PTR,
                    "host data without COPY_HOST_PTR or USE_HOST_PTR",
                ));
            }
        };

        let id = o.alloc_id();
        o.mems.insert(
            id,
            MemObject {
                context: context.raw(),
                flags,
                layout: MemLayout::Image2d { format, width, height },
                data,
            },
        );
        Ok(MemId::from_raw(id))
    }

    fn create_buffer(
        &self,
        context: ContextId,
        flags: MemFlags,
        len: usize,
        host: Option<&[u8]>,
    ) -> DriverResult<MemId> {
        self.enter(DriverCall::CreateBuffer)?;
        let mut o = lock(&self.objects);
        if !o.contexts.contains_key(&context.raw()) {
            return Err(Status::new(Status::INVALID_CONTEXT));
        }
        if len == 0 {
            return Err(Status::new(Status::INVALID_BUFFER_SIZE));
        }
        let data = match (flags.takes_host_data(), host) {
            (true, Some(host)) if host.len() >= len => host[..len].to_vec(),
            (false, None) => vec![0u8; len],
            _ => return Err(Status::new(Status::INVALID_HOST_PTR)),
        };
        let id = o.alloc_id();
        o.mems.insert(
            id,
            MemObject {
                context: context.raw(),
                flags,
                layout: MemLayout::Buffer,
                data,
            },
        );
        Ok(MemId::from_raw(id))
    }

    fn enqueue_write_image(
        &self,
        queue: QueueId,
        image: MemId,
        _blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        data: &[u8],
    ) -> DriverResult<()> {
        self.enter(DriverCall::WriteImage)?;
        let mut o = lock(&self.objects);
        let queue_context = o
            .queues
            .get(&queue.raw())
            .map(|q| q.context)
            .ok_or_else(|| Status::new(Status::INVALID_COMMAND_QUEUE))?;
        let obj = o
            .mems
            .get_mut(&image.raw())
            .ok_or_else(|| Status::new(Status::INVALID_MEM_OBJECT))?;
        if obj.context != queue_context {
            return Err(Status::new(Status::INVALID_CONTEXT));
        }
        let (format, stride) = image_rect(obj, origin, region)?;
        let size = format.element_size();
        let row = region[0] * size;
        if data.len() < row * region[1] {
            return Err(Status::with_detail(
                Status::INVALID_VALUE,
                format!("host data holds {} bytes, region needs {}", data.len(), row * region[1]),
            ));
        }
        for y in 0..region[1] {
            let dst = (origin[1] + y) * stride + origin[0] * size;
            obj.data[dst..dst + row].copy_from_slice(&data[y * row..(y + 1) * row]);
        }
        Ok(())
    }

    fn enqueue_read_image(
        &self,
        queue: QueueId,
        image: MemId,
        _blocking: bool,
        origin: [usize; 3],
        region: [usize; 3],
        data: &mut [u8],
    ) -> DriverResult<()> {
        self.enter(DriverCall::ReadImage)?;
        let o = lock(&self.objects);
        let queue_context = o
            .queues
            .get(&queue.raw())
            .map(|q| q.context)
            .ok_or_else(|| Status::new(Status::INVALID_COMMAND_QUEUE))?;
        let obj = o
            .mems
            .get(&image.raw())
            .ok_or_else(|| Status::new(Status::INVALID_MEM_OBJECT))?;
        if obj.context != queue_context {
            return Err(Status::new(Status::INVALID_CONTEXT));
        }
        let (format, stride) = image_rect(obj, origin, region)?;
        let size = format.element_size();
        let row = region[0] * size;
        if data.len() < row * region[1] {
            return Err(Status::with_detail(
                Status::INVALID_VALUE,
                format!("host buffer holds {} bytes, region needs {}", data.len(), row * region[1]),
            ));
        }
        for y in 0..region[1] {
            let src = (origin[1] + y) * stride + origin[0] * size;
            data[y * row..(y + 1) * row].copy_from_slice(&obj.data[src..src + row]);
        }
        Ok(())
    }

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: KernelId,
        work_dim: u32,
        global: [usize; 3],
    ) -> DriverResult<()> {
        self.enter(DriverCall::EnqueueKernel)?;
        let mut guard = lock(&self.objects);
        let o = &mut *guard;
        if !o.queues.contains_key(&queue.raw()) {
            return Err(Status::new(Status::INVALID_COMMAND_QUEUE));
        }
        let k = o
            .kernels
            .get(&kernel.raw())
            .ok_or_else(|| Status::new(Status::INVALID_KERNEL))?;
        if !(1..=3).contains(&work_dim) {
            return Err(Status::new(Status::INVALID_WORK_DIMENSION));
        }
        if global[..work_dim as usize].contains(&0) {
            return Err(Status::new(Status::INVALID_GLOBAL_WORK_SIZE));
        }
        if let Some(missing) = (0..k.params as u32).find(|i| !k.args.contains_key(i)) {
            return Err(Status::with_detail(
                Status::INVALID_KERNEL_ARGS,
                format!("argument {missing} of '{}' is not set", k.name),
            ));
        }

        debug!(kernel = %k.name, ?global, work_dim, "cpu driver dispatch");
        let func = Arc::clone(&k.func);
        let mut dispatch = Dispatch {
            work_dim,
            global,
            args: &k.args,
            mems: &mut o.mems,
        };
        func(&mut dispatch)
            .map_err(|msg| Status::with_detail(Status::INVALID_KERNEL_ARGS, format!("'{}': {msg}", k.name)))
    }

    fn finish(&self, queue: QueueId) -> DriverResult<()> {
        self.enter(DriverCall::Finish)?;
        // Commands run on enqueue, so there is nothing to wait for.
        if lock(&self.objects).queues.contains_key(&queue.raw()) {
            Ok(())
        } else {
            Err(Status::new(Status::INVALID_COMMAND_QUEUE))
        }
    }

    fn release_mem(&self, mem: MemId) -> DriverResult<()> {
        self.enter(DriverCall::ReleaseMem)?;
        lock(&self.objects)
            .mems
            .remove(&mem.raw())
            .map(drop)
            .ok_or_else(|| Status::new(Status::INVALID_MEM_OBJECT))
    }

    fn release_kernel(&self, kernel: KernelId) -> DriverResult<()> {
        self.enter(DriverCall::ReleaseKernel)?;
        lock(&self.objects)
            .kernels
            .remove(&kernel.raw())
            .map(drop)
            .ok_or_else(|| Status::new(Status::INVALID_KERNEL))
    }

    fn release_program(&self, program: ProgramId) -> DriverResult<()> {
        self.enter(DriverCall::ReleaseProgram)?;
        lock(&self.objects)
            .programs
            .remove(&program.raw())
            .map(drop)
            .ok_or_else(|| Status::new(Status::INVALID_PROGRAM))
    }

    fn release_queue(&self, queue: QueueId) -> DriverResult<()> {
        self.enter(DriverCall::ReleaseQueue)?;
        lock(&self.objects)
            .queues
            .remove(&queue.raw())
            .map(|q| trace!(device = q.device, "queue released"))
            .ok_or_else(|| Status::new(Status::INVALID_COMMAND_QUEUE))
    }

    fn release_context(&self, context: ContextId) -> DriverResult<()> {
        self.enter(DriverCall::ReleaseContext)?;
        lock(&self.objects)
            .contexts
            .remove(&context.raw())
            .map(drop)
            .ok_or_else(|| Status::new(Status::INVALID_CONTEXT))
    }
}
