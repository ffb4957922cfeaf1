//! Kernel argument binding and synchronous dispatch.
//!
//! A [`KernelBridge`] owns one kernel and the device buffers it created for
//! array arguments. Images stay owned by the caller: binding one uploads its
//! host bytes, [`KernelBridge::read_image`] pulls the device contents back.
//!
//! # Example
//!
//! ```ignore
//! use vfx_cl::{compile, DeviceSession, KernelImage, MemFlags};
//!
//! let session = DeviceSession::global()?;
//! let mut bridge = compile(&session, SOURCE, "run")?;
//! let src = KernelImage::with_default_flags(&session, 0, pixels, w, h, format)?;
//! let dst = KernelImage::new(&session, 1, MemFlags::COPY_HOST_PTR, vec![0; len], w, h, format)?;
//! bridge.set_arg_image(&src)?;
//! bridge.set_arg_image(&dst)?;
//! bridge.execute(dst.work_size())?;
//! bridge.read_image(&dst)?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use bytemuck::Pod;
use tracing::{debug, trace, warn};

use crate::compiler::{build_program, Kernel};
use crate::driver::{KernelArg, MemFlags, MemId};
use crate::image::KernelImage;
use crate::session::DeviceSession;
use crate::{ClError, ClResult, Stage};

/// Device buffer bound as an array argument.
///
/// A `USE_HOST_PTR` buffer may alias `backing` until it is released, so the
/// bytes live here and are dropped only after `release_mem`.
struct ArrayBuffer {
    mem: MemId,
    backing: Option<Vec<u8>>,
}

/// Compiled kernel with its argument state.
pub struct KernelBridge {
    kernel: Kernel,
    source: String,
    entry_point: String,
    buffers: BTreeMap<u32, ArrayBuffer>,
}

impl KernelBridge {
    pub(crate) fn new(kernel: Kernel, source: &str, entry_point: &str) -> Self {
        Self {
            kernel,
            source: source.to_string(),
            entry_point: entry_point.to_string(),
            buffers: BTreeMap::new(),
        }
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        self.kernel.session()
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Source the current kernel was built from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Bind a plain value at `index`.
    pub fn set_arg<T: Pod>(&mut self, index: u32, value: T) -> ClResult<()> {
        self.session().handles()?;
        self.bind(index, KernelArg::Bytes(bytemuck::bytes_of(&value)))
    }

    /// Bind an array at `index` through a new device buffer created with the
    /// session's default flags.
    pub fn set_arg_slice<T: Pod>(&mut self, index: u32, items: &[T]) -> ClResult<()> {
        let flags = self.session().defaults().mem_flags;
        self.set_arg_slice_with_flags(index, items, flags)
    }

    /// Bind an array at `index` through a new device buffer.
    ///
    /// A buffer previously bound at the same index is released. With
    /// `USE_HOST_PTR` the bridge keeps its own copy of `items` for the
    /// device to use, so the caller's slice may be dropped right away.
    pub fn set_arg_slice_with_flags<T: Pod>(
        &mut self,
        index: u32,
        items: &[T],
        flags: MemFlags,
    ) -> ClResult<()> {
        let h = self.session().handles()?;
        let bytes: &[u8] = bytemuck::cast_slice(items);
        let backing = flags.contains(MemFlags::USE_HOST_PTR).then(|| bytes.to_vec());
        let host = match &backing {
            Some(owned) => Some(owned.as_slice()),
            None => flags.takes_host_data().then_some(bytes),
        };
        let mem = self
            .session()
            .driver()
            .create_buffer(h.context, flags, bytes.len(), host)
            .map_err(|s| ClError::new(Stage::CreateBuffer, s.to_string()))?;

        let buffer = ArrayBuffer { mem, backing };
        if let Err(e) = self.bind(index, KernelArg::Mem(mem)) {
            self.release_buffer(index, buffer);
            return Err(e);
        }
        trace!(index, len = bytes.len(), "array argument bound");
        if let Some(old) = self.buffers.insert(index, buffer) {
            self.release_buffer(index, old);
        }
        Ok(())
    }

    /// Bind `image` at its parameter index and upload its host bytes.
    pub fn set_arg_image(&mut self, image: &KernelImage) -> ClResult<()> {
        let h = self.session().handles()?;
        let origin = self.session().defaults().origin;
        let index = image.parameter_index();
        image.with_device(|mem, host| {
            self.bind(index, KernelArg::Mem(mem))?;
            self.session()
                .driver()
                .enqueue_write_image(h.queue, mem, true, origin, image.region(), host)
                .map_err(|s| ClError::new(Stage::WriteImage, s.to_string()))
        })
    }

    /// Run the kernel over a 2D range and wait for it to finish.
    pub fn execute(&mut self, work_size: [usize; 3]) -> ClResult<()> {
        let h = self.session().handles()?;
        let driver = self.session().driver();
        debug!(kernel = %self.entry_point, ?work_size, "execute");
        driver
            .enqueue_kernel(h.queue, self.kernel.id(), 2, work_size)
            .map_err(|s| ClError::new(Stage::Execute, s.to_string()))?;
        driver
            .finish(h.queue)
            .map_err(|s| ClError::new(Stage::Finish, s.to_string()))
    }

    /// Copy the device contents of `image` into its host bytes.
    pub fn read_image(&mut self, image: &KernelImage) -> ClResult<()> {
        let h = self.session().handles()?;
        let origin = self.session().defaults().origin;
        image.with_device(|mem, host| {
            self.session()
                .driver()
                .enqueue_read_image(h.queue, mem, true, origin, image.region(), host)
                .map_err(|s| ClError::new(Stage::ReadImage, s.to_string()))
        })
    }

    /// Swap in another kernel. The old kernel and every array buffer are
    /// released; arguments have to be bound again.
    pub fn replace_kernel(&mut self, kernel: Kernel) {
        self.release_buffers();
        self.entry_point = kernel.name().to_string();
        self.kernel = kernel;
    }

    /// Build `source` and replace the kernel with the same entry point from it.
    ///
    /// On failure the current kernel stays in place.
    pub fn recompile(&mut self, source: &str) -> ClResult<()> {
        let program = build_program(self.session(), source)?;
        let kernel = program.create_kernel(&self.entry_point)?;
        self.replace_kernel(kernel);
        self.source = source.to_string();
        debug!(kernel = %self.entry_point, "recompiled");
        Ok(())
    }

    fn bind(&self, index: u32, arg: KernelArg<'_>) -> ClResult<()> {
        self.session()
            .driver()
            .set_kernel_arg(self.kernel.id(), index, arg)
            .map_err(|s| ClError::new(Stage::SetKernelArg, format!("{s}: argument {index}")))
    }

    fn release_buffer(&self, index: u32, buffer: ArrayBuffer) {
        let ArrayBuffer { mem, backing } = buffer;
        if let Err(e) = self.session().driver().release_mem(mem) {
            warn!(index, %mem, error = %e, "release array buffer");
        }
        drop(backing);
    }

    fn release_buffers(&mut self) {
        for (index, buffer) in std::mem::take(&mut self.buffers) {
            self.release_buffer(index, buffer);
        }
    }
}

impl Drop for KernelBridge {
    fn drop(&mut self) {
        self.release_buffers();
    }
}

impl std::fmt::Debug for KernelBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBridge")
            .field("entry_point", &self.entry_point)
            .field("kernel", &self.kernel.id())
            .field("buffers", &self.buffers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::compiler::compile;
    use crate::driver::{CpuDriver, DriverCall, Status};

    const SUM: &str = "__kernel void sum(__global const float* xs, __global float* out, int n) {}";

    fn driver() -> Arc<CpuDriver> {
        Arc::new(
            CpuDriver::builder()
                .gpu("test", true)
                .kernel("sum", |d| {
                    let n: i32 = d.scalar(2)?;
                    let xs: Vec<f32> = d.read_buffer(0)?;
                    let total: f32 = xs.iter().take(n as usize).sum();
                    d.write_buffer(1, &[total])
                })
                .build(),
        )
    }

    #[test]
    fn scalar_and_array_arguments() {
        let driver = driver();
        let session = DeviceSession::open(driver.clone()).unwrap();
        let mut bridge = compile(&session, SUM, "sum").unwrap();
        bridge.set_arg_slice(0, &[1.0f32, 2.0, 3.0]).unwrap();
        bridge
            .set_arg_slice_with_flags(1, &[0.0f32], MemFlags::COPY_HOST_PTR)
            .unwrap();
        bridge.set_arg(2, 3i32).unwrap();
        bridge.execute([1, 1, 1]).unwrap();
        assert_eq!(driver.call_count(DriverCall::Finish), 1);
    }

    #[test]
    fn host_pointer_array_outlives_caller_slice() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let driver = Arc::new(
            CpuDriver::builder()
                .gpu("test", true)
                .kernel("sum", move |d| {
                    let xs: Vec<f32> = d.read_buffer(0)?;
                    *sink.lock().unwrap() = xs;
                    Ok(())
                })
                .build(),
        );
        let session = DeviceSession::open(driver.clone()).unwrap();
        let mut bridge = compile(&session, SUM, "sum").unwrap();

        let xs = vec![1.5f32, 2.5];
        bridge
            .set_arg_slice_with_flags(0, &xs, MemFlags::USE_HOST_PTR | MemFlags::READ_ONLY)
            .unwrap();
        drop(xs);
        assert!(bridge.buffers[&0].backing.is_some());
        bridge.set_arg_slice(1, &[0.0f32]).unwrap();
        bridge.set_arg(2, 2i32).unwrap();
        bridge.execute([1, 1, 1]).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1.5, 2.5]);

        // Copied buffers need no backing.
        assert!(bridge.buffers[&1].backing.is_none());
        drop(bridge);
        assert_eq!(driver.live_objects().mems, 0);
    }

    #[test]
    fn rebinding_array_releases_previous_buffer() {
        let driver = driver();
        let session = DeviceSession::open(driver.clone()).unwrap();
        let mut bridge = compile(&session, SUM, "sum").unwrap();
        bridge.set_arg_slice(0, &[1.0f32]).unwrap();
        bridge.set_arg_slice(0, &[2.0f32]).unwrap();
        assert_eq!(driver.live_objects().mems, 1);
        assert_eq!(driver.call_count(DriverCall::ReleaseMem), 1);
    }

    #[test]
    fn failed_bind_releases_new_buffer() {
        let driver = driver();
        let session = DeviceSession::open(driver.clone()).unwrap();
        let mut bridge = compile(&session, SUM, "sum").unwrap();
        let err = bridge.set_arg_slice(7, &[1.0f32]).unwrap_err();
        assert_eq!(err.stage, Stage::SetKernelArg);
        assert!(err.detail.contains("CL_INVALID_ARG_INDEX"));
        assert_eq!(driver.live_objects().mems, 0);
    }

    #[test]
    fn drop_releases_kernel_and_buffers() {
        let driver = driver();
        let session = DeviceSession::open(driver.clone()).unwrap();
        let mut bridge = compile(&session, SUM, "sum").unwrap();
        bridge.set_arg_slice(0, &[1.0f32]).unwrap();
        bridge.set_arg_slice(1, &[0.0f32]).unwrap();
        drop(bridge);
        let live = driver.live_objects();
        assert_eq!((live.kernels, live.mems, live.programs), (0, 0, 0));
    }

    #[test]
    fn execute_and_finish_failures_are_tagged() {
        let driver = driver();
        let session = DeviceSession::open(driver.clone()).unwrap();
        let mut bridge = compile(&session, SUM, "sum").unwrap();
        let err = bridge.execute([1, 1, 1]).unwrap_err();
        assert_eq!(err.stage, Stage::Execute);
        assert!(err.detail.contains("CL_INVALID_KERNEL_ARGS"));

        bridge.set_arg_slice(0, &[1.0f32]).unwrap();
        bridge.set_arg_slice(1, &[0.0f32]).unwrap();
        bridge.set_arg(2, 1i32).unwrap();
        driver.inject_fault(DriverCall::Finish, Status::new(Status::OUT_OF_RESOURCES));
        assert_eq!(bridge.execute([1, 1, 1]).unwrap_err().stage, Stage::Finish);
    }

    #[test]
    fn recompile_failure_keeps_kernel() {
        let driver = driver();
        let session = DeviceSession::open(driver.clone()).unwrap();
        let mut bridge = compile(&session, SUM, "sum").unwrap();
        let before = bridge.kernel().id();
        let err = bridge.recompile("__kernel void sum(").unwrap_err();
        assert_eq!(err.stage, Stage::CompileBuild);
        assert_eq!(bridge.kernel().id(), before);
        assert_eq!(bridge.source(), SUM);

        let renamed = SUM.replace("int n", "int count");
        bridge.recompile(&renamed).unwrap();
        assert_ne!(bridge.kernel().id(), before);
        assert_eq!(bridge.source(), renamed);
        assert_eq!(driver.live_objects().kernels, 1);
    }
}
