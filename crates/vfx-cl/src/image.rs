//! Image buffers bound to kernel parameters.
//!
//! A [`KernelImage`] pairs a tightly packed host byte buffer with the device
//! image allocated from it, for one kernel parameter slot. The pair is kept
//! behind one mutex and always replaced as a unit: a replacement allocates
//! the new device image first and only then swaps, so a failed replace leaves
//! the old pair in place.
//!
//! ```text
//! host bytes ──set_arg_image──▶ device image ──execute──▶ read_image ──▶ host bytes
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace, warn};

use crate::driver::{MemFlags, MemId};
use crate::format::{to_device_format, ImageFormat, PixelFormat};
use crate::pixels::{pack_rows, Bitmap, LockedPixels, PixelSource};
use crate::session::DeviceSession;
use crate::{ClError, ClResult, Stage};

struct Pair {
    host: Vec<u8>,
    mem: Option<MemId>,
}

/// Host pixels plus device image for one kernel parameter.
pub struct KernelImage {
    session: Arc<DeviceSession>,
    parameter_index: u32,
    width: usize,
    height: usize,
    format: ImageFormat,
    flags: MemFlags,
    pair: Mutex<Pair>,
}

impl KernelImage {
    /// Image from packed host bytes.
    ///
    /// `bytes` must hold exactly `format.image_size(width, height)` bytes.
    /// `parameter_index` is not checked against any kernel.
    pub fn new(
        session: &Arc<DeviceSession>,
        parameter_index: u32,
        flags: MemFlags,
        bytes: Vec<u8>,
        width: usize,
        height: usize,
        format: ImageFormat,
    ) -> ClResult<Self> {
        session.handles()?;
        let Some(expected) = format.checked_image_size(width, height) else {
            return Err(ClError::new(
                Stage::LengthMismatch,
                format!("{width}x{height} image does not fit in memory"),
            ));
        };
        if bytes.len() != expected {
            return Err(ClError::length_mismatch(expected, bytes.len()));
        }

        let mut image = Self {
            session: Arc::clone(session),
            parameter_index,
            width,
            height,
            format,
            flags,
            pair: Mutex::new(Pair {
                host: Vec::new(),
                mem: None,
            }),
        };
        let mem = image.allocate(&bytes)?;
        *image.pair.get_mut().unwrap_or_else(PoisonError::into_inner) = Pair {
            host: bytes,
            mem: Some(mem),
        };
        debug!(
            index = parameter_index,
            width,
            height,
            format = ?format,
            flags = ?flags,
            "kernel image created"
        );
        Ok(image)
    }

    /// Image whose layout comes from a host pixel format.
    pub fn with_pixel_format(
        session: &Arc<DeviceSession>,
        parameter_index: u32,
        flags: MemFlags,
        bytes: Vec<u8>,
        width: usize,
        height: usize,
        format: PixelFormat,
    ) -> ClResult<Self> {
        let format = to_device_format(format)?;
        Self::new(session, parameter_index, flags, bytes, width, height, format)
    }

    /// Image allocated with the session's default flags.
    pub fn with_default_flags(
        session: &Arc<DeviceSession>,
        parameter_index: u32,
        bytes: Vec<u8>,
        width: usize,
        height: usize,
        format: ImageFormat,
    ) -> ClResult<Self> {
        let flags = session.defaults().mem_flags;
        Self::new(session, parameter_index, flags, bytes, width, height, format)
    }

    /// Image copied out of a presentation image.
    ///
    /// The source is locked only while its rows are copied.
    pub fn from_source<S: PixelSource>(
        session: &Arc<DeviceSession>,
        parameter_index: u32,
        flags: MemFlags,
        source: &S,
    ) -> ClResult<Self> {
        let format = to_device_format(source.pixel_format())?;
        let bytes = pack_rows(source)?;
        Self::new(
            session,
            parameter_index,
            flags,
            bytes,
            source.width(),
            source.height(),
            format,
        )
    }

    pub fn parameter_index(&self) -> u32 {
        self.parameter_index
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }

    /// Transfer region, `[width, height, 1]`.
    pub fn region(&self) -> [usize; 3] {
        [self.width, self.height, 1]
    }

    /// Global work size covering every pixel; same as [`Self::region`].
    pub fn work_size(&self) -> [usize; 3] {
        self.region()
    }

    /// Length of the host buffer in bytes.
    pub fn byte_len(&self) -> usize {
        self.format.image_size(self.width, self.height)
    }

    /// Copy of the host bytes.
    pub fn host_bytes(&self) -> Vec<u8> {
        self.lock().host.clone()
    }

    /// Run `f` on the host bytes without copying them.
    pub fn with_host_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.lock().host)
    }

    /// Replace the host bytes and reallocate the device image.
    ///
    /// Fails with `LengthMismatch` if the length changes; nothing is modified
    /// on any failure.
    pub fn set_source(&self, bytes: Vec<u8>) -> ClResult<()> {
        self.session.handles()?;
        let mut pair = self.lock();
        if pair.mem.is_none() {
            return Err(self.disposed());
        }
        if bytes.len() != pair.host.len() {
            return Err(ClError::length_mismatch(pair.host.len(), bytes.len()));
        }

        let mem = self.allocate(&bytes)?;
        let old_mem = pair.mem.replace(mem);
        let old_host = std::mem::replace(&mut pair.host, bytes);
        drop(pair);

        // A USE_HOST_PTR image aliases its host bytes until released.
        if let Some(old) = old_mem {
            self.release(old);
        }
        drop(old_host);
        trace!(index = self.parameter_index, "kernel image source replaced");
        Ok(())
    }

    /// [`Self::set_source`] from a borrowed slice.
    pub fn copy_from_slice(&self, bytes: &[u8]) -> ClResult<()> {
        let expected = self.byte_len();
        if bytes.len() != expected {
            return Err(ClError::length_mismatch(expected, bytes.len()));
        }
        self.set_source(bytes.to_vec())
    }

    /// [`Self::set_source`] from a presentation image of the same size.
    pub fn set_source_from<S: PixelSource>(&self, source: &S) -> ClResult<()> {
        let format = to_device_format(source.pixel_format())?;
        if source.width() != self.width
            || source.height() != self.height
            || format.element_size() != self.format.element_size()
        {
            return Err(ClError::new(
                Stage::LengthMismatch,
                format!(
                    "{:?} source {}x{} at {} bytes/pixel, image {}x{} at {}",
                    source.pixel_format(),
                    source.width(),
                    source.height(),
                    format.element_size(),
                    self.width,
                    self.height,
                    self.format.element_size()
                ),
            ));
        }
        self.set_source(pack_rows(source)?)
    }

    /// Write the host bytes into `bitmap`, which must have the same size
    /// and pixel size.
    pub fn store_into(&self, bitmap: &Bitmap) -> ClResult<()> {
        let bpp = bitmap.pixel_format().bytes_per_pixel();
        if bitmap.width() != self.width
            || bitmap.height() != self.height
            || bpp != self.format.element_size()
        {
            return Err(ClError::new(
                Stage::LengthMismatch,
                format!(
                    "bitmap {}x{} at {bpp} bytes/pixel, image {}x{} at {}",
                    bitmap.width(),
                    bitmap.height(),
                    self.width,
                    self.height,
                    self.format.element_size()
                ),
            ));
        }

        let row = self.format.row_stride(self.width);
        let pair = self.lock();
        let mut lock = bitmap.lock_mut()?;
        let stride = lock.stride();
        for (y, src) in pair.host.chunks_exact(row).enumerate() {
            lock.bytes_mut()[y * stride..y * stride + row].copy_from_slice(src);
        }
        Ok(())
    }

    /// Release the device image. Safe to call more than once.
    pub fn dispose(&self) {
        let mem = self.lock().mem.take();
        if let Some(mem) = mem {
            self.release(mem);
            debug!(index = self.parameter_index, "kernel image disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().mem.is_none()
    }

    /// Run `f` with the device image and host bytes while holding the lock.
    pub(crate) fn with_device<R>(
        &self,
        f: impl FnOnce(MemId, &mut Vec<u8>) -> ClResult<R>,
    ) -> ClResult<R> {
        let mut pair = self.lock();
        let mem = pair.mem.ok_or_else(|| self.disposed())?;
        f(mem, &mut pair.host)
    }

    fn allocate(&self, bytes: &[u8]) -> ClResult<MemId> {
        let h = self.session.handles()?;
        let host = self.flags.takes_host_data().then_some(bytes);
        self.session
            .driver()
            .create_image_2d(
                h.context,
                self.flags,
                self.format,
                self.width,
                self.height,
                0,
                host,
            )
            .map_err(|s| ClError::new(Stage::SetImage2D, s.to_string()))
    }

    fn release(&self, mem: MemId) {
        if let Err(e) = self.session.driver().release_mem(mem) {
            warn!(index = self.parameter_index, %mem, error = %e, "release image");
        }
    }

    #[track_caller]
    fn disposed(&self) -> ClError {
        ClError::new(
            Stage::Disposed,
            format!("image for parameter {} was disposed", self.parameter_index),
        )
    }

    fn lock(&self) -> MutexGuard<'_, Pair> {
        self.pair.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for KernelImage {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for KernelImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelImage")
            .field("parameter_index", &self.parameter_index)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("flags", &self.flags)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{CpuDriver, DriverCall, Status};
    use crate::format::{ChannelOrder, ChannelType};

    const RGBA8: ImageFormat = ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnsignedInt8);

    fn setup() -> (Arc<CpuDriver>, Arc<DeviceSession>) {
        let driver = Arc::new(CpuDriver::new());
        let session = DeviceSession::open(driver.clone()).unwrap();
        (driver, session)
    }

    #[test]
    fn length_is_checked_at_construction() {
        let (_, s) = setup();
        let err = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![0; 15], 2, 2, RGBA8)
            .unwrap_err();
        assert_eq!(err.stage, Stage::LengthMismatch);
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![0; 16], 2, 2, RGBA8).unwrap();
        assert_eq!(img.byte_len(), 16);
        assert_eq!(img.region(), [2, 2, 1]);
        assert_eq!(img.work_size(), [2, 2, 1]);
    }

    #[test]
    fn dispose_is_idempotent() {
        let (driver, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![0; 4], 1, 1, RGBA8).unwrap();
        img.dispose();
        img.dispose();
        drop(img);
        assert_eq!(driver.call_count(DriverCall::ReleaseMem), 1);
        assert_eq!(driver.live_objects().mems, 0);
    }

    #[test]
    fn replace_swaps_allocation() {
        let (driver, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![1; 4], 1, 1, RGBA8).unwrap();
        img.set_source(vec![9; 4]).unwrap();
        assert_eq!(img.host_bytes(), vec![9; 4]);
        assert_eq!(driver.live_objects().mems, 1);
        assert_eq!(driver.call_count(DriverCall::CreateImage2d), 2);
    }

    #[test]
    fn copy_from_slice_replaces_bytes() {
        let (driver, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![1; 16], 2, 2, RGBA8).unwrap();
        let pixels: Vec<u8> = (0..16).collect();
        img.copy_from_slice(&pixels).unwrap();
        assert_eq!(img.host_bytes(), pixels);
        assert_eq!(driver.live_objects().mems, 1);
    }

    #[test]
    fn host_pointer_image_replace_releases_old() {
        let (driver, s) = setup();
        let flags = MemFlags::USE_HOST_PTR | MemFlags::READ_WRITE;
        let img = KernelImage::new(&s, 0, flags, vec![1; 4], 1, 1, RGBA8).unwrap();
        img.set_source(vec![2; 4]).unwrap();
        img.set_source(vec![3; 4]).unwrap();
        assert_eq!(img.host_bytes(), vec![3; 4]);
        assert_eq!(driver.live_objects().mems, 1);
        assert_eq!(driver.call_count(DriverCall::ReleaseMem), 2);
    }

    #[test]
    fn oversized_dimensions_are_rejected() {
        let (driver, s) = setup();
        let err = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![0; 4], usize::MAX / 2, 3, RGBA8)
            .unwrap_err();
        assert_eq!(err.stage, Stage::LengthMismatch);
        assert_eq!(driver.call_count(DriverCall::CreateImage2d), 0);
    }

    #[test]
    fn set_source_from_bitmap() {
        let (driver, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![0; 16], 2, 2, RGBA8).unwrap();
        let bmp = Bitmap::from_packed(2, 2, PixelFormat::Argb32, &[7; 16]).unwrap();
        img.set_source_from(&bmp).unwrap();
        assert_eq!(img.host_bytes(), vec![7; 16]);
        assert!(bmp.lock().is_ok());
        assert_eq!(driver.live_objects().mems, 1);
        assert_eq!(driver.call_count(DriverCall::ReleaseMem), 1);
    }

    #[test]
    fn set_source_from_unlocks_on_failed_allocation() {
        let (driver, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![0; 16], 2, 2, RGBA8).unwrap();
        let bmp = Bitmap::from_packed(2, 2, PixelFormat::Argb32, &[7; 16]).unwrap();
        driver.inject_fault(DriverCall::CreateImage2d, Status::new(Status::OUT_OF_RESOURCES));
        assert_eq!(img.set_source_from(&bmp).unwrap_err().stage, Stage::SetImage2D);
        assert!(bmp.lock().is_ok());
        assert_eq!(img.host_bytes(), vec![0; 16]);
        assert_eq!(driver.live_objects().mems, 1);
    }

    #[test]
    fn set_source_from_locked_bitmap() {
        let (_, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![0; 16], 2, 2, RGBA8).unwrap();
        let bmp = Bitmap::new(2, 2, PixelFormat::Argb32);
        let _held = bmp.lock().unwrap();
        assert_eq!(img.set_source_from(&bmp).unwrap_err().stage, Stage::ImageLocked);
        assert_eq!(img.host_bytes(), vec![0; 16]);
    }

    #[test]
    fn set_source_from_checks_dimensions() {
        let (driver, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![0; 16], 2, 2, RGBA8).unwrap();
        let wide = Bitmap::from_packed(4, 1, PixelFormat::Argb32, &[7; 16]).unwrap();
        assert_eq!(img.set_source_from(&wide).unwrap_err().stage, Stage::LengthMismatch);
        assert_eq!(img.host_bytes(), vec![0; 16]);
        assert_eq!(driver.call_count(DriverCall::CreateImage2d), 1);
    }

    #[test]
    fn mismatched_replace_changes_nothing() {
        let (driver, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![1; 4], 1, 1, RGBA8).unwrap();
        let err = img.copy_from_slice(&[0; 8]).unwrap_err();
        assert_eq!(err.stage, Stage::LengthMismatch);
        assert_eq!(img.host_bytes(), vec![1; 4]);
        assert_eq!(driver.call_count(DriverCall::CreateImage2d), 1);
    }

    #[test]
    fn failed_allocation_keeps_old_pair() {
        let (driver, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![1; 4], 1, 1, RGBA8).unwrap();
        driver.inject_fault(
            DriverCall::CreateImage2d,
            Status::new(Status::MEM_OBJECT_ALLOCATION_FAILURE),
        );
        let err = img.set_source(vec![2; 4]).unwrap_err();
        assert_eq!(err.stage, Stage::SetImage2D);
        assert_eq!(img.host_bytes(), vec![1; 4]);
        assert!(!img.is_disposed());
        assert_eq!(driver.call_count(DriverCall::ReleaseMem), 0);
    }

    #[test]
    fn replace_after_dispose_fails() {
        let (_, s) = setup();
        let img = KernelImage::new(&s, 0, MemFlags::COPY_HOST_PTR, vec![1; 4], 1, 1, RGBA8).unwrap();
        img.dispose();
        assert_eq!(img.set_source(vec![0; 4]).unwrap_err().stage, Stage::Disposed);
    }

    #[test]
    fn host_bytes_withheld_without_host_flags() {
        let (_, s) = setup();
        // CpuDriver rejects host data without COPY/USE_HOST_PTR, so success
        // means none was passed.
        assert!(KernelImage::new(&s, 0, MemFlags::READ_WRITE, vec![5; 4], 1, 1, RGBA8).is_ok());
    }

    #[test]
    fn unsupported_pixel_format() {
        let (driver, s) = setup();
        let err = KernelImage::with_pixel_format(
            &s,
            0,
            MemFlags::COPY_HOST_PTR,
            vec![0; 2],
            1,
            1,
            PixelFormat::Rgb565,
        )
        .unwrap_err();
        assert_eq!(err.stage, Stage::UnsupportedFormat);
        assert_eq!(driver.call_count(DriverCall::CreateImage2d), 0);
    }

    #[test]
    fn bitmap_round_trip_through_host_bytes() {
        let (_, s) = setup();
        let bmp = Bitmap::from_packed(1, 2, PixelFormat::Rgb24, &[1, 2, 3, 4, 5, 6]).unwrap();
        let img = KernelImage::from_source(&s, 0, MemFlags::COPY_HOST_PTR, &bmp).unwrap();
        assert_eq!(img.host_bytes(), vec![1, 2, 3, 4, 5, 6]);

        let out = Bitmap::new(1, 2, PixelFormat::Rgb24);
        img.store_into(&out).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn source_unlocked_after_failed_create() {
        let (driver, s) = setup();
        driver.inject_fault(DriverCall::CreateImage2d, Status::new(Status::OUT_OF_RESOURCES));
        let bmp = Bitmap::new(2, 2, PixelFormat::Argb32);
        assert!(KernelImage::from_source(&s, 0, MemFlags::COPY_HOST_PTR, &bmp).is_err());
        assert!(bmp.lock().is_ok());
    }

    #[test]
    fn locked_source_is_reported() {
        let (_, s) = setup();
        let bmp = Bitmap::new(2, 2, PixelFormat::Argb32);
        let _held = bmp.lock().unwrap();
        let err = KernelImage::from_source(&s, 0, MemFlags::COPY_HOST_PTR, &bmp).unwrap_err();
        assert_eq!(err.stage, Stage::ImageLocked);
    }
}
