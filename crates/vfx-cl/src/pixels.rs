//! Host-side presentation images.
//!
//! A [`PixelSource`] is anything whose pixels can be locked for reading:
//! the lock is a guard, so the image is unlocked on every exit path,
//! including early returns on error. [`Bitmap`] is the in-memory
//! implementation used by the crate and its tests; rows are padded to a
//! 4-byte boundary like GDI bitmaps.

use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::format::PixelFormat;
use crate::{ClError, ClResult, Stage};

/// Locked pixel memory of a [`PixelSource`].
pub trait LockedPixels {
    /// Bytes from one row start to the next.
    fn stride(&self) -> usize;

    /// Whole pixel memory, `stride * height` bytes.
    fn bytes(&self) -> &[u8];

    /// Row `y`, including any padding.
    fn row(&self, y: usize) -> &[u8] {
        let stride = self.stride();
        &self.bytes()[y * stride..(y + 1) * stride]
    }
}

/// Host image that can be locked for reading.
pub trait PixelSource {
    type Lock<'a>: LockedPixels
    where
        Self: 'a;

    fn width(&self) -> usize;

    fn height(&self) -> usize;

    fn pixel_format(&self) -> PixelFormat;

    /// Lock the pixels; they stay locked until the guard is dropped.
    fn lock_pixels(&self) -> ClResult<Self::Lock<'_>>;
}

/// Row stride of a GDI-style bitmap: rows padded to 4 bytes.
pub fn padded_stride(width: usize, format: PixelFormat) -> usize {
    (width * format.bits_per_pixel()).div_ceil(32) * 4
}

/// In-memory bitmap with 4-byte aligned rows.
#[derive(Debug)]
pub struct Bitmap {
    width: usize,
    height: usize,
    format: PixelFormat,
    stride: usize,
    pixels: Mutex<Vec<u8>>,
}

impl Bitmap {
    /// Zero-filled bitmap.
    pub fn new(width: usize, height: usize, format: PixelFormat) -> Self {
        let stride = padded_stride(width, format);
        Self {
            width,
            height,
            format,
            stride,
            pixels: Mutex::new(vec![0; stride * height]),
        }
    }

    /// Bitmap over existing bytes laid out with `stride`.
    pub fn from_bytes(
        width: usize,
        height: usize,
        format: PixelFormat,
        stride: usize,
        bytes: Vec<u8>,
    ) -> ClResult<Self> {
        if stride < width * format.bytes_per_pixel() {
            return Err(ClError::new(
                Stage::LengthMismatch,
                format!("stride {stride} too small for {width} pixels of {format:?}"),
            ));
        }
        if bytes.len() != stride * height {
            return Err(ClError::length_mismatch(stride * height, bytes.len()));
        }
        Ok(Self {
            width,
            height,
            format,
            stride,
            pixels: Mutex::new(bytes),
        })
    }

    /// Bitmap from tightly packed rows, padded to the bitmap stride.
    pub fn from_packed(
        width: usize,
        height: usize,
        format: PixelFormat,
        packed: &[u8],
    ) -> ClResult<Self> {
        let row = width * format.bytes_per_pixel();
        if packed.len() != row * height {
            return Err(ClError::length_mismatch(row * height, packed.len()));
        }
        let bitmap = Self::new(width, height, format);
        {
            let mut lock = bitmap.lock_mut()?;
            let stride = lock.stride;
            for (y, src) in packed.chunks_exact(row).enumerate() {
                lock.bytes_mut()[y * stride..y * stride + row].copy_from_slice(src);
            }
        }
        Ok(bitmap)
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Lock for reading. Fails with `ImageLocked` while another lock is held.
    pub fn lock(&self) -> ClResult<BitmapLock<'_>> {
        Ok(BitmapLock {
            guard: self.try_lock()?,
            stride: self.stride,
        })
    }

    /// Lock for writing. Fails with `ImageLocked` while another lock is held.
    pub fn lock_mut(&self) -> ClResult<BitmapLockMut<'_>> {
        Ok(BitmapLockMut {
            guard: self.try_lock()?,
            stride: self.stride,
        })
    }

    /// Copy of the pixel memory, padding included.
    pub fn to_vec(&self) -> ClResult<Vec<u8>> {
        Ok(self.lock()?.bytes().to_vec())
    }

    fn try_lock(&self) -> ClResult<MutexGuard<'_, Vec<u8>>> {
        match self.pixels.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(p)) => Ok(p.into_inner()),
            Err(TryLockError::WouldBlock) => Err(ClError::new(
                Stage::ImageLocked,
                format!("{}x{} bitmap is already locked", self.width, self.height),
            )),
        }
    }
}

impl PixelSource for Bitmap {
    type Lock<'a> = BitmapLock<'a>;

    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    fn lock_pixels(&self) -> ClResult<BitmapLock<'_>> {
        self.lock()
    }
}

/// Read lock on a [`Bitmap`].
#[derive(Debug)]
pub struct BitmapLock<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
    stride: usize,
}

impl LockedPixels for BitmapLock<'_> {
    fn stride(&self) -> usize {
        self.stride
    }

    fn bytes(&self) -> &[u8] {
        &self.guard
    }
}

/// Write lock on a [`Bitmap`].
pub struct BitmapLockMut<'a> {
    guard: MutexGuard<'a, Vec<u8>>,
    stride: usize,
}

impl BitmapLockMut<'_> {
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

impl LockedPixels for BitmapLockMut<'_> {
    fn stride(&self) -> usize {
        self.stride
    }

    fn bytes(&self) -> &[u8] {
        &self.guard
    }
}

/// Copy the visible part of every row into a tightly packed buffer.
pub(crate) fn pack_rows<S: PixelSource>(source: &S) -> ClResult<Vec<u8>> {
    let row = source.width() * source.pixel_format().bytes_per_pixel();
    let lock = source.lock_pixels()?;
    let mut packed = Vec::with_capacity(row * source.height());
    for y in 0..source.height() {
        packed.extend_from_slice(&lock.row(y)[..row]);
    }
    Ok(packed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_is_padded_to_four_bytes() {
        assert_eq!(padded_stride(3, PixelFormat::Rgb24), 12);
        assert_eq!(padded_stride(5, PixelFormat::Rgb24), 16);
        assert_eq!(padded_stride(3, PixelFormat::Argb32), 12);
        assert_eq!(padded_stride(3, PixelFormat::Argb1555), 8);
    }

    #[test]
    fn second_lock_fails_until_first_is_dropped() {
        let bmp = Bitmap::new(2, 2, PixelFormat::Argb32);
        let lock = bmp.lock().unwrap();
        let err = bmp.lock().unwrap_err();
        assert_eq!(err.stage, Stage::ImageLocked);
        drop(lock);
        assert!(bmp.lock().is_ok());
    }

    #[test]
    fn pack_rows_drops_padding() {
        // 1 pixel of RGB24 per row: 3 bytes + 1 byte padding.
        let bmp = Bitmap::from_bytes(1, 2, PixelFormat::Rgb24, 4, vec![1, 2, 3, 0, 4, 5, 6, 0]).unwrap();
        assert_eq!(pack_rows(&bmp).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn from_packed_pads_rows() {
        let bmp = Bitmap::from_packed(1, 2, PixelFormat::Rgb24, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(bmp.to_vec().unwrap(), vec![1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn from_bytes_checks_length() {
        let err = Bitmap::from_bytes(2, 2, PixelFormat::Argb32, 8, vec![0; 15]).unwrap_err();
        assert_eq!(err.stage, Stage::LengthMismatch);
    }
}
