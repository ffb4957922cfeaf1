//! Host pixel formats and device image formats.
//!
//! [`to_device_format`] maps the closed set of host pixel formats onto the
//! (channel order, channel type) pair used to allocate device images.

use crate::{ClError, ClResult, Stage};

/// Device image channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    R,
    A,
    Rg,
    Ra,
    Rgb,
    Rgba,
    Bgra,
    Argb,
    Intensity,
    Luminance,
}

impl ChannelOrder {
    /// Number of channels stored per pixel.
    pub fn channel_count(&self) -> usize {
        match self {
            Self::R | Self::A | Self::Intensity | Self::Luminance => 1,
            Self::Rg | Self::Ra => 2,
            Self::Rgb => 3,
            Self::Rgba | Self::Bgra | Self::Argb => 4,
        }
    }
}

/// Device image channel data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    SnormInt8,
    SnormInt16,
    UnormInt8,
    UnormInt16,
    UnormShort565,
    UnormShort555,
    UnormInt101010,
    SignedInt8,
    SignedInt16,
    SignedInt32,
    UnsignedInt8,
    UnsignedInt16,
    UnsignedInt32,
    HalfFloat,
    Float,
}

impl ChannelType {
    /// Packed types store a whole pixel in one value regardless of order.
    pub fn packed_size(&self) -> Option<usize> {
        match self {
            Self::UnormShort565 | Self::UnormShort555 => Some(2),
            Self::UnormInt101010 => Some(4),
            _ => None,
        }
    }

    /// Bytes per channel for non-packed types.
    pub fn channel_size(&self) -> usize {
        match self {
            Self::SnormInt8 | Self::UnormInt8 | Self::SignedInt8 | Self::UnsignedInt8 => 1,
            Self::SnormInt16
            | Self::UnormInt16
            | Self::SignedInt16
            | Self::UnsignedInt16
            | Self::HalfFloat
            | Self::UnormShort565
            | Self::UnormShort555 => 2,
            Self::SignedInt32 | Self::UnsignedInt32 | Self::Float | Self::UnormInt101010 => 4,
        }
    }
}

/// Device image format: channel order plus channel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub data_type: ChannelType,
}

impl ImageFormat {
    pub const fn new(order: ChannelOrder, data_type: ChannelType) -> Self {
        Self { order, data_type }
    }

    /// Bytes per pixel.
    pub fn element_size(&self) -> usize {
        self.data_type
            .packed_size()
            .unwrap_or_else(|| self.order.channel_count() * self.data_type.channel_size())
    }

    /// Bytes per tightly packed row.
    pub fn row_stride(&self, width: usize) -> usize {
        width * self.element_size()
    }

    /// Bytes for a tightly packed `width` x `height` image.
    ///
    /// Dimensions must already be known to fit; see [`Self::checked_image_size`].
    pub fn image_size(&self, width: usize, height: usize) -> usize {
        self.row_stride(width) * height
    }

    /// [`Self::image_size`], or `None` when the size overflows `usize`.
    pub fn checked_image_size(&self, width: usize, height: usize) -> Option<usize> {
        width.checked_mul(self.element_size())?.checked_mul(height)
    }
}

impl Default for ImageFormat {
    fn default() -> Self {
        Self::new(ChannelOrder::Bgra, ChannelType::UnsignedInt8)
    }
}

/// Host-side pixel format of a presentation image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32 bpp, 8 bits per channel with alpha.
    Argb32,
    /// 32 bpp, premultiplied alpha.
    PArgb32,
    /// 32 bpp, unused alpha byte.
    Rgb32,
    /// 24 bpp, 8 bits per channel.
    Rgb24,
    /// 16 bpp, 5 bits per color channel and 1 alpha bit.
    Argb1555,
    /// 16 bpp, 5-6-5.
    Rgb565,
    /// 16 bpp, 5-5-5 without alpha.
    Rgb555,
    /// 16 bpp grayscale.
    Gray16,
    /// 8 bpp palette indices.
    Indexed8,
    /// 48 bpp, 16 bits per channel.
    Rgb48,
    /// 64 bpp, 16 bits per channel with alpha.
    Argb64,
}

impl PixelFormat {
    pub fn bits_per_pixel(&self) -> usize {
        match self {
            Self::Argb32 | Self::PArgb32 | Self::Rgb32 => 32,
            Self::Rgb24 => 24,
            Self::Argb1555 | Self::Rgb565 | Self::Rgb555 | Self::Gray16 => 16,
            Self::Indexed8 => 8,
            Self::Rgb48 => 48,
            Self::Argb64 => 64,
        }
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bits_per_pixel() / 8
    }

    /// Device format for this host format.
    pub fn to_device(self) -> ClResult<ImageFormat> {
        to_device_format(self)
    }
}

/// Map a host pixel format to its device image format.
///
/// Only 32-bit ARGB variants, 24-bit RGB and 16-bit ARGB-1555 are supported;
/// anything else fails with [`Stage::UnsupportedFormat`].
pub fn to_device_format(format: PixelFormat) -> ClResult<ImageFormat> {
    use ChannelOrder::*;
    use ChannelType::*;

    match format {
        PixelFormat::Argb32 | PixelFormat::PArgb32 | PixelFormat::Rgb32 => {
            Ok(ImageFormat::new(Rgba, UnsignedInt8))
        }
        PixelFormat::Rgb24 => Ok(ImageFormat::new(Rgb, UnsignedInt8)),
        PixelFormat::Argb1555 => Ok(ImageFormat::new(Argb, UnormShort555)),
        other => Err(ClError::new(
            Stage::UnsupportedFormat,
            format!("{other:?} has no device image format"),
        )),
    }
}

impl TryFrom<PixelFormat> for ImageFormat {
    type Error = ClError;

    fn try_from(format: PixelFormat) -> ClResult<Self> {
        to_device_format(format)
    }
}
