//! Argument access for host kernels running on the reference device.

use std::collections::{BTreeMap, HashMap};

use bytemuck::Pod;

use crate::driver::{MemFlags, MemId};
use crate::format::ImageFormat;

/// Bound kernel argument value.
#[derive(Debug, Clone)]
pub(crate) enum ArgValue {
    Mem(MemId),
    Bytes(Vec<u8>),
}

/// Layout of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MemLayout {
    Buffer,
    Image2d {
        format: ImageFormat,
        width: usize,
        height: usize,
    },
}

/// Device memory object of the reference device.
#[derive(Debug)]
pub(crate) struct MemObject {
    pub context: u64,
    pub flags: MemFlags,
    pub layout: MemLayout,
    pub data: Vec<u8>,
}

/// Read-only view of an image argument.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub format: ImageFormat,
    pub data: &'a [u8],
}

impl<'a> ImageView<'a> {
    pub fn row_stride(&self) -> usize {
        self.format.row_stride(self.width)
    }

    /// Bytes of pixel (`x`, `y`).
    pub fn pixel(&self, x: usize, y: usize) -> &'a [u8] {
        let size = self.format.element_size();
        let start = y * self.row_stride() + x * size;
        &self.data[start..start + size]
    }
}

/// Writable view of an image argument.
#[derive(Debug)]
pub struct ImageViewMut<'a> {
    pub width: usize,
    pub height: usize,
    pub format: ImageFormat,
    pub data: &'a mut [u8],
}

impl ImageViewMut<'_> {
    pub fn row_stride(&self) -> usize {
        self.format.row_stride(self.width)
    }

    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [u8] {
        let size = self.format.element_size();
        let start = y * self.row_stride() + x * size;
        &mut self.data[start..start + size]
    }
}

/// One kernel launch: global size plus the bound arguments.
///
/// Accessors return `Err(message)` when the slot is unset or holds a
/// different kind of argument; the driver reports it as
/// `CL_INVALID_KERNEL_ARGS`.
pub struct Dispatch<'a> {
    pub(crate) work_dim: u32,
    pub(crate) global: [usize; 3],
    pub(crate) args: &'a BTreeMap<u32, ArgValue>,
    pub(crate) mems: &'a mut HashMap<u64, MemObject>,
}

impl Dispatch<'_> {
    pub fn work_dim(&self) -> u32 {
        self.work_dim
    }

    pub fn global_size(&self) -> [usize; 3] {
        self.global
    }

    /// Global 2D extent clamped to the image size.
    pub fn extent_2d(&self, width: usize, height: usize) -> (usize, usize) {
        let h = if self.work_dim >= 2 { self.global[1] } else { 1 };
        (self.global[0].min(width), h.min(height))
    }

    fn mem_id(&self, index: u32) -> Result<u64, String> {
        match self.args.get(&index) {
            Some(ArgValue::Mem(mem)) => Ok(mem.raw()),
            Some(ArgValue::Bytes(_)) => Err(format!("argument {index} is not a memory object")),
            None => Err(format!("argument {index} is not set")),
        }
    }

    /// Plain value bound at `index`.
    pub fn scalar<T: Pod>(&self, index: u32) -> Result<T, String> {
        match self.args.get(&index) {
            Some(ArgValue::Bytes(bytes)) if bytes.len() == std::mem::size_of::<T>() => {
                Ok(bytemuck::pod_read_unaligned(bytes))
            }
            Some(ArgValue::Bytes(bytes)) => Err(format!(
                "argument {index} holds {} bytes, expected {}",
                bytes.len(),
                std::mem::size_of::<T>()
            )),
            Some(ArgValue::Mem(_)) => Err(format!("argument {index} is a memory object")),
            None => Err(format!("argument {index} is not set")),
        }
    }

    pub fn image(&self, index: u32) -> Result<ImageView<'_>, String> {
        let id = self.mem_id(index)?;
        let obj = self.mems.get(&id).ok_or_else(|| format!("argument {index} was released"))?;
        match obj.layout {
            MemLayout::Image2d { format, width, height } => Ok(ImageView {
                width,
                height,
                format,
                data: &obj.data,
            }),
            MemLayout::Buffer => Err(format!("argument {index} is a buffer, not an image")),
        }
    }

    pub fn image_mut(&mut self, index: u32) -> Result<ImageViewMut<'_>, String> {
        let id = self.mem_id(index)?;
        let obj = self
            .mems
            .get_mut(&id)
            .ok_or_else(|| format!("argument {index} was released"))?;
        if obj.flags.contains(MemFlags::READ_ONLY) {
            return Err(format!("argument {index} is read-only"));
        }
        match obj.layout {
            MemLayout::Image2d { format, width, height } => Ok(ImageViewMut {
                width,
                height,
                format,
                data: &mut obj.data,
            }),
            MemLayout::Buffer => Err(format!("argument {index} is a buffer, not an image")),
        }
    }

    fn buffer_object(&self, index: u32) -> Result<&MemObject, String> {
        let id = self.mem_id(index)?;
        let obj = self.mems.get(&id).ok_or_else(|| format!("argument {index} was released"))?;
        match obj.layout {
            MemLayout::Buffer => Ok(obj),
            MemLayout::Image2d { .. } => Err(format!("argument {index} is an image, not a buffer")),
        }
    }

    pub fn buffer_bytes(&self, index: u32) -> Result<&[u8], String> {
        Ok(&self.buffer_object(index)?.data)
    }

    /// Buffer contents as `T` values.
    pub fn read_buffer<T: Pod>(&self, index: u32) -> Result<Vec<T>, String> {
        let bytes = self.buffer_bytes(index)?;
        let size = std::mem::size_of::<T>();
        if size == 0 || bytes.len() % size != 0 {
            return Err(format!("argument {index} is not a whole number of elements"));
        }
        Ok(bytes.chunks_exact(size).map(bytemuck::pod_read_unaligned).collect())
    }

    /// Overwrite the start of a buffer with `values`.
    pub fn write_buffer<T: Pod>(&mut self, index: u32, values: &[T]) -> Result<(), String> {
        self.buffer_object(index)?;
        let id = self.mem_id(index)?;
        let src: &[u8] = bytemuck::cast_slice(values);
        let obj = self
            .mems
            .get_mut(&id)
            .ok_or_else(|| format!("argument {index} was released"))?;
        if obj.flags.contains(MemFlags::READ_ONLY) {
            return Err(format!("argument {index} is read-only"));
        }
        if src.len() > obj.data.len() {
            return Err(format!(
                "argument {index} holds {} bytes, cannot write {}",
                obj.data.len(),
                src.len()
            ));
        }
        obj.data[..src.len()].copy_from_slice(src);
        Ok(())
    }
}
