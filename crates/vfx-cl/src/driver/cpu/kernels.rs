//! Stock host kernels for the reference device.
//!
//! Each kernel matches an OpenCL C entry point of the same name:
//!
//! ```text
//! __kernel void copy_image(read_only image2d_t src, write_only image2d_t dst)
//! __kernel void fill_image(write_only image2d_t dst, uchar4 color)
//! __kernel void grayscale(read_only image2d_t src, write_only image2d_t dst)
//! ```
//!
//! Work items outside the image are ignored, as with `write_imageui`.

use std::sync::Arc;

use rayon::prelude::*;

use super::{Dispatch, HostKernel};
use crate::format::{ChannelOrder, ChannelType};

/// Rec.709 luma weights, matching the color crates.
const REC709_LUMA: [f32; 3] = [0.2126, 0.7152, 0.0722];

/// All stock kernels with their entry point names.
pub fn stock_kernels() -> Vec<(&'static str, HostKernel)> {
    vec![
        ("copy_image", Arc::new(copy_image) as HostKernel),
        ("fill_image", Arc::new(fill_image) as HostKernel),
        ("grayscale", Arc::new(grayscale) as HostKernel),
    ]
}

/// Copy `src` (arg 0) to `dst` (arg 1) over the global range.
pub fn copy_image(d: &mut Dispatch<'_>) -> Result<(), String> {
    map_pixels(d, 0, 1, |src, dst| dst.copy_from_slice(src))
}

/// Fill `dst` (arg 0) with the `uchar4` color in arg 1.
pub fn fill_image(d: &mut Dispatch<'_>) -> Result<(), String> {
    let color: [u8; 4] = d.scalar(1)?;
    let (w, h) = {
        let view = d.image(0)?;
        d.extent_2d(view.width, view.height)
    };
    let dst = d.image_mut(0)?;
    let size = dst.format.element_size();
    let stride = dst.row_stride();

    dst.data
        .par_chunks_mut(stride)
        .take(h)
        .for_each(|row| {
            for px in row[..w * size].chunks_mut(size) {
                for (i, b) in px.iter_mut().enumerate() {
                    *b = color[i % 4];
                }
            }
        });
    Ok(())
}

/// Rec.709 luma of `src` (arg 0) into `dst` (arg 1), alpha kept.
pub fn grayscale(d: &mut Dispatch<'_>) -> Result<(), String> {
    require_rgba8(d, 0)?;
    map_pixels(d, 0, 1, |src, dst| {
        let luma = REC709_LUMA[0] * src[0] as f32
            + REC709_LUMA[1] * src[1] as f32
            + REC709_LUMA[2] * src[2] as f32;
        let v = luma.round().clamp(0.0, 255.0) as u8;
        dst[0] = v;
        dst[1] = v;
        dst[2] = v;
        dst[3] = src[3];
    })
}

fn require_rgba8(d: &Dispatch<'_>, index: u32) -> Result<(), String> {
    let img = d.image(index)?;
    let ok = matches!(img.format.order, ChannelOrder::Rgba | ChannelOrder::Bgra)
        && matches!(img.format.data_type, ChannelType::UnsignedInt8 | ChannelType::UnormInt8);
    if ok {
        Ok(())
    } else {
        Err(format!("argument {index} must be a 4-channel 8-bit image"))
    }
}

/// Apply `f` to every (src, dst) pixel pair inside the global range.
fn map_pixels<F>(d: &mut Dispatch<'_>, src: u32, dst: u32, f: F) -> Result<(), String>
where
    F: Fn(&[u8], &mut [u8]) + Sync,
{
    let (src_data, src_w, src_fmt) = {
        let view = d.image(src)?;
        (view.data.to_vec(), view.width, view.format)
    };
    let (w, h) = {
        let (src_view, dst_view) = (d.image(src)?, d.image(dst)?);
        d.extent_2d(src_view.width.min(dst_view.width), src_view.height.min(dst_view.height))
    };
    let out = d.image_mut(dst)?;
    if out.format.element_size() != src_fmt.element_size() {
        return Err(format!("arguments {src} and {dst} have different pixel sizes"));
    }

    let size = src_fmt.element_size();
    let src_stride = src_fmt.row_stride(src_w);
    let dst_stride = out.row_stride();

    out.data
        .par_chunks_mut(dst_stride)
        .take(h)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = &src_data[y * src_stride..y * src_stride + w * size];
            for (s, o) in src_row.chunks(size).zip(row[..w * size].chunks_mut(size)) {
                f(s, o);
            }
        });
    Ok(())
}
