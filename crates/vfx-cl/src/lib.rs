//! OpenCL device session and kernel execution bridge for VFX image kernels.
//!
//! Finds an image-capable compute device, compiles kernel source, binds
//! host scalars, arrays and 2D images as kernel arguments, runs the kernel
//! synchronously and reads the results back into host memory.
//!
//! # Architecture
//!
//! ```text
//! compile(session, source, entry) ──▶ KernelBridge
//!     │                                  ├── set_arg / set_arg_slice
//!     │                                  ├── set_arg_image(KernelImage)
//!     │                                  └── execute ──▶ read_image
//!     └── DeviceSession (platform, device, context, queue)
//!             └── ComputeDriver trait
//!                     ├── CpuDriver (host reference device, rayon)
//!                     └── OpenClDriver (ocl, `opencl` feature)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use vfx_cl::{compile, DeviceSession, KernelImage, PixelFormat, MemFlags};
//!
//! let session = DeviceSession::global()?;
//! let mut bridge = compile(&session, GRAYSCALE_CL, "run")?;
//!
//! let src = KernelImage::with_pixel_format(&session, 0, MemFlags::COPY_HOST_PTR,
//!     pixels, width, height, PixelFormat::Argb32)?;
//! let dst = KernelImage::with_pixel_format(&session, 1, MemFlags::COPY_HOST_PTR,
//!     vec![0; src.byte_len()], width, height, PixelFormat::Argb32)?;
//!
//! bridge.set_arg_image(&src)?;
//! bridge.set_arg_image(&dst)?;
//! bridge.execute(dst.work_size())?;
//! bridge.read_image(&dst)?;
//! let gray = dst.host_bytes();
//! ```
//!
//! # Environment Variables
//!
//! - `VFX_CL_DRIVER` - driver for the global session (`auto`, `opencl`, `cpu`)
//! - `VFX_CL_DEVICE_TYPE` - device class to search (`gpu`, `cpu`, `all`, ...)

pub mod bridge;
pub mod compiler;
pub mod config;
pub mod driver;
mod error;
pub mod format;
pub mod image;
pub mod pixels;
pub mod session;

pub use bridge::KernelBridge;
pub use compiler::{build_program, compile, compile_file, Kernel, Program};
pub use config::SessionConfig;
pub use driver::{create_driver, ComputeDriver, CpuDriver, DeviceKind, DriverKind, MemFlags};
pub use error::{ClError, ClResult, Stage};
pub use format::{to_device_format, ChannelOrder, ChannelType, ImageFormat, PixelFormat};
pub use image::KernelImage;
pub use pixels::{Bitmap, LockedPixels, PixelSource};
pub use session::{describe_devices, DeviceListing, DeviceSession, SessionDefaults, SessionHandles};
