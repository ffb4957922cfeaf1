//! End-to-end tests for vfx-cl on the host reference device.

use std::io::Write;
use std::sync::Arc;

use vfx_cl::driver::{CpuDriver, DriverCall, Status};
use vfx_cl::{
    compile, compile_file, to_device_format, Bitmap, ChannelOrder, ChannelType, DeviceSession,
    ImageFormat, KernelImage, MemFlags, PixelFormat, Stage,
};

const RGBA8: ImageFormat = ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnsignedInt8);

const FILL_RED: &str = r#"
__kernel void fill_red(int pass, write_only image2d_t out) {
    int2 pos = (int2)(get_global_id(0), get_global_id(1));
    write_imageui(out, pos, (uint4)(255, 0, 0, 255));
}
"#;

const COPY: &str = r#"
__kernel void copy_image(read_only image2d_t src, write_only image2d_t dst) {
    int2 pos = (int2)(get_global_id(0), get_global_id(1));
    write_imageui(dst, pos, read_imageui(src, pos));
}
"#;

fn fill_red_driver() -> Arc<CpuDriver> {
    Arc::new(
        CpuDriver::builder()
            .gpu("test gpu", true)
            .stock_kernels()
            .kernel("fill_red", |d| {
                let _pass: i32 = d.scalar(0)?;
                let view = d.image(1)?;
                let (w, h) = d.extent_2d(view.width, view.height);
                let mut out = d.image_mut(1)?;
                for y in 0..h {
                    for x in 0..w {
                        out.pixel_mut(x, y).copy_from_slice(&[255, 0, 0, 255]);
                    }
                }
                Ok(())
            })
            .build(),
    )
}

#[test]
fn test_fill_red_scenario() {
    let driver = fill_red_driver();
    let session = DeviceSession::open(driver.clone()).unwrap();

    let image = KernelImage::new(&session, 1, MemFlags::COPY_HOST_PTR, vec![0; 64], 4, 4, RGBA8)
        .unwrap();
    let mut bridge = compile(&session, FILL_RED, "fill_red").unwrap();
    bridge.set_arg(0, 0i32).unwrap();
    bridge.set_arg_image(&image).unwrap();
    bridge.execute([4, 4, 1]).unwrap();
    bridge.read_image(&image).unwrap();

    let expected: Vec<u8> = [255u8, 0, 0, 255].repeat(16);
    assert_eq!(image.host_bytes(), expected);
}

#[test]
fn test_identity_round_trip() {
    let driver = Arc::new(CpuDriver::with_stock_kernels());
    let session = DeviceSession::open(driver).unwrap();

    let pixels: Vec<u8> = (0..3 * 2 * 4).map(|i| (i * 7) as u8).collect();
    let src = KernelImage::new(&session, 0, MemFlags::COPY_HOST_PTR, pixels.clone(), 3, 2, RGBA8)
        .unwrap();
    let dst = KernelImage::new(&session, 1, MemFlags::COPY_HOST_PTR, vec![0; 24], 3, 2, RGBA8)
        .unwrap();

    let mut bridge = compile(&session, COPY, "copy_image").unwrap();
    bridge.set_arg_image(&src).unwrap();
    bridge.set_arg_image(&dst).unwrap();
    bridge.execute(dst.work_size()).unwrap();
    bridge.read_image(&dst).unwrap();

    assert_eq!(dst.host_bytes(), pixels);
}

#[test]
fn test_grayscale_from_bitmap() {
    let driver = Arc::new(CpuDriver::with_stock_kernels());
    let session = DeviceSession::open(driver).unwrap();
    let source = r#"
        __kernel void grayscale(read_only image2d_t src, write_only image2d_t dst) {}
    "#;

    let bmp = Bitmap::from_packed(2, 1, PixelFormat::Argb32, &[255, 0, 0, 255, 0, 0, 255, 128])
        .unwrap();
    let src = KernelImage::from_source(&session, 0, MemFlags::COPY_HOST_PTR, &bmp).unwrap();
    let dst = KernelImage::with_default_flags(
        &session,
        1,
        vec![0; 8],
        2,
        1,
        to_device_format(PixelFormat::Argb32).unwrap(),
    )
    .unwrap();

    let mut bridge = compile(&session, source, "grayscale").unwrap();
    bridge.set_arg_image(&src).unwrap();
    bridge.set_arg_image(&dst).unwrap();
    bridge.execute(dst.work_size()).unwrap();
    bridge.read_image(&dst).unwrap();

    let out = Bitmap::new(2, 1, PixelFormat::Argb32);
    dst.store_into(&out).unwrap();
    // Rec.709: 0.2126 * 255 = 54.2, 0.0722 * 255 = 18.4
    assert_eq!(out.to_vec().unwrap(), vec![54, 54, 54, 255, 18, 18, 18, 128]);
}

#[test]
fn test_syntax_error_surfaces_build_log() {
    let driver = Arc::new(CpuDriver::with_stock_kernels());
    let session = DeviceSession::open(driver).unwrap();
    let broken = "__kernel void copy_image(read_only image2d_t src, write_only image2d_t dst) {\n";

    let err = compile(&session, broken, "copy_image").unwrap_err();
    assert_eq!(err.stage, Stage::CompileBuild);
    assert!(!err.detail.is_empty());
    assert!(err.detail.contains("<source>:"), "{}", err.detail);
    assert!(err.detail.contains("expected '}'"), "{}", err.detail);
}

#[test]
fn test_no_device_makes_no_device_calls() {
    let driver = Arc::new(CpuDriver::builder().platform().stock_kernels().build());
    let session = DeviceSession::open(driver.clone()).unwrap();
    assert!(!session.is_available());
    let calls = driver.total_calls();

    let err = compile(&session, COPY, "copy_image").unwrap_err();
    assert!(err.is_no_device());
    let err = KernelImage::new(&session, 0, MemFlags::COPY_HOST_PTR, vec![0; 4], 1, 1, RGBA8)
        .unwrap_err();
    assert!(err.is_no_device());
    let bmp = Bitmap::new(1, 1, PixelFormat::Argb32);
    let err = KernelImage::from_source(&session, 0, MemFlags::COPY_HOST_PTR, &bmp).unwrap_err();
    assert!(err.is_no_device());

    assert_eq!(driver.total_calls(), calls);
}

#[test]
fn test_replace_keeps_length_invariant() {
    let driver = Arc::new(CpuDriver::with_stock_kernels());
    let session = DeviceSession::open(driver.clone()).unwrap();
    let image = KernelImage::new(&session, 0, MemFlags::COPY_HOST_PTR, vec![1; 16], 2, 2, RGBA8)
        .unwrap();

    for len in [0, 15, 17, 32] {
        let err = image.set_source(vec![0; len]).unwrap_err();
        assert_eq!(err.stage, Stage::LengthMismatch);
        assert_eq!(image.host_bytes(), vec![1; 16]);
    }
    image.set_source(vec![2; 16]).unwrap();
    assert_eq!(image.host_bytes().len(), RGBA8.image_size(2, 2));
    assert_eq!(driver.live_objects().mems, 1);
}

#[test]
fn test_write_failure_is_tagged() {
    let driver = fill_red_driver();
    let session = DeviceSession::open(driver.clone()).unwrap();
    let image = KernelImage::new(&session, 1, MemFlags::COPY_HOST_PTR, vec![0; 4], 1, 1, RGBA8)
        .unwrap();
    let mut bridge = compile(&session, FILL_RED, "fill_red").unwrap();

    driver.inject_fault(DriverCall::WriteImage, Status::new(Status::OUT_OF_RESOURCES));
    let err = bridge.set_arg_image(&image).unwrap_err();
    assert_eq!(err.stage, Stage::WriteImage);
    driver.clear_faults();

    driver.inject_fault(DriverCall::ReadImage, Status::new(Status::OUT_OF_RESOURCES));
    let err = bridge.read_image(&image).unwrap_err();
    assert_eq!(err.stage, Stage::ReadImage);
}

#[test]
fn test_disposed_image_cannot_be_bound() {
    let driver = fill_red_driver();
    let session = DeviceSession::open(driver).unwrap();
    let image = KernelImage::new(&session, 1, MemFlags::COPY_HOST_PTR, vec![0; 4], 1, 1, RGBA8)
        .unwrap();
    let mut bridge = compile(&session, FILL_RED, "fill_red").unwrap();
    image.dispose();
    assert_eq!(bridge.set_arg_image(&image).unwrap_err().stage, Stage::Disposed);
}

#[test]
fn test_compile_file() {
    let driver = Arc::new(CpuDriver::with_stock_kernels());
    let session = DeviceSession::open(driver).unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(COPY.as_bytes()).unwrap();
    let bridge = compile_file(&session, file.path(), "copy_image").unwrap();
    assert_eq!(bridge.entry_point(), "copy_image");
    assert_eq!(bridge.source(), COPY);
}

#[test]
fn test_everything_released_at_teardown() {
    let driver = fill_red_driver();
    {
        let session = DeviceSession::open(driver.clone()).unwrap();
        let image = KernelImage::new(&session, 1, MemFlags::COPY_HOST_PTR, vec![0; 16], 2, 2, RGBA8)
            .unwrap();
        let mut bridge = compile(&session, FILL_RED, "fill_red").unwrap();
        bridge.set_arg(0, 1i32).unwrap();
        bridge.set_arg_image(&image).unwrap();
        bridge.execute(image.work_size()).unwrap();
    }
    assert_eq!(driver.live_objects().total(), 0);
}
