//! Error type shared by every bridge operation.
//!
//! All failures surface as a single [`ClError`] carrying a [`Stage`] tag and a
//! detail string. The detail is the raw driver status text, or the device
//! compiler's build log for compile failures.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// Step of the bridge that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Platform enumeration.
    Platform,
    /// Device enumeration or device info query.
    Device,
    /// Context creation.
    Init,
    /// Command queue creation.
    Queue,
    /// No image-capable device was found at session start.
    NoDevice,
    /// Program object creation from source.
    CompileCreate,
    /// Program build.
    CompileBuild,
    /// Build status query reported a failure.
    CompileStatus,
    /// Kernel extraction for an entry point.
    KernelCreate,
    /// Device image allocation.
    SetImage2D,
    /// Kernel argument assignment.
    SetKernelArg,
    /// Device buffer allocation for an array argument.
    CreateBuffer,
    /// Host to device image transfer.
    WriteImage,
    /// Device to host image transfer.
    ReadImage,
    /// Kernel dispatch.
    Execute,
    /// Queue drain after dispatch.
    Finish,
    /// Replacement host bytes differ in length from the current ones.
    LengthMismatch,
    /// Host pixel format has no device equivalent.
    UnsupportedFormat,
    /// Presentation image could not be locked.
    ImageLocked,
    /// Image buffer was used after disposal.
    Disposed,
    /// Reading kernel source from disk.
    Io,
    /// The process-wide session was already set up.
    AlreadyInitialized,
}

impl Stage {
    /// Short tag used in messages and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Platform => "Platform",
            Self::Device => "Device",
            Self::Init => "Init",
            Self::Queue => "Queue",
            Self::NoDevice => "NoDevice",
            Self::CompileCreate => "Compile.Create",
            Self::CompileBuild => "Compile.Build",
            Self::CompileStatus => "Compile.Status",
            Self::KernelCreate => "Compile.Kernel",
            Self::SetImage2D => "SetImage2D",
            Self::SetKernelArg => "SetKernelArg",
            Self::CreateBuffer => "CreateBuffer",
            Self::WriteImage => "WriteImage",
            Self::ReadImage => "ReadImage",
            Self::Execute => "Execute",
            Self::Finish => "Finish",
            Self::LengthMismatch => "LengthMismatch",
            Self::UnsupportedFormat => "UnsupportedFormat",
            Self::ImageLocked => "ImageLocked",
            Self::Disposed => "Disposed",
            Self::Io => "Io",
            Self::AlreadyInitialized => "AlreadyInitialized",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a bridge operation.
#[derive(Error, Debug, Clone)]
#[error("{stage} ({detail})")]
pub struct ClError {
    /// Failing step.
    pub stage: Stage,
    /// Driver status text or build log.
    pub detail: String,
    /// Where the error was raised.
    pub location: &'static Location<'static>,
}

impl ClError {
    /// Create an error at the caller's location.
    #[track_caller]
    pub fn new(stage: Stage, detail: impl Into<String>) -> Self {
        let err = Self {
            stage,
            detail: detail.into(),
            location: Location::caller(),
        };
        tracing::debug!(
            stage = %err.stage,
            detail = %err.detail,
            at = %err.location,
            "vfx-cl error"
        );
        err
    }

    /// Error for operations attempted without a usable device.
    #[track_caller]
    pub fn no_device() -> Self {
        Self::new(Stage::NoDevice, "no image-capable GPU device available")
    }

    /// Length mismatch between current and replacement host bytes.
    #[track_caller]
    pub fn length_mismatch(expected: usize, actual: usize) -> Self {
        Self::new(
            Stage::LengthMismatch,
            format!("expected {expected} bytes, got {actual}"),
        )
    }

    /// Whether this is the missing-device condition.
    pub fn is_no_device(&self) -> bool {
        self.stage == Stage::NoDevice
    }
}

pub type ClResult<T> = Result<T, ClError>;
