//! Program compilation and kernel extraction.
//!
//! [`compile`] is the one-call path: build the source, pull out the entry
//! point and hand back a [`KernelBridge`]. [`build_program`] and
//! [`Program::create_kernel`] expose the two halves separately so several
//! kernels can come from one build.
//!
//! Compile failures carry the device compiler's build log as their detail.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::bridge::KernelBridge;
use crate::driver::{BuildStatus, KernelId, ProgramId};
use crate::session::DeviceSession;
use crate::{ClError, ClResult, Stage};

/// Built program. Released on drop.
pub struct Program {
    session: Arc<DeviceSession>,
    id: ProgramId,
}

impl Program {
    pub fn id(&self) -> ProgramId {
        self.id
    }

    /// Build log for the session device.
    pub fn build_log(&self) -> ClResult<String> {
        let h = self.session.handles()?;
        self.session
            .driver()
            .build_log(self.id, h.device)
            .map_err(|s| ClError::new(Stage::CompileStatus, s.to_string()))
    }

    /// Extract the kernel for entry point `name`.
    pub fn create_kernel(&self, name: &str) -> ClResult<Kernel> {
        self.session.handles()?;
        let id = self
            .session
            .driver()
            .create_kernel(self.id, name)
            .map_err(|s| ClError::new(Stage::KernelCreate, format!("{s}: entry point '{name}'")))?;
        debug!(program = %self.id, kernel = %id, name, "kernel created");
        Ok(Kernel {
            session: Arc::clone(&self.session),
            id,
            name: name.to_string(),
        })
    }
}

impl Drop for Program {
    fn drop(&mut self) {
        if let Err(e) = self.session.driver().release_program(self.id) {
            warn!(program = %self.id, error = %e, "release program");
        }
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program").field("id", &self.id).finish()
    }
}

/// Kernel handle for one entry point. Released on drop.
pub struct Kernel {
    session: Arc<DeviceSession>,
    id: KernelId,
    name: String,
}

impl Kernel {
    pub fn id(&self) -> KernelId {
        self.id
    }

    /// Entry point name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &Arc<DeviceSession> {
        &self.session
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Err(e) = self.session.driver().release_kernel(self.id) {
            warn!(kernel = %self.id, name = %self.name, error = %e, "release kernel");
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Create and build a program from `source` for the session device.
pub fn build_program(session: &Arc<DeviceSession>, source: &str) -> ClResult<Program> {
    let h = session.handles()?;
    let driver = session.driver();

    let id = driver
        .create_program(h.context, source)
        .map_err(|s| ClError::new(Stage::CompileCreate, s.to_string()))?;
    let program = Program {
        session: Arc::clone(session),
        id,
    };

    // The log is the useful detail; fall back to the status when it is empty
    // or cannot be read.
    let log_or = |status: String| match driver.build_log(id, h.device) {
        Ok(log) if !log.trim().is_empty() => log,
        _ => status,
    };

    if let Err(s) = driver.build_program(id, h.device, "") {
        return Err(ClError::new(Stage::CompileBuild, log_or(s.to_string())));
    }
    match driver.build_status(id, h.device) {
        Ok(BuildStatus::Success) => {}
        Ok(status) => {
            return Err(ClError::new(
                Stage::CompileStatus,
                log_or(format!("build status {status:?}")),
            ));
        }
        Err(s) => return Err(ClError::new(Stage::CompileStatus, s.to_string())),
    }

    debug!(program = %id, source_len = source.len(), "program built");
    Ok(program)
}

/// Compile `source` and bind its `entry_point` into a [`KernelBridge`].
pub fn compile(
    session: &Arc<DeviceSession>,
    source: &str,
    entry_point: &str,
) -> ClResult<KernelBridge> {
    let program = build_program(session, source)?;
    let kernel = program.create_kernel(entry_point)?;
    Ok(KernelBridge::new(kernel, source, entry_point))
}

/// Like [`compile`], reading the source from `path`.
pub fn compile_file(
    session: &Arc<DeviceSession>,
    path: impl AsRef<Path>,
    entry_point: &str,
) -> ClResult<KernelBridge> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path)
        .map_err(|e| ClError::new(Stage::Io, format!("{}: {e}", path.display())))?;
    compile(session, &source, entry_point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{CpuDriver, DriverCall, Status};

    const COPY: &str =
        "__kernel void copy_image(read_only image2d_t src, write_only image2d_t dst) {}";

    fn session(driver: &Arc<CpuDriver>) -> Arc<DeviceSession> {
        DeviceSession::open(driver.clone()).unwrap()
    }

    #[test]
    fn builds_and_extracts_kernel() {
        let driver = Arc::new(CpuDriver::with_stock_kernels());
        let s = session(&driver);
        let program = build_program(&s, COPY).unwrap();
        let kernel = program.create_kernel("copy_image").unwrap();
        assert_eq!(kernel.name(), "copy_image");
        drop(program);
        drop(kernel);
        assert_eq!(driver.live_objects().programs, 0);
        assert_eq!(driver.live_objects().kernels, 0);
    }

    #[test]
    fn build_error_carries_log() {
        let driver = Arc::new(CpuDriver::with_stock_kernels());
        let s = session(&driver);
        let err = build_program(&s, "__kernel void copy_image(int a {").unwrap_err();
        assert_eq!(err.stage, Stage::CompileBuild);
        assert!(err.detail.contains("error generated"), "{}", err.detail);
        assert_eq!(driver.live_objects().programs, 0);
    }

    #[test]
    fn create_failure_uses_status_text() {
        let driver = Arc::new(CpuDriver::with_stock_kernels());
        let s = session(&driver);
        let err = build_program(&s, "").unwrap_err();
        assert_eq!(err.stage, Stage::CompileCreate);
        assert!(err.detail.starts_with("CL_INVALID_VALUE"));
    }

    #[test]
    fn status_query_failure() {
        let driver = Arc::new(CpuDriver::with_stock_kernels());
        let s = session(&driver);
        driver.inject_fault(DriverCall::BuildStatus, Status::new(Status::INVALID_PROGRAM));
        let err = build_program(&s, COPY).unwrap_err();
        assert_eq!(err.stage, Stage::CompileStatus);
    }

    #[test]
    fn unknown_entry_point() {
        let driver = Arc::new(CpuDriver::with_stock_kernels());
        let s = session(&driver);
        let err = compile(&s, COPY, "run").unwrap_err();
        assert_eq!(err.stage, Stage::KernelCreate);
        assert!(err.detail.contains("'run'"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let driver = Arc::new(CpuDriver::with_stock_kernels());
        let s = session(&driver);
        let err = compile_file(&s, "/nonexistent/kernel.cl", "copy_image").unwrap_err();
        assert_eq!(err.stage, Stage::Io);
    }
}
