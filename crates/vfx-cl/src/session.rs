//! Device session: the platform, device, context and queue all work goes through.
//!
//! A session is opened once and never changes afterwards. Opening walks every
//! platform, picks the first device of the configured class that supports
//! images, then creates a single-device context and one command queue.
//!
//! Finding no such device is not an error at open time: the session is
//! created unavailable and every operation that needs the device fails with
//! [`Stage::NoDevice`] before touching the driver.
//!
//! # Example
//!
//! ```ignore
//! use vfx_cl::DeviceSession;
//!
//! let session = DeviceSession::global()?;
//! if let Some(info) = session.device_info() {
//!     println!("using {}", info.name);
//! }
//! drop(session);
//! DeviceSession::shutdown_global();
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::driver::{
    create_driver, ComputeDriver, ContextId, DeviceId, DeviceInfo, DeviceKind, MemFlags,
    PlatformId, QueueId, Status,
};
use crate::format::ImageFormat;
use crate::{ClError, ClResult, Stage};

/// Process-wide session, set on first use or by [`DeviceSession::init_global`].
static GLOBAL: Mutex<Global> = Mutex::new(Global::Unset);

enum Global {
    Unset,
    Set(ClResult<Arc<DeviceSession>>),
    ShutDown,
}

fn global_state() -> MutexGuard<'static, Global> {
    GLOBAL.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Raw handles of an available session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandles {
    pub platform: PlatformId,
    pub device: DeviceId,
    pub context: ContextId,
    pub queue: QueueId,
}

/// Values used when callers do not specify their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDefaults {
    /// Allocation flags for images and array arguments.
    pub mem_flags: MemFlags,
    /// Image layout when none is given.
    pub image_format: ImageFormat,
    /// Origin of every image transfer.
    pub origin: [usize; 3],
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            mem_flags: MemFlags::COPY_HOST_PTR,
            image_format: ImageFormat::default(),
            origin: [0, 0, 0],
        }
    }
}

/// One enumerated device, see [`describe_devices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceListing {
    pub platform: PlatformId,
    pub device: DeviceId,
    pub info: DeviceInfo,
}

/// Platform, device, context and queue shared by every kernel and image.
pub struct DeviceSession {
    driver: Arc<dyn ComputeDriver>,
    handles: Option<SessionHandles>,
    device_info: Option<DeviceInfo>,
    defaults: SessionDefaults,
}

impl DeviceSession {
    /// Open a session on the first image-capable GPU of `driver`.
    pub fn open(driver: Arc<dyn ComputeDriver>) -> ClResult<Arc<Self>> {
        Self::open_with(driver, DeviceKind::GPU)
    }

    /// Open a session on the first image-capable device of class `kind`.
    pub fn open_with(driver: Arc<dyn ComputeDriver>, kind: DeviceKind) -> ClResult<Arc<Self>> {
        let Some((platform, device, device_info)) = select_device(driver.as_ref(), kind)? else {
            warn!(driver = driver.name(), ?kind, "no image-capable device found");
            return Ok(Arc::new(Self {
                driver,
                handles: None,
                device_info: None,
                defaults: SessionDefaults::default(),
            }));
        };

        let context = driver
            .create_context(device)
            .map_err(|s| ClError::new(Stage::Init, s.to_string()))?;
        let queue = match driver.create_queue(context, device) {
            Ok(queue) => queue,
            Err(s) => {
                if let Err(e) = driver.release_context(context) {
                    warn!(error = %e, "release context after queue failure");
                }
                return Err(ClError::new(Stage::Queue, s.to_string()));
            }
        };

        info!(
            driver = driver.name(),
            device = %device_info.name,
            vendor = %device_info.vendor,
            mem_mb = device_info.global_mem_bytes / (1024 * 1024),
            "device session opened"
        );
        Ok(Arc::new(Self {
            driver,
            handles: Some(SessionHandles {
                platform,
                device,
                context,
                queue,
            }),
            device_info: Some(device_info),
            defaults: SessionDefaults::default(),
        }))
    }

    /// Create the configured driver and open a session on it.
    pub fn from_config(config: &SessionConfig) -> ClResult<Arc<Self>> {
        let driver = create_driver(config.driver)?;
        Self::open_with(driver, config.device_kind)
    }

    /// The process-wide session.
    ///
    /// Opened on first call from [`SessionConfig::from_env`]. The outcome,
    /// success or failure, is kept and returned on every later call until
    /// [`DeviceSession::shutdown_global`].
    pub fn global() -> ClResult<Arc<Self>> {
        let mut state = global_state();
        match &*state {
            Global::Set(result) => return result.clone(),
            Global::ShutDown => {
                return Err(ClError::new(
                    Stage::Disposed,
                    "global device session was shut down",
                ));
            }
            Global::Unset => {}
        }
        debug!("opening global device session");
        let result = Self::from_config(&SessionConfig::from_env());
        *state = Global::Set(result.clone());
        result
    }

    /// Install `session` as the process-wide session.
    ///
    /// Fails if [`DeviceSession::global`] or this function already ran.
    pub fn init_global(session: Arc<Self>) -> ClResult<()> {
        let mut state = global_state();
        if !matches!(*state, Global::Unset) {
            return Err(ClError::new(
                Stage::AlreadyInitialized,
                "global device session already set",
            ));
        }
        *state = Global::Set(Ok(session));
        Ok(())
    }

    /// Drop the process-wide session so its queue and context are released.
    ///
    /// Statics are never dropped, so call this before exit. Handles are
    /// released once the last outstanding `Arc` goes away. Later calls to
    /// [`DeviceSession::global`] fail with [`Stage::Disposed`]. Returns
    /// whether a session was held.
    pub fn shutdown_global() -> bool {
        let previous = std::mem::replace(&mut *global_state(), Global::ShutDown);
        let held = matches!(previous, Global::Set(Ok(_)));
        if held {
            info!("global device session shut down");
        }
        drop(previous);
        held
    }

    /// Whether a capable device was found.
    pub fn is_available(&self) -> bool {
        self.handles.is_some()
    }

    /// Handles of the session, or a `NoDevice` error.
    #[track_caller]
    pub fn handles(&self) -> ClResult<SessionHandles> {
        match self.handles {
            Some(h) => Ok(h),
            None => Err(ClError::no_device()),
        }
    }

    pub fn driver(&self) -> &dyn ComputeDriver {
        self.driver.as_ref()
    }

    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    /// Selected device, if any.
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        let Some(h) = self.handles.take() else {
            return;
        };
        if let Err(e) = self.driver.release_queue(h.queue) {
            warn!(error = %e, "release command queue");
        }
        if let Err(e) = self.driver.release_context(h.context) {
            warn!(error = %e, "release context");
        }
        debug!(driver = self.driver.name(), "device session closed");
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("driver", &self.driver.name())
            .field("device", &self.device_info.as_ref().map(|i| i.name.as_str()))
            .field("handles", &self.handles)
            .finish()
    }
}

/// Platforms, treating an empty ICD as zero platforms.
fn platforms(driver: &dyn ComputeDriver) -> ClResult<Vec<PlatformId>> {
    match driver.platforms() {
        Ok(p) => Ok(p),
        Err(s) if s.code == Status::PLATFORM_NOT_FOUND_KHR => Ok(Vec::new()),
        Err(s) => Err(ClError::new(Stage::Platform, s.to_string())),
    }
}

/// Devices of `kind` on `platform`, treating `DEVICE_NOT_FOUND` as none.
fn devices(
    driver: &dyn ComputeDriver,
    platform: PlatformId,
    kind: DeviceKind,
) -> ClResult<Vec<DeviceId>> {
    match driver.devices(platform, kind) {
        Ok(d) => Ok(d),
        Err(s) if s.code == Status::DEVICE_NOT_FOUND => Ok(Vec::new()),
        Err(s) => Err(ClError::new(Stage::Device, s.to_string())),
    }
}

fn select_device(
    driver: &dyn ComputeDriver,
    kind: DeviceKind,
) -> ClResult<Option<(PlatformId, DeviceId, DeviceInfo)>> {
    for platform in platforms(driver)? {
        for device in devices(driver, platform, kind)? {
            let info = driver
                .device_info(device)
                .map_err(|s| ClError::new(Stage::Device, s.to_string()))?;
            debug!(%platform, %device, name = %info.name, images = info.image_support, "device");
            if info.image_support {
                return Ok(Some((platform, device, info)));
            }
        }
    }
    Ok(None)
}

/// Every device of class `kind` on every platform.
pub fn describe_devices(
    driver: &dyn ComputeDriver,
    kind: DeviceKind,
) -> ClResult<Vec<DeviceListing>> {
    let mut out = Vec::new();
    for platform in platforms(driver)? {
        for device in devices(driver, platform, kind)? {
            let info = driver
                .device_info(device)
                .map_err(|s| ClError::new(Stage::Device, s.to_string()))?;
            out.push(DeviceListing {
                platform,
                device,
                info,
            });
        }
    }
    Ok(out)
}
