//! Device lifecycle monitor.
//!
//! Hooks are installed in three stages, each on a freshly returned object
//! before the caller can see it:
//!
//! 1. `Direct3DCreate9` in the import tables of loaded modules
//! 2. `IDirect3D9::CreateDevice` on every interface the factory returns
//! 3. `IDirect3DDevice9::Reset` on every device `CreateDevice` returns
//!
//! The replacement functions are plain `extern "system"` functions, so they
//! reach their state through the process-wide [`Monitor::global`]. Only that
//! monitor can be activated.

use std::ffi::c_void;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use super::recovery::{ResettableDevice, reset_device};
use super::types::{
    CreateDeviceFn, D3DERR_INVALIDCALL, Direct3DCreate9Fn, HResult, IDIRECT3D9, IDIRECT3DDEVICE9,
    ResetFn, TestCooperativeLevelFn, slot,
};
use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::hook::{Interceptor, dispatch_entry};
use crate::platform::{Host, Modules, SystemHost};

static MONITOR: OnceLock<Monitor> = OnceLock::new();

/// Result of activating the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activation {
    /// Disabled by configuration
    Disabled,
    /// Target module was not loaded; nothing was resolved or installed
    NotLoaded,
    /// Target module is loaded but does not export the factory
    MissingFactory,
    /// Factory resolved; `redirected` import entries now point at the monitor
    Active { redirected: usize },
    /// Import redirection failed; the host runs unmonitored
    Failed(String),
}

impl Activation {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }
}

/// Watches Direct3D 9 objects and recovers lost devices on reset
pub struct Monitor {
    config: MonitorConfig,
    host: Box<dyn Host>,
    interceptor: Interceptor,
    /// Factory the Stage A hook delegates to; 0 until resolved
    factory: AtomicUsize,
    activation: OnceLock<Activation>,
}

impl Monitor {
    pub(crate) fn new(config: MonitorConfig, host: Box<dyn Host>) -> Self {
        Self {
            config,
            host,
            interceptor: Interceptor::new(),
            factory: AtomicUsize::new(0),
            activation: OnceLock::new(),
        }
    }

    /// The process-wide monitor the hooks dispatch to.
    ///
    /// Created with the default configuration if [`Monitor::init_global`] was
    /// never called.
    pub fn global() -> &'static Monitor {
        MONITOR.get_or_init(|| Monitor::new(MonitorConfig::default(), Box::new(SystemHost)))
    }

    /// Create the process-wide monitor with `config`.
    ///
    /// Only the first call decides the configuration; later calls return the
    /// existing monitor.
    pub fn init_global(config: MonitorConfig) -> &'static Monitor {
        MONITOR.get_or_init(|| Monitor::new(config, Box::new(SystemHost)))
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    /// Factory the Stage A hook delegates to, if activation resolved it
    pub fn factory(&self) -> Option<usize> {
        match self.factory.load(Ordering::Acquire) {
            0 => None,
            factory => Some(factory),
        }
    }

    /// Outcome of the first activation, if any
    pub fn activation(&self) -> Option<&Activation> {
        self.activation.get()
    }

    /// Intercept the factory if the target module is already loaded.
    ///
    /// Idempotent: only the first call does any work, later calls return the
    /// first outcome. A module loaded after activation is never retrofitted.
    #[tracing::instrument(skip_all)]
    pub(crate) fn activate(&self, modules: &dyn Modules) -> &Activation {
        self.activation.get_or_init(|| match self.try_activate(modules) {
            Ok(activation) => {
                info!("Device lifecycle monitor: {:?}", activation);
                activation
            }
            Err(e) if e.is_invalid_handle() => {
                debug!("Device lifecycle monitor not started: {}", e);
                Activation::NotLoaded
            }
            Err(e) => {
                warn!("Device lifecycle monitor inactive: {}", e);
                Activation::Failed(e.to_string())
            }
        })
    }

    fn try_activate(&self, modules: &dyn Modules) -> Result<Activation> {
        if !self.config.enabled {
            return Ok(Activation::Disabled);
        }

        let Some(module) = modules.find_loaded(&self.config.module) else {
            debug!("{} not loaded, skipping", self.config.module);
            return Ok(Activation::NotLoaded);
        };

        let Some(factory) = modules.resolve_symbol(module, &self.config.factory_symbol) else {
            debug!(
                "{} does not export {}",
                self.config.module, self.config.factory_symbol
            );
            return Ok(Activation::MissingFactory);
        };

        // Published before any import entry points at the hook, so a call
        // racing the redirection still reaches the real factory.
        self.factory.store(factory, Ordering::Release);

        let hook = direct3d_create9_hook as *const () as usize;
        let displaced =
            modules.redirect_import(&self.config.module, &self.config.factory_symbol, hook)?;

        let mut distinct: Vec<usize> = Vec::new();
        for &entry in &displaced {
            if entry != hook && !distinct.contains(&entry) {
                distinct.push(entry);
            }
        }

        // If another interceptor already owned an import entry, chain to it
        // rather than jumping straight to the export.
        if let Some(chained) = distinct.iter().copied().find(|&entry| entry != factory) {
            if distinct.len() > 1 {
                warn!(
                    "Import entries for {} disagree ({:x?}); every caller now goes through {:#x}",
                    self.config.factory_symbol, distinct, chained
                );
            }
            debug!("Chaining to displaced import entry {:#x}", chained);
            self.factory.store(chained, Ordering::Release);
        }

        Ok(Activation::Active {
            redirected: displaced.len(),
        })
    }

    /// Stage B: intercept `CreateDevice` on a new `IDirect3D9` interface.
    ///
    /// # Safety
    ///
    /// `d3d` must be null or a live `IDirect3D9` object.
    pub(crate) unsafe fn hook_interface(&self, d3d: *mut c_void) -> Result<()> {
        unsafe {
            self.interceptor.install(
                d3d,
                &IDIRECT3D9,
                slot::CREATE_DEVICE,
                create_device_hook as *const () as usize,
            )
        }?;
        debug!("Hooked IDirect3D9 {:#x}", d3d as usize);
        Ok(())
    }

    /// Stage C: intercept `Reset` on a new `IDirect3DDevice9`.
    ///
    /// # Safety
    ///
    /// `device` must be null or a live `IDirect3DDevice9` object.
    pub(crate) unsafe fn hook_device(&self, device: *mut c_void) -> Result<()> {
        unsafe {
            self.interceptor.install(
                device,
                &IDIRECT3DDEVICE9,
                slot::RESET,
                reset_hook as *const () as usize,
            )
        }?;
        debug!("Hooked IDirect3DDevice9 {:#x}", device as usize);
        Ok(())
    }

    /// Run the recovery protocol for a reset on `device`.
    ///
    /// # Safety
    ///
    /// `device` must be a live `IDirect3DDevice9` and `original` its original
    /// `Reset`.
    pub unsafe fn reset(
        &self,
        device: *mut c_void,
        original: ResetFn,
        presentation_parameters: *mut c_void,
    ) -> HResult {
        let mut device = HookedDevice {
            raw: device,
            original,
            presentation_parameters,
        };
        reset_device(&mut device, self.host.as_ref(), &self.config).result
    }
}

/// An intercepted device together with the arguments of the pending `Reset`
struct HookedDevice {
    raw: *mut c_void,
    original: ResetFn,
    presentation_parameters: *mut c_void,
}

impl ResettableDevice for HookedDevice {
    fn test_cooperative_level(&mut self) -> HResult {
        // SAFETY: `raw` is a live device (checked by the caller of `reset`).
        match unsafe { dispatch_entry(self.raw, &IDIRECT3DDEVICE9, slot::TEST_COOPERATIVE_LEVEL) } {
            Ok(entry) => {
                let test_cooperative_level =
                    unsafe { std::mem::transmute::<usize, TestCooperativeLevelFn>(entry) };
                unsafe { test_cooperative_level(self.raw) }
            }
            Err(e) => {
                warn!("Cannot query cooperative level: {}", e);
                D3DERR_INVALIDCALL
            }
        }
    }

    fn reset(&mut self) -> HResult {
        // SAFETY: `original` is the entry our hook displaced on this device.
        unsafe { (self.original)(self.raw, self.presentation_parameters) }
    }
}

/// Look up the entry `replacement` displaced on `object`, logging if it is missing.
fn original_entry(
    monitor: &Monitor,
    object: *mut c_void,
    slot: usize,
    replacement: usize,
) -> Option<usize> {
    // SAFETY: `object` is the live `this` of the call being intercepted.
    let original = unsafe { monitor.interceptor.original(object, slot, replacement) };
    if original.is_none() {
        warn!(
            "No original recorded for slot {} of object {:#x}",
            slot, object as usize
        );
    }
    original
}

/// Log a stage that could not be installed; the host keeps running unhooked.
fn log_stage_failure(stage: &str, e: &Error) {
    if e.is_invalid_handle() {
        debug!("{} not hooked: {}", stage, e);
    } else {
        warn!("Failed to hook {}: {}", stage, e);
    }
}

/// Stage A replacement for `Direct3DCreate9`
pub unsafe extern "system" fn direct3d_create9_hook(sdk_version: u32) -> *mut c_void {
    let monitor = Monitor::global();
    let Some(factory) = monitor.factory() else {
        return std::ptr::null_mut();
    };

    // SAFETY: `factory` is the resolved export (or the import entry we displaced).
    let factory = unsafe { std::mem::transmute::<usize, Direct3DCreate9Fn>(factory) };
    let d3d = unsafe { factory(sdk_version) };
    if !d3d.is_null() {
        if let Err(e) = unsafe { monitor.hook_interface(d3d) } {
            log_stage_failure("IDirect3D9", &e);
        }
    }
    d3d
}

/// Stage B replacement for `IDirect3D9::CreateDevice`
pub unsafe extern "system" fn create_device_hook(
    this: *mut c_void,
    adapter: u32,
    device_type: u32,
    focus_window: *mut c_void,
    behavior_flags: u32,
    presentation_parameters: *mut c_void,
    returned_device: *mut *mut c_void,
) -> HResult {
    let monitor = Monitor::global();
    let Some(original) = original_entry(
        monitor,
        this,
        slot::CREATE_DEVICE,
        create_device_hook as *const () as usize,
    ) else {
        return D3DERR_INVALIDCALL;
    };

    // SAFETY: `original` is the CreateDevice entry this hook displaced.
    let original = unsafe { std::mem::transmute::<usize, CreateDeviceFn>(original) };
    let hr = unsafe {
        original(
            this,
            adapter,
            device_type,
            focus_window,
            behavior_flags,
            presentation_parameters,
            returned_device,
        )
    };

    if hr.is_ok() && !returned_device.is_null() {
        // SAFETY: CreateDevice succeeded, so the out pointer was written.
        let device = unsafe { *returned_device };
        if !device.is_null() {
            if let Err(e) = unsafe { monitor.hook_device(device) } {
                log_stage_failure("IDirect3DDevice9", &e);
            }
        }
    }
    hr
}

/// Stage C replacement for `IDirect3DDevice9::Reset`
pub unsafe extern "system" fn reset_hook(
    this: *mut c_void,
    presentation_parameters: *mut c_void,
) -> HResult {
    let monitor = Monitor::global();
    let Some(original) = original_entry(
        monitor,
        this,
        slot::RESET,
        reset_hook as *const () as usize,
    ) else {
        return D3DERR_INVALIDCALL;
    };

    // SAFETY: `original` is the Reset entry this hook displaced.
    let original = unsafe { std::mem::transmute::<usize, ResetFn>(original) };
    unsafe { monitor.reset(this, original, presentation_parameters) }
}
