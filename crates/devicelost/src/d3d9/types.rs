//! Direct3D 9 ABI pieces needed by the monitor.

use std::ffi::c_void;

use strum::Display;

use crate::hook::DispatchContract;

/// Raw `HRESULT` as returned across the Direct3D 9 ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct HResult(pub i32);

impl HResult {
    /// Build an `HRESULT` from its unsigned hex spelling (e.g. `0x88760868`)
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits as i32)
    }

    pub const fn bits(self) -> u32 {
        self.0 as u32
    }

    pub const fn is_ok(self) -> bool {
        self.0 >= 0
    }
}

impl std::fmt::Display for HResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010X}", self.bits())
    }
}

pub const D3D_OK: HResult = HResult(0);
pub const D3DERR_DRIVERINTERNALERROR: HResult = HResult::from_bits(0x8876_0827);
pub const D3DERR_DEVICELOST: HResult = HResult::from_bits(0x8876_0868);
pub const D3DERR_DEVICENOTRESET: HResult = HResult::from_bits(0x8876_0869);
pub const D3DERR_NOTAVAILABLE: HResult = HResult::from_bits(0x8876_086A);
pub const D3DERR_INVALIDCALL: HResult = HResult::from_bits(0x8876_086C);

/// Dispatch table slot indices
pub mod slot {
    /// `IDirect3D9::CreateDevice`
    pub const CREATE_DEVICE: usize = 16;
    /// `IDirect3DDevice9::TestCooperativeLevel`
    pub const TEST_COOPERATIVE_LEVEL: usize = 3;
    /// `IDirect3DDevice9::Reset`
    pub const RESET: usize = 16;
}

/// IUnknown (3) + 14 methods
pub const IDIRECT3D9: DispatchContract = DispatchContract::new("IDirect3D9", 17);
/// IUnknown (3) + 116 methods
pub const IDIRECT3DDEVICE9: DispatchContract = DispatchContract::new("IDirect3DDevice9", 119);

pub type Direct3DCreate9Fn = unsafe extern "system" fn(sdk_version: u32) -> *mut c_void;

pub type CreateDeviceFn = unsafe extern "system" fn(
    this: *mut c_void,
    adapter: u32,
    device_type: u32,
    focus_window: *mut c_void,
    behavior_flags: u32,
    presentation_parameters: *mut c_void,
    returned_device: *mut *mut c_void,
) -> HResult;

pub type ResetFn =
    unsafe extern "system" fn(this: *mut c_void, presentation_parameters: *mut c_void) -> HResult;

pub type TestCooperativeLevelFn = unsafe extern "system" fn(this: *mut c_void) -> HResult;

/// Device usability as reported by `TestCooperativeLevel`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CooperativeLevel {
    #[strum(serialize = "OK")]
    Ok,
    #[strum(serialize = "LOST")]
    Lost,
    #[strum(serialize = "NOT_RESET")]
    NotReset,
    #[strum(serialize = "DRIVER_ERROR")]
    DriverError,
}

impl CooperativeLevel {
    /// Classify a `TestCooperativeLevel` result.
    ///
    /// Anything the driver contract does not define is treated as a hard fault.
    pub fn from_hresult(hr: HResult) -> Self {
        match hr {
            D3D_OK => Self::Ok,
            D3DERR_DEVICELOST => Self::Lost,
            D3DERR_DEVICENOTRESET => Self::NotReset,
            _ => Self::DriverError,
        }
    }
}

impl From<HResult> for CooperativeLevel {
    fn from(hr: HResult) -> Self {
        Self::from_hresult(hr)
    }
}
