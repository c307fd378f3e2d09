use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid handle: {0}")]
    InvalidHandle(&'static str),

    #[error("Slot {slot} is out of bounds for {contract} ({slot_count} slots)")]
    SlotOutOfBounds {
        contract: &'static str,
        slot: usize,
        slot_count: usize,
    },

    #[error("Dispatch table of object {object:#x} changed during installation")]
    TableChanged { object: usize },

    #[error("Slot {slot} of {contract} already dispatches to the replacement")]
    AlreadyBound { contract: &'static str, slot: usize },

    #[error("Failed to change memory protection at address {address:#x}: {message}")]
    ProtectFailed { address: usize, message: String },

    #[error("Invalid module image at {base:#x}: {message}")]
    InvalidImage { base: usize, message: String },

    #[error("Module not loaded: {0}")]
    ModuleNotLoaded(String),

    #[cfg(target_os = "windows")]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error means a required object or module was absent.
    ///
    /// The monitor treats these as an expected passthrough rather than a fault.
    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, Error::InvalidHandle(_) | Error::ModuleNotLoaded(_))
    }
}
