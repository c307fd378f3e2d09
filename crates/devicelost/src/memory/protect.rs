//! Page protection changes for writing into foreign read-only tables.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Makes a memory range writable until dropped.
///
/// The previous page protection is restored when the guard goes out of scope.
pub struct ProtectGuard {
    #[cfg_attr(not(target_os = "windows"), allow(dead_code))]
    address: usize,
    #[cfg_attr(not(target_os = "windows"), allow(dead_code))]
    size: usize,
    #[cfg(target_os = "windows")]
    previous: windows::Win32::System::Memory::PAGE_PROTECTION_FLAGS,
}

impl ProtectGuard {
    /// Make `size` bytes at `address` writable.
    ///
    /// # Safety
    ///
    /// `address` must point into memory mapped in this process.
    #[cfg(target_os = "windows")]
    pub unsafe fn unprotect(address: *const u8, size: usize) -> Result<Self> {
        use windows::Win32::System::Memory::{
            PAGE_PROTECTION_FLAGS, PAGE_READWRITE, VirtualProtect,
        };

        let mut previous = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: the caller guarantees the range is mapped; VirtualProtect only
        // touches page attributes.
        unsafe { VirtualProtect(address.cast(), size, PAGE_READWRITE, &mut previous) }.map_err(
            |e| Error::ProtectFailed {
                address: address as usize,
                message: e.to_string(),
            },
        )?;

        Ok(Self {
            address: address as usize,
            size,
            previous,
        })
    }

    /// Heap and test memory is already writable outside Windows.
    ///
    /// # Safety
    ///
    /// `address` must point into memory mapped in this process.
    #[cfg(not(target_os = "windows"))]
    pub unsafe fn unprotect(address: *const u8, size: usize) -> Result<Self> {
        if address.is_null() {
            return Err(Error::ProtectFailed {
                address: 0,
                message: "null address".to_string(),
            });
        }
        Ok(Self {
            address: address as usize,
            size,
        })
    }
}

#[cfg(target_os = "windows")]
impl Drop for ProtectGuard {
    fn drop(&mut self) {
        use windows::Win32::System::Memory::{PAGE_PROTECTION_FLAGS, VirtualProtect};

        let mut ignored = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: the range was successfully unprotected in `unprotect`.
        let restored = unsafe {
            VirtualProtect(
                self.address as *const _,
                self.size,
                self.previous,
                &mut ignored,
            )
        };
        if let Err(e) = restored {
            tracing::warn!(
                "Failed to restore protection of {} bytes at {:#x}: {}",
                self.size,
                self.address,
                e
            );
        }
    }
}

/// Atomically replace one pointer-sized word, returning the previous value.
///
/// # Safety
///
/// `address` must be a valid, pointer-aligned word in mapped memory that no
/// one else writes concurrently.
pub unsafe fn write_word(address: *mut usize, value: usize) -> Result<usize> {
    let _guard = unsafe { ProtectGuard::unprotect(address.cast(), size_of::<usize>()) }?;
    // SAFETY: alignment and validity are guaranteed by the caller, and the page
    // is writable while the guard lives.
    let slot = unsafe { AtomicUsize::from_ptr(address) };
    Ok(slot.swap(value, Ordering::SeqCst))
}

/// Replace one pointer-sized word only if it still holds `current`.
///
/// Returns `Ok(false)` without writing if someone else changed the word.
///
/// # Safety
///
/// `address` must be a valid, pointer-aligned word in mapped memory.
pub unsafe fn exchange_word(address: *mut usize, current: usize, value: usize) -> Result<bool> {
    let _guard = unsafe { ProtectGuard::unprotect(address.cast(), size_of::<usize>()) }?;
    // SAFETY: see `write_word`.
    let slot = unsafe { AtomicUsize::from_ptr(address) };
    Ok(slot
        .compare_exchange(current, value, Ordering::AcqRel, Ordering::Acquire)
        .is_ok())
}
