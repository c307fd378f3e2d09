//! Host services backed by the operating system.

use std::time::Duration;

use tracing::error;

use super::{EventPump, ModuleHandle, Modules, Notifier};
use crate::error::Result;

/// Modules of the current process
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemModules;

/// Message queue and message box of the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

#[cfg(target_os = "windows")]
impl Modules for SystemModules {
    fn find_loaded(&self, name: &str) -> Option<ModuleHandle> {
        use windows::Win32::System::LibraryLoader::GetModuleHandleW;
        use windows::core::HSTRING;

        let name = HSTRING::from(name);
        // SAFETY: GetModuleHandleW only looks up modules that are already
        // loaded and does not take a reference on them.
        unsafe { GetModuleHandleW(&name) }
            .ok()
            .map(|module| ModuleHandle(module.0 as usize))
    }

    fn resolve_symbol(&self, module: ModuleHandle, symbol: &str) -> Option<usize> {
        use windows::Win32::Foundation::HMODULE;
        use windows::Win32::System::LibraryLoader::GetProcAddress;
        use windows::core::PCSTR;

        let symbol = std::ffi::CString::new(symbol).ok()?;
        // SAFETY: the module handle came from GetModuleHandleW and the name is
        // NUL-terminated.
        let proc = unsafe {
            GetProcAddress(
                HMODULE(module.0 as *mut _),
                PCSTR(symbol.as_ptr().cast()),
            )
        };
        proc.map(|f| f as *const () as usize)
    }

    fn redirect_import(
        &self,
        module: &str,
        symbol: &str,
        replacement: usize,
    ) -> Result<Vec<usize>> {
        use crate::hook::redirect_import;

        let target = self.find_loaded(module);
        let mut displaced = Vec::new();

        for base in loaded_modules()? {
            // The exporting module never imports its own factory.
            if Some(base) == target {
                continue;
            }
            // SAFETY: every handle from EnumProcessModules is the base of a
            // mapped image.
            match unsafe { redirect_import(base.0 as *const u8, module, symbol, replacement) } {
                Ok(mut entries) => displaced.append(&mut entries),
                Err(e) => tracing::debug!("Skipping module {:#x}: {}", base.0, e),
            }
        }

        Ok(displaced)
    }
}

/// Base addresses of every module loaded in this process.
#[cfg(target_os = "windows")]
fn loaded_modules() -> Result<Vec<ModuleHandle>> {
    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::System::ProcessStatus::EnumProcessModules;
    use windows::Win32::System::Threading::GetCurrentProcess;

    // SAFETY: the pseudo handle of the current process is always valid.
    let process = unsafe { GetCurrentProcess() };
    let mut modules = vec![HMODULE::default(); 256];

    loop {
        let mut needed: u32 = 0;
        let capacity = (modules.len() * size_of::<HMODULE>()) as u32;
        // SAFETY: the buffer holds `capacity` bytes of HMODULE slots.
        unsafe { EnumProcessModules(process, modules.as_mut_ptr(), capacity, &mut needed) }?;

        let count = needed as usize / size_of::<HMODULE>();
        if count <= modules.len() {
            modules.truncate(count);
            break;
        }
        // More modules were loaded than the buffer holds; grow and retry.
        modules.resize(count, HMODULE::default());
    }

    Ok(modules
        .into_iter()
        .map(|module| ModuleHandle(module.0 as usize))
        .collect())
}

#[cfg(target_os = "windows")]
impl EventPump for SystemHost {
    fn wait_for_events(&self, timeout: Duration) {
        use windows::Win32::Foundation::FALSE;
        use windows::Win32::UI::WindowsAndMessaging::{MsgWaitForMultipleObjects, QS_ALLINPUT};

        // u32::MAX would be INFINITE.
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
        // SAFETY: waiting on no handles only watches the thread's message queue.
        unsafe {
            let _ = MsgWaitForMultipleObjects(None, FALSE, millis, QS_ALLINPUT);
        }
    }
}

#[cfg(target_os = "windows")]
impl Notifier for SystemHost {
    fn notify_unrecoverable(&self, title: &str, text: &str) {
        use windows::Win32::Foundation::HWND;
        use windows::Win32::UI::WindowsAndMessaging::{MB_ICONERROR, MessageBoxW};
        use windows::core::HSTRING;

        error!("{}: {}", title, text);

        let text = HSTRING::from(text);
        let title = HSTRING::from(title);
        // SAFETY: MessageBoxW with no owner window is always safe to call; it
        // blocks until the user dismisses it.
        unsafe {
            let _ = MessageBoxW(HWND::default(), &text, &title, MB_ICONERROR);
        }
    }
}

// --- Non-Windows stubs ---

#[cfg(not(target_os = "windows"))]
impl Modules for SystemModules {
    fn find_loaded(&self, _name: &str) -> Option<ModuleHandle> {
        None
    }

    fn resolve_symbol(&self, _module: ModuleHandle, _symbol: &str) -> Option<usize> {
        None
    }

    fn redirect_import(
        &self,
        module: &str,
        _symbol: &str,
        _replacement: usize,
    ) -> Result<Vec<usize>> {
        Err(crate::error::Error::ModuleNotLoaded(module.to_string()))
    }
}

#[cfg(not(target_os = "windows"))]
impl EventPump for SystemHost {
    fn wait_for_events(&self, timeout: Duration) {
        std::thread::sleep(timeout);
    }
}

#[cfg(not(target_os = "windows"))]
impl Notifier for SystemHost {
    fn notify_unrecoverable(&self, title: &str, text: &str) {
        error!("{}: {}", title, text);
    }
}
