//! Import address table redirection.
//!
//! Walks the import directory of a module mapped in this process and rewrites
//! the IAT entries that bind a given export, so every call the module makes
//! through its import table reaches the replacement.

use std::ffi::{CStr, c_char};

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::memory::layout::pe;
use crate::memory::write_word;

/// Thunk format of a PE image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThunkFormat {
    Pe32,
    Pe32Plus,
}

impl ThunkFormat {
    fn width(self) -> usize {
        match self {
            Self::Pe32 => 4,
            Self::Pe32Plus => 8,
        }
    }

    fn ordinal_flag(self) -> u64 {
        match self {
            Self::Pe32 => pe::ORDINAL_FLAG_PE32,
            Self::Pe32Plus => pe::ORDINAL_FLAG_PE32_PLUS,
        }
    }
}

/// A module image mapped at `base`
struct MappedImage {
    base: *const u8,
    format: ThunkFormat,
    import_rva: usize,
    import_size: usize,
}

impl MappedImage {
    /// # Safety
    ///
    /// `base` must be the base address of a module mapped in this process.
    unsafe fn parse(base: *const u8) -> Result<Self> {
        if base.is_null() {
            return Err(Error::InvalidHandle("null module base"));
        }
        let invalid = |message: &str| Error::InvalidImage {
            base: base as usize,
            message: message.to_string(),
        };

        if unsafe { read_u16(base, 0) } != pe::DOS_SIGNATURE {
            return Err(invalid("missing DOS signature"));
        }
        let nt = unsafe { read_u32(base, pe::DOS_LFANEW) } as usize;
        if unsafe { read_u32(base, nt) } != pe::NT_SIGNATURE {
            return Err(invalid("missing NT signature"));
        }

        let optional = nt + pe::OPTIONAL_HEADER;
        let (format, directories) = match unsafe { read_u16(base, optional) } {
            pe::OPTIONAL_MAGIC_PE32 => (ThunkFormat::Pe32, optional + pe::DATA_DIRECTORY_PE32),
            pe::OPTIONAL_MAGIC_PE32_PLUS => (
                ThunkFormat::Pe32Plus,
                optional + pe::DATA_DIRECTORY_PE32_PLUS,
            ),
            _ => return Err(invalid("unknown optional header magic")),
        };
        if format.width() != size_of::<usize>() {
            return Err(invalid("image format does not match host pointer width"));
        }

        let entry = directories + pe::DIRECTORY_ENTRY_IMPORT * pe::DATA_DIRECTORY_ENTRY_SIZE;
        Ok(Self {
            base,
            format,
            import_rva: unsafe { read_u32(base, entry) } as usize,
            import_size: unsafe { read_u32(base, entry + 4) } as usize,
        })
    }

    /// Import descriptors as (dll name, lookup table rva, address table rva)
    unsafe fn descriptors(&self) -> Vec<(&[u8], usize, usize)> {
        let mut descriptors = Vec::new();
        if self.import_rva == 0 {
            return descriptors;
        }

        for index in 0..self.import_size / pe::import::SIZE {
            let at = self.import_rva + index * pe::import::SIZE;
            let lookup = unsafe { read_u32(self.base, at + pe::import::ORIGINAL_FIRST_THUNK) };
            let name = unsafe { read_u32(self.base, at + pe::import::NAME) };
            let address = unsafe { read_u32(self.base, at + pe::import::FIRST_THUNK) };
            if name == 0 && address == 0 {
                break;
            }
            // Images without a lookup table carry the names in the address table
            // until the loader binds it.
            let lookup = if lookup != 0 { lookup } else { address };
            let name = unsafe { read_cstr(self.base, name as usize) };
            descriptors.push((name, lookup as usize, address as usize));
        }
        descriptors
    }

    unsafe fn read_thunk(&self, offset: usize) -> u64 {
        match self.format {
            ThunkFormat::Pe32 => u64::from(unsafe { read_u32(self.base, offset) }),
            ThunkFormat::Pe32Plus => unsafe { read_u64(self.base, offset) },
        }
    }
}

/// Redirect every import of `dll!symbol` in the module at `base` to `replacement`.
///
/// The DLL name is matched case-insensitively and ordinal imports are skipped.
/// Returns the entries that were displaced, one per rewritten slot.
///
/// # Safety
///
/// `base` must be the base address of a module mapped in this process and
/// `replacement` must have the export's signature.
pub unsafe fn redirect_import(
    base: *const u8,
    dll: &str,
    symbol: &str,
    replacement: usize,
) -> Result<Vec<usize>> {
    let image = unsafe { MappedImage::parse(base) }?;
    let width = image.format.width();
    let mut displaced = Vec::new();

    for (name, lookup_rva, address_rva) in unsafe { image.descriptors() } {
        if !name.eq_ignore_ascii_case(dll.as_bytes()) {
            continue;
        }
        trace!("Scanning imports of {} in module {:#x}", dll, base as usize);

        for index in 0.. {
            let thunk = unsafe { image.read_thunk(lookup_rva + index * width) };
            if thunk == 0 {
                break;
            }
            if thunk & image.format.ordinal_flag() != 0 {
                continue;
            }

            let hint_name = (thunk & 0x7FFF_FFFF) as usize;
            let imported = unsafe { read_cstr(base, hint_name + pe::IMPORT_BY_NAME_NAME) };
            if imported != symbol.as_bytes() {
                continue;
            }

            let entry = unsafe { base.add(address_rva + index * width) } as *mut usize;
            let previous = unsafe { write_word(entry, replacement) }?;
            debug!(
                "Redirected {}!{} in module {:#x} ({:#x} -> {:#x})",
                dll, symbol, base as usize, previous, replacement
            );
            displaced.push(previous);
        }
    }

    Ok(displaced)
}

unsafe fn read_u16(base: *const u8, offset: usize) -> u16 {
    unsafe { base.add(offset).cast::<u16>().read_unaligned() }
}

unsafe fn read_u32(base: *const u8, offset: usize) -> u32 {
    unsafe { base.add(offset).cast::<u32>().read_unaligned() }
}

unsafe fn read_u64(base: *const u8, offset: usize) -> u64 {
    unsafe { base.add(offset).cast::<u64>().read_unaligned() }
}

unsafe fn read_cstr<'a>(base: *const u8, offset: usize) -> &'a [u8] {
    unsafe { CStr::from_ptr(base.add(offset).cast::<c_char>()) }.to_bytes()
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;

    const KERNEL32_INT: usize = 0x200;
    const KERNEL32_IAT: usize = 0x240;
    const D3D9_INT: usize = 0x280;
    const D3D9_IAT: usize = 0x2C0;

    /// PE32+ image with KERNEL32.dll and D3D9.DLL import descriptors.
    ///
    /// Backed by `u64`s so IAT entries are pointer-aligned.
    struct SyntheticImage {
        words: Vec<u64>,
    }

    impl SyntheticImage {
        fn new() -> Self {
            let mut image = Self {
                words: vec![0; 0x800 / 8],
            };

            image.put_u16(0, pe::DOS_SIGNATURE);
            image.put_u32(pe::DOS_LFANEW, 0x40);
            image.put_u32(0x40, pe::NT_SIGNATURE);
            image.put_u16(0x40 + pe::OPTIONAL_HEADER, pe::OPTIONAL_MAGIC_PE32_PLUS);
            let import_entry = 0x40
                + pe::OPTIONAL_HEADER
                + pe::DATA_DIRECTORY_PE32_PLUS
                + pe::DIRECTORY_ENTRY_IMPORT * pe::DATA_DIRECTORY_ENTRY_SIZE;
            image.put_u32(import_entry, 0x100);
            image.put_u32(import_entry + 4, 3 * pe::import::SIZE as u32);

            image.descriptor(0x100, KERNEL32_INT, 0x300, KERNEL32_IAT);
            image.descriptor(0x114, D3D9_INT, 0x310, D3D9_IAT);

            image.put_str(0x300, "KERNEL32.dll");
            image.put_str(0x310, "D3D9.DLL");
            image.put_str(0x400 + 2, "Sleep");
            image.put_str(0x420 + 2, "Direct3DCreate9");
            image.put_str(0x440 + 2, "Direct3DCreate9Ex");

            // KERNEL32 also lists a same-named import to prove DLL scoping.
            image.put_u64(KERNEL32_INT, 0x400);
            image.put_u64(KERNEL32_INT + 8, 0x420);
            image.put_u64(KERNEL32_IAT, 0xAAAA);
            image.put_u64(KERNEL32_IAT + 8, 0xBBBB);

            image.put_u64(D3D9_INT, pe::ORDINAL_FLAG_PE32_PLUS | 1);
            image.put_u64(D3D9_INT + 8, 0x420);
            image.put_u64(D3D9_INT + 16, 0x440);
            image.put_u64(D3D9_IAT, 0x1111);
            image.put_u64(D3D9_IAT + 8, 0x2222);
            image.put_u64(D3D9_IAT + 16, 0x3333);

            image
        }

        fn descriptor(&mut self, at: usize, lookup: usize, name: usize, address: usize) {
            self.put_u32(at + pe::import::ORIGINAL_FIRST_THUNK, lookup as u32);
            self.put_u32(at + pe::import::NAME, name as u32);
            self.put_u32(at + pe::import::FIRST_THUNK, address as u32);
        }

        fn bytes(&mut self) -> &mut [u8] {
            let len = self.words.len() * 8;
            unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr().cast::<u8>(), len) }
        }

        fn base(&mut self) -> *const u8 {
            self.words.as_mut_ptr().cast_const().cast()
        }

        fn put_u16(&mut self, at: usize, value: u16) {
            self.bytes()[at..at + 2].copy_from_slice(&value.to_le_bytes());
        }

        fn put_u32(&mut self, at: usize, value: u32) {
            self.bytes()[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }

        fn put_u64(&mut self, at: usize, value: u64) {
            self.bytes()[at..at + 8].copy_from_slice(&value.to_le_bytes());
        }

        fn put_str(&mut self, at: usize, value: &str) {
            self.bytes()[at..at + value.len()].copy_from_slice(value.as_bytes());
        }

        fn word(&self, at: usize) -> u64 {
            self.words[at / 8]
        }
    }

    #[test]
    fn test_redirect_matching_import_only() {
        let mut image = SyntheticImage::new();
        let base = image.base();

        let displaced =
            unsafe { redirect_import(base, "d3d9.dll", "Direct3DCreate9", 0x9999) }.unwrap();

        assert_eq!(displaced, vec![0x2222]);
        assert_eq!(image.word(D3D9_IAT), 0x1111);
        assert_eq!(image.word(D3D9_IAT + 8), 0x9999);
        assert_eq!(image.word(D3D9_IAT + 16), 0x3333);
        assert_eq!(image.word(KERNEL32_IAT + 8), 0xBBBB);
    }

    #[test]
    fn test_redirect_missing_symbol_changes_nothing() {
        let mut image = SyntheticImage::new();
        let base = image.base();

        let displaced =
            unsafe { redirect_import(base, "d3d9.dll", "Direct3DCreate9On12", 0x9999) }.unwrap();
        assert!(displaced.is_empty());

        let displaced =
            unsafe { redirect_import(base, "d3d8.dll", "Direct3DCreate9", 0x9999) }.unwrap();
        assert!(displaced.is_empty());
        assert_eq!(image.word(D3D9_IAT + 8), 0x2222);
    }

    #[test]
    fn test_redirect_without_lookup_table_uses_address_table() {
        let mut image = SyntheticImage::new();
        image.put_u32(0x114 + pe::import::ORIGINAL_FIRST_THUNK, 0);
        // Unbound address table still holds the hint/name RVAs.
        image.put_u64(D3D9_IAT, pe::ORDINAL_FLAG_PE32_PLUS | 1);
        image.put_u64(D3D9_IAT + 8, 0x420);
        image.put_u64(D3D9_IAT + 16, 0x440);
        let base = image.base();

        let displaced =
            unsafe { redirect_import(base, "D3D9.dll", "Direct3DCreate9", 0x9999) }.unwrap();

        assert_eq!(displaced, vec![0x420]);
        assert_eq!(image.word(D3D9_IAT + 8), 0x9999);
    }

    #[test]
    fn test_reject_invalid_images() {
        let result = unsafe { redirect_import(std::ptr::null(), "d3d9.dll", "x", 1) };
        assert!(matches!(result, Err(Error::InvalidHandle(_))));

        let mut image = SyntheticImage::new();
        image.put_u32(0x40, 0);
        let result = unsafe { redirect_import(image.base(), "d3d9.dll", "x", 1) };
        assert!(matches!(result, Err(Error::InvalidImage { .. })));

        let mut image = SyntheticImage::new();
        image.put_u16(0x40 + pe::OPTIONAL_HEADER, pe::OPTIONAL_MAGIC_PE32);
        let result = unsafe { redirect_import(image.base(), "d3d9.dll", "x", 1) };
        assert!(matches!(result, Err(Error::InvalidImage { message, .. }) if message.contains("pointer width")));
    }
}
