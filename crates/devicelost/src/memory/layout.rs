//! Memory layout constants for the structures this crate walks or patches.
//!
//! Constants are organized by structure type.

/// Portable Executable image layout (offsets relative to the image base or
/// to the start of the named header)
pub mod pe {
    /// `MZ`
    pub const DOS_SIGNATURE: u16 = 0x5A4D;
    /// Offset of `e_lfanew` in the DOS header
    pub const DOS_LFANEW: usize = 0x3C;

    /// `PE\0\0`
    pub const NT_SIGNATURE: u32 = 0x0000_4550;
    /// Signature (4) + IMAGE_FILE_HEADER (20)
    pub const OPTIONAL_HEADER: usize = 24;

    pub const OPTIONAL_MAGIC_PE32: u16 = 0x10B;
    pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20B;

    /// Offset of the data directory array inside the optional header
    pub const DATA_DIRECTORY_PE32: usize = 96;
    pub const DATA_DIRECTORY_PE32_PLUS: usize = 112;
    /// Each directory entry is (rva: u32, size: u32)
    pub const DATA_DIRECTORY_ENTRY_SIZE: usize = 8;
    pub const DIRECTORY_ENTRY_IMPORT: usize = 1;

    /// IMAGE_IMPORT_DESCRIPTOR layout
    pub mod import {
        pub const SIZE: usize = 20;
        pub const ORIGINAL_FIRST_THUNK: usize = 0;
        pub const NAME: usize = 12;
        pub const FIRST_THUNK: usize = 16;
    }

    /// IMAGE_IMPORT_BY_NAME: hint (u16) followed by the name
    pub const IMPORT_BY_NAME_NAME: usize = 2;

    pub const ORDINAL_FLAG_PE32: u64 = 0x8000_0000;
    pub const ORDINAL_FLAG_PE32_PLUS: u64 = 0x8000_0000_0000_0000;
}

/// Timing constants for the recovery loop
pub mod timing {
    /// Bounded wait between cooperative level queries while the device is lost (ms)
    pub const LOST_POLL_INTERVAL_MS: u64 = 10;
}
