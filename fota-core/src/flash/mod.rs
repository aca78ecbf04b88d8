//! Flash access behind a small trait, plus the OTA slot layout kept in it.
//!
//! Implementations run each erase/program with whatever exclusion the platform
//! needs (interrupts off on a microcontroller). A failed page operation is
//! reported, never retried here.

mod file;
mod mem;
pub mod metadata;
pub mod slots;

use std::io;

use serde::Deserialize;

pub use file::FileFlash;
pub use mem::MemFlash;
pub use metadata::{OtaMetadata, METADATA_LENGTH, OTA_METADATA_SPACE};
pub use slots::{SlotError, SlotLayout, SlotManager, Verification};

/// Byte value of erased flash.
pub const ERASED_BYTE: u8 = 0xFF;

/// Flash address space: `page_count` pages of `page_size` bytes starting at `base_address`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlashGeometry {
    pub base_address: u32,
    pub page_size: u32,
    pub page_count: u32,
}

impl FlashGeometry {
    pub fn page_address(&self, page: u32) -> u32 {
        self.base_address + page * self.page_size
    }

    pub fn size(&self) -> u64 {
        u64::from(self.page_size) * u64::from(self.page_count)
    }

    /// Offset of `address` from the start of flash, if `[address, address+len)` is inside it.
    pub fn offset_of(&self, address: u32, len: usize) -> Option<u64> {
        let offset = u64::from(address.checked_sub(self.base_address)?);
        (offset + len as u64 <= self.size()).then_some(offset)
    }

    fn check_page(&self, page: u32) -> Result<(), FlashError> {
        if page < self.page_count {
            Ok(())
        } else {
            Err(FlashError::InvalidPage(page))
        }
    }

    fn check_page_data(&self, page: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check_page(page)?;
        if data.len() > self.page_size as usize {
            return Err(FlashError::DataTooLarge {
                page,
                len: data.len(),
            });
        }
        Ok(())
    }
}

/// Page-granular flash.
pub trait Flash {
    fn geometry(&self) -> FlashGeometry;

    /// Read `buf.len()` bytes starting at `address`.
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Erase `page`, program `data` at its start (the rest stays erased) and read it back.
    fn write_page(&mut self, page: u32, data: &[u8]) -> Result<(), FlashError>;

    fn erase_page(&mut self, page: u32) -> Result<(), FlashError>;
}

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("{len} bytes at {address:#010x} fall outside flash")]
    OutOfBounds { address: u32, len: usize },
    #[error("page {0} does not exist")]
    InvalidPage(u32),
    #[error("{len} bytes do not fit in page {page}")]
    DataTooLarge { page: u32, len: usize },
    #[error("programming page {page} failed")]
    WriteFailed { page: u32 },
    #[error("page {page} does not read back what was written")]
    VerifyFailed { page: u32 },
    #[error("flash i/o: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_stay_inside_flash() {
        let g = FlashGeometry {
            base_address: 0x0800_0000,
            page_size: 1024,
            page_count: 4,
        };
        assert_eq!(g.page_address(2), 0x0800_0800);
        assert_eq!(g.offset_of(0x0800_0010, 16), Some(0x10));
        assert_eq!(g.offset_of(0x0800_0C00, 1024), Some(0xC00));
        assert_eq!(g.offset_of(0x0800_0C00, 1025), None);
        assert_eq!(g.offset_of(0x0700_0000, 1), None);
    }
}
